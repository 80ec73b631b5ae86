use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::PayloadError;
use crate::loader::{Class, ClassLoader, INFRASTRUCTURE_ERROR_CLASS};

pub const NULL_TYPE: &str = "wpx.internal.NullArgument";
pub const BOOL_TYPE: &str = "wpx.lang.Boolean";
pub const INT_TYPE: &str = "wpx.lang.Long";
pub const FLOAT_TYPE: &str = "wpx.lang.Double";
pub const STRING_TYPE: &str = "wpx.lang.String";
pub const BYTES_TYPE: &str = "wpx.lang.Bytes";
pub const LIST_TYPE: &str = "wpx.lang.List";
pub const MAP_TYPE: &str = "wpx.lang.Map";
pub const PROXY_TYPE: &str = "wpx.lang.Proxy";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(Object),
    Proxy(Proxy),
    Error(RemoteError),
}

impl Value {
    /// Runtime type name, used to pick an argument serializer.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => NULL_TYPE,
            Value::Bool(_) => BOOL_TYPE,
            Value::Int(_) => INT_TYPE,
            Value::Float(_) => FLOAT_TYPE,
            Value::Str(_) => STRING_TYPE,
            Value::Bytes(_) => BYTES_TYPE,
            Value::List(_) => LIST_TYPE,
            Value::Map(_) => MAP_TYPE,
            Value::Object(obj) => obj.class.name(),
            Value::Proxy(_) => PROXY_TYPE,
            Value::Error(err) => err.class.name(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Converts plain serde data into an untyped value tree.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to serde data. Classes are dropped; errors become their
    /// message.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(b.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Object(obj) => serde_json::Value::Object(
                obj.fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Proxy(proxy) => proxy.handler.to_json(),
            Value::Error(err) => serde_json::Value::String(err.to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// An instance of a loader-defined class.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub class: Class,
    pub fields: BTreeMap<String, Value>,
}

impl Object {
    pub fn new(class: Class) -> Self {
        Self {
            class,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Builds an object from a serde struct; the struct must serialize to a map.
    pub fn from_serde<T: Serialize>(class: Class, data: &T) -> Result<Self, PayloadError> {
        match Value::from_json(serde_json::to_value(data)?) {
            Value::Map(fields) => Ok(Self { class, fields }),
            other => Err(PayloadError::Malformed(format!(
                "expected a struct for {}, got {}",
                class.name(),
                other.type_name()
            ))),
        }
    }

    pub fn to_serde<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let json = serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        );
        Ok(serde_json::from_value(json)?)
    }
}

/// A value that exposes a set of interfaces. The receiver rebuilds it from the
/// interface list; the concrete proxy type is never named on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    pub interfaces: Vec<Class>,
    pub handler: Box<Value>,
}

/// A failure raised on the far side of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub class: Class,
    /// Set when `class` is the placeholder standing in for an unloadable type.
    pub original_class_name: Option<String>,
    pub message: String,
    pub cause: Option<Box<RemoteError>>,
    pub stack: Vec<String>,
}

impl RemoteError {
    pub fn new(class: Class, message: impl Into<String>) -> Self {
        Self {
            class,
            original_class_name: None,
            message: message.into(),
            cause: None,
            stack: Vec::new(),
        }
    }

    /// An error of a system class, e.g. [`crate::loader::ILLEGAL_STATE_CLASS`].
    pub fn system(
        system: &Arc<ClassLoader>,
        class_name: &str,
        message: impl Into<String>,
    ) -> Result<Self, PayloadError> {
        Ok(Self::new(system.load_class(class_name)?, message))
    }

    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        self.stack = stack;
        self
    }

    /// The type the error was raised as, even if it arrived as a placeholder.
    pub fn class_name(&self) -> &str {
        self.original_class_name
            .as_deref()
            .unwrap_or_else(|| self.class.name())
    }

    pub fn is_infrastructure(&self) -> bool {
        self.class_name() == INFRASTRUCTURE_ERROR_CLASS
    }

    pub fn causes(&self) -> impl Iterator<Item = &RemoteError> {
        std::iter::successors(self.cause.as_deref(), |err| err.cause.as_deref())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name(), self.message)?;
        for cause in self.causes() {
            write!(f, "; caused by {}: {}", cause.class_name(), cause.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
