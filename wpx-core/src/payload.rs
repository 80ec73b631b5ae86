//! Classloader-aware serialization of [`Value`] graphs.
//!
//! Every class written to a payload is tagged with a per-payload short id that
//! maps to a [`ClassLoaderDetails`] in the payload header. The receiver
//! resolves each details entry to a live loader through its
//! [`ClassLoaderCache`], rebuilding parents first, and loads the class there.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::codec::{Decoder, Encoder, CHUNK_SIZE};
use crate::error::PayloadError;
use crate::loader::{
    Class, ClassLoader, ClassLoaderDetails, ClassLoaderSpec, LoaderId, TypeSource,
    PLACEHOLDER_ERROR_CLASS, PLACEHOLDER_PACKAGE,
};
use crate::value::{Object, Proxy, RemoteError, Value};

/// Loader id written for classes of [`PLACEHOLDER_PACKAGE`].
pub const PLACEHOLDER_LOADER_ID: u16 = 0;

/// Most distinct loaders one payload can reference.
pub const MAX_LOADERS_PER_PAYLOAD: usize = i16::MAX as usize;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryOptions {
    /// Keep a client-owned loader's identity when its classpath grows, so the
    /// receiver appends the new entries to its cached loader instead of
    /// building a fresh one. Classes already loaded keep their old definitions.
    pub reuse_client_owned_loaders: bool,
}

/// Immutable serialized form: loader header plus raw body chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerializedPayload {
    pub loaders: BTreeMap<u16, ClassLoaderDetails>,
    pub chunks: Vec<Bytes>,
}

impl SerializedPayload {
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.loaders.is_empty() && self.chunks.is_empty()
    }

    pub fn write_to(&self, enc: &mut Encoder) -> Result<(), PayloadError> {
        enc.write_bytes(&serde_json::to_vec(&self.loaders)?);
        enc.write_u32(self.chunks.len() as u32);
        for chunk in &self.chunks {
            enc.write_bytes(chunk);
        }
        Ok(())
    }

    pub fn read_from(dec: &mut Decoder) -> Result<Self, PayloadError> {
        let loaders: BTreeMap<u16, ClassLoaderDetails> = serde_json::from_slice(&dec.read_bytes()?)?;
        let count = dec.read_u32()? as usize;
        let mut chunks = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            chunks.push(dec.read_bytes()?);
        }
        Ok(Self { loaders, chunks })
    }
}

#[derive(Default)]
struct CacheTables {
    details_by_loader: HashMap<LoaderId, Arc<ClassLoaderDetails>>,
    loaders_by_uuid: HashMap<Uuid, Arc<ClassLoader>>,
}

/// Bridges live loaders and their details in both directions. Entries live as
/// long as the cache; the same uuid always yields the same loader instance.
pub struct ClassLoaderCache {
    system: Arc<ClassLoader>,
    system_details: Arc<ClassLoaderDetails>,
    source: Arc<dyn TypeSource>,
    options: RegistryOptions,
    tables: Mutex<CacheTables>,
}

impl ClassLoaderCache {
    pub fn new(system: Arc<ClassLoader>, source: Arc<dyn TypeSource>, options: RegistryOptions) -> Self {
        let system_details = Arc::new(ClassLoaderDetails {
            uuid: Uuid::new_v4(),
            spec: ClassLoaderSpec::System,
            parents: Vec::new(),
        });
        Self {
            system,
            system_details,
            source,
            options,
            tables: Mutex::new(CacheTables::default()),
        }
    }

    pub fn system(&self) -> &Arc<ClassLoader> {
        &self.system
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, CacheTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Details describing `loader`, created on first sight.
    pub fn details_for(&self, loader: &Arc<ClassLoader>) -> Arc<ClassLoaderDetails> {
        if loader.is_system() {
            return Arc::clone(&self.system_details);
        }

        let spec = loader.spec();
        let previous = self.tables().details_by_loader.get(&loader.id()).cloned();
        let uuid = match previous {
            Some(details) if details.spec == spec => return details,
            Some(details) if loader.is_client_owned() && self.options.reuse_client_owned_loaders => {
                debug!(loader = %loader, "client-owned classpath changed; keeping loader identity");
                details.uuid
            }
            _ => Uuid::new_v4(),
        };

        // Parents are resolved before taking the lock; the recursion re-enters it.
        let parents: Vec<ClassLoaderDetails> = if loader.parents().is_empty() {
            vec![(*self.system_details).clone()]
        } else {
            loader
                .parents()
                .iter()
                .map(|parent| (*self.details_for(parent)).clone())
                .collect()
        };

        let details = Arc::new(ClassLoaderDetails { uuid, spec, parents });
        let mut tables = self.tables();
        tables
            .details_by_loader
            .insert(loader.id(), Arc::clone(&details));
        tables
            .loaders_by_uuid
            .entry(uuid)
            .or_insert_with(|| Arc::clone(loader));
        details
    }

    /// The live loader for `details`, constructing it (and its parents) on a miss.
    pub fn loader_for(&self, details: &ClassLoaderDetails) -> Result<Arc<ClassLoader>, PayloadError> {
        if details.spec == ClassLoaderSpec::System {
            if !details.parents.is_empty() {
                return Err(PayloadError::Malformed("system loader details with parents".into()));
            }
            return Ok(Arc::clone(&self.system));
        }

        let cached = self.tables().loaders_by_uuid.get(&details.uuid).cloned();
        if let Some(loader) = cached {
            if let ClassLoaderSpec::ClientOwned { classpath } = &details.spec {
                if self.options.reuse_client_owned_loaders && loader.is_client_owned() {
                    let added = loader.append_classpath(classpath);
                    if added > 0 {
                        debug!(loader = %loader, added, "appended entries to shared client-owned loader");
                    }
                }
            }
            return Ok(loader);
        }

        let parents = details
            .parents
            .iter()
            .map(|parent| self.loader_for(parent))
            .collect::<Result<Vec<_>, _>>()?;
        let created = match &details.spec {
            ClassLoaderSpec::System => unreachable!("handled above"),
            ClassLoaderSpec::Classpath { name, classpath } => ClassLoader::classpath_loader(
                name.clone(),
                classpath.clone(),
                parents,
                Arc::clone(&self.source),
            ),
            ClassLoaderSpec::ClientOwned { classpath } => {
                ClassLoader::client_owned(classpath.iter().cloned(), parents, Arc::clone(&self.source))
            }
        };

        // A concurrent fill may have won; keep whichever instance landed first.
        let mut tables = self.tables();
        let loader = Arc::clone(
            tables
                .loaders_by_uuid
                .entry(details.uuid)
                .or_insert(created),
        );
        tables
            .details_by_loader
            .entry(loader.id())
            .or_insert_with(|| Arc::new(details.clone()));
        trace!(uuid = %details.uuid, loader = %loader, "resolved classloader details");
        Ok(loader)
    }
}

/// Hands out per-payload sessions over a shared [`ClassLoaderCache`].
pub struct PayloadClassLoaderRegistry {
    cache: ClassLoaderCache,
}

impl PayloadClassLoaderRegistry {
    pub fn new(system: Arc<ClassLoader>, source: Arc<dyn TypeSource>, options: RegistryOptions) -> Self {
        Self {
            cache: ClassLoaderCache::new(system, source, options),
        }
    }

    pub fn system(&self) -> &Arc<ClassLoader> {
        self.cache.system()
    }

    pub fn cache(&self) -> &ClassLoaderCache {
        &self.cache
    }

    pub fn new_serialize_session(&self) -> SerializeSession<'_> {
        SerializeSession {
            cache: &self.cache,
            ids: HashMap::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn new_deserialize_session(&self) -> DeserializeSession<'_> {
        DeserializeSession {
            cache: &self.cache,
            loaders: HashMap::new(),
        }
    }
}

pub struct SerializeSession<'a> {
    cache: &'a ClassLoaderCache,
    ids: HashMap<LoaderId, u16>,
    details: BTreeMap<u16, Arc<ClassLoaderDetails>>,
}

impl SerializeSession<'_> {
    /// Short id of the loader defining `class`, assigned sequentially from 1.
    pub fn visit_class(&mut self, class: &Class) -> Result<u16, PayloadError> {
        let loader = class.loader();
        if let Some(id) = self.ids.get(&loader.id()) {
            return Ok(*id);
        }
        let next = self.ids.len() + 1;
        if next > MAX_LOADERS_PER_PAYLOAD {
            return Err(PayloadError::TooManyClassLoaders {
                limit: MAX_LOADERS_PER_PAYLOAD,
            });
        }
        let id = next as u16;
        self.ids.insert(loader.id(), id);
        self.details.insert(id, self.cache.details_for(loader));
        Ok(id)
    }

    pub fn collect_class_loader_definitions(&self, out: &mut BTreeMap<u16, ClassLoaderDetails>) {
        for (id, details) in &self.details {
            out.insert(*id, (**details).clone());
        }
    }
}

pub struct DeserializeSession<'a> {
    cache: &'a ClassLoaderCache,
    loaders: HashMap<Uuid, Arc<ClassLoader>>,
}

impl DeserializeSession<'_> {
    pub fn resolve_class(
        &mut self,
        details: &ClassLoaderDetails,
        class_name: &str,
    ) -> Result<Class, PayloadError> {
        let loader = match self.loaders.get(&details.uuid) {
            Some(loader) => Arc::clone(loader),
            None => {
                let loader = self.cache.loader_for(details)?;
                self.loaders.insert(details.uuid, Arc::clone(&loader));
                loader
            }
        };
        loader.load_class(class_name)
    }

    fn system(&self) -> &Arc<ClassLoader> {
        self.cache.system()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireClass {
    loader: u16,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireError {
    class: WireClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original: Option<String>,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<WireError>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stack: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Object {
        class: WireClass,
        fields: BTreeMap<String, WireValue>,
    },
    Proxy {
        interfaces: Vec<WireClass>,
        handler: Box<WireValue>,
    },
    Error(WireError),
}

/// Serializes values through a [`PayloadClassLoaderRegistry`].
#[derive(Clone)]
pub struct PayloadSerializer {
    registry: Arc<PayloadClassLoaderRegistry>,
}

impl PayloadSerializer {
    pub fn new(registry: Arc<PayloadClassLoaderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PayloadClassLoaderRegistry> {
        &self.registry
    }

    pub fn serialize(&self, value: &Value) -> Result<SerializedPayload, PayloadError> {
        if value.is_null() {
            return Ok(SerializedPayload::null());
        }
        let mut session = self.registry.new_serialize_session();
        let wire = encode_value(value, &mut session)?;
        let body = serde_json::to_vec(&wire)?;

        let mut loaders = BTreeMap::new();
        session.collect_class_loader_definitions(&mut loaders);
        let body = Bytes::from(body);
        let chunks = (0..body.len())
            .step_by(CHUNK_SIZE)
            .map(|start| body.slice(start..(start + CHUNK_SIZE).min(body.len())))
            .collect();
        Ok(SerializedPayload { loaders, chunks })
    }

    pub fn deserialize(&self, payload: &SerializedPayload) -> Result<Value, PayloadError> {
        if payload.chunks.is_empty() {
            return Ok(Value::Null);
        }
        let mut body = BytesMut::new();
        for chunk in &payload.chunks {
            body.extend_from_slice(chunk);
        }
        let wire: WireValue = serde_json::from_slice(&body)?;
        let mut session = self.registry.new_deserialize_session();
        decode_value(wire, &payload.loaders, &mut session)
    }

    pub fn serialize_to(&self, value: &Value, enc: &mut Encoder) -> Result<(), PayloadError> {
        self.serialize(value)?.write_to(enc)
    }

    pub fn deserialize_from(&self, dec: &mut Decoder) -> Result<Value, PayloadError> {
        let payload = SerializedPayload::read_from(dec)?;
        self.deserialize(&payload)
    }
}

fn encode_class(class: &Class, session: &mut SerializeSession<'_>) -> Result<WireClass, PayloadError> {
    let loader = if class.package() == PLACEHOLDER_PACKAGE {
        PLACEHOLDER_LOADER_ID
    } else {
        session.visit_class(class)?
    };
    Ok(WireClass {
        loader,
        name: class.name().to_string(),
    })
}

fn encode_error(err: &RemoteError, session: &mut SerializeSession<'_>) -> Result<WireError, PayloadError> {
    Ok(WireError {
        class: encode_class(&err.class, session)?,
        original: err.original_class_name.clone(),
        message: err.message.clone(),
        cause: match &err.cause {
            Some(cause) => Some(Box::new(encode_error(cause, session)?)),
            None => None,
        },
        stack: err.stack.clone(),
    })
}

fn encode_value(value: &Value, session: &mut SerializeSession<'_>) -> Result<WireValue, PayloadError> {
    Ok(match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => WireValue::Int(*i),
        Value::Float(f) => WireValue::Float(*f),
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::Bytes(b) => WireValue::Bytes(b.clone()),
        Value::List(items) => WireValue::List(
            items
                .iter()
                .map(|item| encode_value(item, session))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => WireValue::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), encode_value(v, session)?)))
                .collect::<Result<_, PayloadError>>()?,
        ),
        Value::Object(obj) => WireValue::Object {
            class: encode_class(&obj.class, session)?,
            fields: obj
                .fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), encode_value(v, session)?)))
                .collect::<Result<_, PayloadError>>()?,
        },
        Value::Proxy(proxy) => WireValue::Proxy {
            interfaces: proxy
                .interfaces
                .iter()
                .map(|iface| encode_class(iface, session))
                .collect::<Result<_, _>>()?,
            handler: Box::new(encode_value(&proxy.handler, session)?),
        },
        Value::Error(err) => WireValue::Error(encode_error(err, session)?),
    })
}

fn decode_class(
    wire: &WireClass,
    loaders: &BTreeMap<u16, ClassLoaderDetails>,
    session: &mut DeserializeSession<'_>,
) -> Result<Class, PayloadError> {
    if wire.loader == PLACEHOLDER_LOADER_ID {
        if !wire.name.starts_with(PLACEHOLDER_PACKAGE) {
            return Err(PayloadError::ReservedLoaderId {
                expected: PLACEHOLDER_PACKAGE,
                class_name: wire.name.clone(),
            });
        }
        return session.system().load_class(&wire.name);
    }
    let details = loaders
        .get(&wire.loader)
        .ok_or(PayloadError::UnknownLoaderId(wire.loader))?;
    session.resolve_class(details, &wire.name)
}

fn decode_error(
    wire: WireError,
    loaders: &BTreeMap<u16, ClassLoaderDetails>,
    session: &mut DeserializeSession<'_>,
) -> Result<RemoteError, PayloadError> {
    let (class, original) = match decode_class(&wire.class, loaders, session) {
        Ok(class) => (class, wire.original),
        Err(PayloadError::ClassNotFound { class_name, .. }) => {
            debug!(class = %class_name, "error type not loadable here; using placeholder");
            let placeholder = session.system().load_class(PLACEHOLDER_ERROR_CLASS)?;
            (placeholder, Some(wire.original.unwrap_or(class_name)))
        }
        Err(err) => return Err(err),
    };
    Ok(RemoteError {
        class,
        original_class_name: original,
        message: wire.message,
        cause: match wire.cause {
            Some(cause) => Some(Box::new(decode_error(*cause, loaders, session)?)),
            None => None,
        },
        stack: wire.stack,
    })
}

fn decode_value(
    wire: WireValue,
    loaders: &BTreeMap<u16, ClassLoaderDetails>,
    session: &mut DeserializeSession<'_>,
) -> Result<Value, PayloadError> {
    Ok(match wire {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(i) => Value::Int(i),
        WireValue::Float(f) => Value::Float(f),
        WireValue::Str(s) => Value::Str(s),
        WireValue::Bytes(b) => Value::Bytes(b),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| decode_value(item, loaders, session))
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, decode_value(v, loaders, session)?)))
                .collect::<Result<_, PayloadError>>()?,
        ),
        WireValue::Object { class, fields } => Value::Object(Object {
            class: decode_class(&class, loaders, session)?,
            fields: fields
                .into_iter()
                .map(|(k, v)| Ok((k, decode_value(v, loaders, session)?)))
                .collect::<Result<_, PayloadError>>()?,
        }),
        WireValue::Proxy { interfaces, handler } => Value::Proxy(Proxy {
            interfaces: interfaces
                .iter()
                .map(|iface| decode_class(iface, loaders, session))
                .collect::<Result<_, _>>()?,
            handler: Box::new(decode_value(*handler, loaders, session)?),
        }),
        WireValue::Error(err) => Value::Error(decode_error(err, loaders, session)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{StaticTypeSource, ILLEGAL_STATE_CLASS};

    fn source() -> Arc<dyn TypeSource> {
        Arc::new(
            StaticTypeSource::new()
                .with_types("api.jar", ["org.api.Spec", "org.api.Listener"])
                .with_types("impl.jar", ["org.impl.CompilerError"])
                .with_types("extra.jar", ["org.extra.Plugin"]),
        )
    }

    struct Side {
        serializer: PayloadSerializer,
    }

    impl Side {
        fn new(options: RegistryOptions) -> Self {
            let source = source();
            let system = ClassLoader::system(Vec::new(), Arc::clone(&source));
            let registry = Arc::new(PayloadClassLoaderRegistry::new(system, source, options));
            Self {
                serializer: PayloadSerializer::new(registry),
            }
        }

        fn system(&self) -> Arc<ClassLoader> {
            Arc::clone(self.serializer.registry().system())
        }
    }

    fn api_loader(side: &Side) -> Arc<ClassLoader> {
        ClassLoader::classpath_loader("api", vec!["api.jar".into()], vec![side.system()], source())
    }

    #[test]
    fn null_payload_round_trips_without_body() {
        let side = Side::new(RegistryOptions::default());
        let payload = side.serializer.serialize(&Value::Null).unwrap();
        assert!(payload.is_null());
        assert_eq!(side.serializer.deserialize(&payload).unwrap(), Value::Null);
    }

    #[test]
    fn round_trip_rebuilds_loader_topology() {
        let coordinator = Side::new(RegistryOptions::default());
        let worker = Side::new(RegistryOptions::default());

        let api = api_loader(&coordinator);
        let spec = api.load_class("org.api.Spec").unwrap();
        let value = Value::List(vec![
            Value::Object(Object::new(spec.clone()).with_field("name", "main")),
            Value::Object(Object::new(spec).with_field("name", "test")),
        ]);

        let payload = coordinator.serializer.serialize(&value).unwrap();
        assert_eq!(payload.loaders.len(), 1);
        let details = payload.loaders.get(&1).unwrap();
        assert_eq!(details.parents.len(), 1);
        assert_eq!(details.parents[0].spec, ClassLoaderSpec::System);

        let decoded = worker.serializer.deserialize(&payload).unwrap();
        let Value::List(items) = decoded else {
            panic!("expected list");
        };
        let first = items[0].as_object().unwrap();
        let second = items[1].as_object().unwrap();
        assert_eq!(first.class.name(), "org.api.Spec");
        assert!(Arc::ptr_eq(first.class.loader(), second.class.loader()));
        assert_eq!(
            first.class.loader().spec(),
            ClassLoaderSpec::Classpath {
                name: "api".into(),
                classpath: vec!["api.jar".into()]
            }
        );
        assert!(Arc::ptr_eq(&first.class.loader().parents()[0], worker.serializer.registry().system()));
    }

    #[test]
    fn same_details_resolve_to_same_loader_instance() {
        let worker = Side::new(RegistryOptions::default());
        let details = ClassLoaderDetails {
            uuid: Uuid::new_v4(),
            spec: ClassLoaderSpec::Classpath {
                name: "api".into(),
                classpath: vec!["api.jar".into()],
            },
            parents: Vec::new(),
        };
        let cache = worker.serializer.registry().cache();
        let a = cache.loader_for(&details).unwrap();
        let b = cache.loader_for(&details).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn results_map_back_to_original_loader() {
        let coordinator = Side::new(RegistryOptions::default());
        let worker = Side::new(RegistryOptions::default());

        let api = api_loader(&coordinator);
        let value = Value::Object(Object::new(api.load_class("org.api.Spec").unwrap()));
        let on_worker = worker
            .serializer
            .deserialize(&coordinator.serializer.serialize(&value).unwrap())
            .unwrap();
        let back = coordinator
            .serializer
            .deserialize(&worker.serializer.serialize(&on_worker).unwrap())
            .unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn unknown_class_fails_deserialize() {
        let coordinator = Side::new(RegistryOptions::default());
        let worker = Side::new(RegistryOptions::default());
        let extra = ClassLoader::classpath_loader("extra", vec!["extra.jar".into()], Vec::new(), source());
        let plugin = extra.load_class("org.extra.Plugin").unwrap();
        let mut payload = coordinator
            .serializer
            .serialize(&Value::Object(Object::new(plugin)))
            .unwrap();
        // Point the loader at a classpath that does not define the type.
        let details = payload.loaders.get_mut(&1).unwrap();
        details.spec = ClassLoaderSpec::Classpath {
            name: "extra".into(),
            classpath: vec!["api.jar".into()],
        };
        let err = worker.serializer.deserialize(&payload).unwrap_err();
        assert!(matches!(err, PayloadError::ClassNotFound { .. }));
    }

    #[test]
    fn unloadable_error_type_becomes_placeholder() {
        let coordinator = Side::new(RegistryOptions::default());
        let worker = Side::new(RegistryOptions::default());
        let loader = ClassLoader::classpath_loader("impl", vec!["impl.jar".into()], Vec::new(), source());
        let err = RemoteError::new(loader.load_class("org.impl.CompilerError").unwrap(), "bad input")
            .with_cause(RemoteError::system(&worker.system(), ILLEGAL_STATE_CLASS, "root").unwrap());
        let mut payload = worker.serializer.serialize(&Value::Error(err)).unwrap();
        for details in payload.loaders.values_mut() {
            if let ClassLoaderSpec::Classpath { classpath, .. } = &mut details.spec {
                classpath.clear();
            }
        }

        let Value::Error(decoded) = coordinator.serializer.deserialize(&payload).unwrap() else {
            panic!("expected error");
        };
        assert!(decoded.class.is_placeholder());
        assert_eq!(decoded.class_name(), "org.impl.CompilerError");
        assert_eq!(decoded.message, "bad input");
        assert_eq!(decoded.cause.as_ref().unwrap().class_name(), ILLEGAL_STATE_CLASS);

        // Forwarding the placeholder uses the reserved id and keeps the original name.
        let again = worker.serializer.serialize(&Value::Error(decoded)).unwrap();
        assert!(again.loaders.values().all(|d| d.spec == ClassLoaderSpec::System));
        let Value::Error(forwarded) = worker.serializer.deserialize(&again).unwrap() else {
            panic!("expected error");
        };
        assert_eq!(forwarded.class_name(), "org.impl.CompilerError");
    }

    #[test]
    fn proxies_carry_each_interface() {
        let coordinator = Side::new(RegistryOptions::default());
        let worker = Side::new(RegistryOptions::default());
        let api = api_loader(&coordinator);
        let proxy = Value::Proxy(Proxy {
            interfaces: vec![
                api.load_class("org.api.Listener").unwrap(),
                coordinator.system().load_class(ILLEGAL_STATE_CLASS).unwrap(),
            ],
            handler: Box::new(Value::from("handler")),
        });
        let payload = coordinator.serializer.serialize(&proxy).unwrap();
        assert_eq!(payload.loaders.len(), 2);
        let Value::Proxy(decoded) = worker.serializer.deserialize(&payload).unwrap() else {
            panic!("expected proxy");
        };
        assert_eq!(decoded.interfaces.len(), 2);
        assert_eq!(decoded.interfaces[0].name(), "org.api.Listener");
        assert!(decoded.interfaces[1].loader().is_system());
    }

    #[test]
    fn placeholder_id_rejects_other_packages() {
        let worker = Side::new(RegistryOptions::default());
        let body = serde_json::to_vec(&WireValue::Object {
            class: WireClass {
                loader: PLACEHOLDER_LOADER_ID,
                name: "org.api.Spec".into(),
            },
            fields: BTreeMap::new(),
        })
        .unwrap();
        let payload = SerializedPayload {
            loaders: BTreeMap::new(),
            chunks: vec![Bytes::from(body)],
        };
        let err = worker.serializer.deserialize(&payload).unwrap_err();
        assert!(matches!(err, PayloadError::ReservedLoaderId { .. }));
    }

    #[test]
    fn too_many_loaders_fail_the_session() {
        let side = Side::new(RegistryOptions::default());
        let source: Arc<dyn TypeSource> = Arc::new(StaticTypeSource::new().with_types("x", ["a.A"]));
        let mut session = side.serializer.registry().new_serialize_session();
        for _ in 0..MAX_LOADERS_PER_PAYLOAD {
            let loader = ClassLoader::classpath_loader("x", vec!["x".into()], Vec::new(), Arc::clone(&source));
            session.visit_class(&loader.load_class("a.A").unwrap()).unwrap();
        }
        let loader = ClassLoader::classpath_loader("x", vec!["x".into()], Vec::new(), source);
        let err = session.visit_class(&loader.load_class("a.A").unwrap()).unwrap_err();
        assert!(matches!(err, PayloadError::TooManyClassLoaders { .. }));
    }

    #[test]
    fn client_owned_loader_grows_when_reuse_enabled() {
        let options = RegistryOptions {
            reuse_client_owned_loaders: true,
        };
        let coordinator = Side::new(options);
        let worker = Side::new(options);

        let client = ClassLoader::client_owned(vec!["api.jar".to_string()], Vec::new(), source());
        let spec = Value::Object(Object::new(client.load_class("org.api.Spec").unwrap()));
        let first = worker
            .serializer
            .deserialize(&coordinator.serializer.serialize(&spec).unwrap())
            .unwrap();

        client.append_classpath(&["extra.jar".to_string()]);
        let plugin = Value::Object(Object::new(client.load_class("org.extra.Plugin").unwrap()));
        let second = worker
            .serializer
            .deserialize(&coordinator.serializer.serialize(&plugin).unwrap())
            .unwrap();

        let first_loader = first.as_object().unwrap().class.loader();
        let second_loader = second.as_object().unwrap().class.loader();
        assert!(Arc::ptr_eq(first_loader, second_loader));
        assert!(second_loader.classpath().contains(&"extra.jar".to_string()));
    }

    #[test]
    fn client_owned_loader_is_replaced_when_reuse_disabled() {
        let coordinator = Side::new(RegistryOptions::default());
        let worker = Side::new(RegistryOptions::default());

        let client = ClassLoader::client_owned(vec!["api.jar".to_string()], Vec::new(), source());
        let spec = Value::Object(Object::new(client.load_class("org.api.Spec").unwrap()));
        let first = worker
            .serializer
            .deserialize(&coordinator.serializer.serialize(&spec).unwrap())
            .unwrap();

        client.append_classpath(&["extra.jar".to_string()]);
        let plugin = Value::Object(Object::new(client.load_class("org.extra.Plugin").unwrap()));
        let second = worker
            .serializer
            .deserialize(&coordinator.serializer.serialize(&plugin).unwrap())
            .unwrap();

        let first_loader = first.as_object().unwrap().class.loader();
        let second_loader = second.as_object().unwrap().class.loader();
        assert!(!Arc::ptr_eq(first_loader, second_loader));
        assert_eq!(first_loader.classpath(), vec!["api.jar".to_string()]);
    }
}
