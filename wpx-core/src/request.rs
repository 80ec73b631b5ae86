use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::codec::{read_chunked, write_chunked, Decoder, Encoder};
use crate::connection::{CodecError, MessageCodec};
use crate::error::{PayloadError, WorkerError};
use crate::payload::PayloadSerializer;
use crate::protocol::{RequestMessage, ResponseMessage};
use crate::value::{
    Value, BOOL_TYPE, BYTES_TYPE, FLOAT_TYPE, INT_TYPE, NULL_TYPE, STRING_TYPE,
};

/// The build operation a piece of work runs under. Progress and problems
/// emitted by the worker are attributed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildOperationRef {
    pub id: u64,
    pub parent: Option<u64>,
}

impl BuildOperationRef {
    pub fn new(id: u64) -> Self {
        Self { id, parent: None }
    }

    pub fn child_of(id: u64, parent: u64) -> Self {
        Self {
            id,
            parent: Some(parent),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub param_types: Vec<String>,
    pub args: Vec<Value>,
    pub build_operation: BuildOperationRef,
}

impl Request {
    pub fn builder(method: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            method: method.into(),
            param_types: Vec::new(),
            args: Vec::new(),
            build_operation: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: String,
    param_types: Vec<String>,
    args: Vec<Value>,
    build_operation: Option<BuildOperationRef>,
}

impl RequestBuilder {
    /// Adds an argument whose declared type is its runtime type.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.param_types.push(value.type_name().to_string());
        self.args.push(value);
        self
    }

    pub fn typed_arg(mut self, param_type: impl Into<String>, value: impl Into<Value>) -> Self {
        self.param_types.push(param_type.into());
        self.args.push(value.into());
        self
    }

    pub fn build_operation(mut self, op: BuildOperationRef) -> Self {
        self.build_operation = Some(op);
        self
    }

    pub fn build(self) -> Result<Request, WorkerError> {
        let build_operation = self
            .build_operation
            .ok_or(WorkerError::MissingBuildOperation)?;
        Ok(Request {
            method: self.method,
            param_types: self.param_types,
            args: self.args,
            build_operation,
        })
    }
}

/// Writes arguments of specific runtime types more compactly than the payload
/// serializer, without classloader bookkeeping.
pub trait ArgumentSerializer: Send + Sync {
    fn can_serialize(&self, type_name: &str) -> bool;
    fn write(&self, value: &Value, enc: &mut Encoder) -> Result<(), PayloadError>;
    fn read(&self, type_name: &str, dec: &mut Decoder) -> Result<Value, PayloadError>;
}

/// Ordered list of argument serializers; the first match wins.
#[derive(Default, Clone)]
pub struct ArgumentSerializerRegistry {
    serializers: Vec<Arc<dyn ArgumentSerializer>>,
}

impl ArgumentSerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding [`ScalarArgumentSerializer`].
    pub fn with_scalars() -> Self {
        let mut registry = Self::new();
        registry.add(Arc::new(ScalarArgumentSerializer));
        registry
    }

    pub fn add(&mut self, serializer: Arc<dyn ArgumentSerializer>) {
        self.serializers.push(serializer);
    }

    pub fn find(&self, type_name: &str) -> Option<&Arc<dyn ArgumentSerializer>> {
        self.serializers
            .iter()
            .find(|serializer| serializer.can_serialize(type_name))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarArgumentSerializer;

impl ArgumentSerializer for ScalarArgumentSerializer {
    fn can_serialize(&self, type_name: &str) -> bool {
        matches!(
            type_name,
            BOOL_TYPE | INT_TYPE | FLOAT_TYPE | STRING_TYPE | BYTES_TYPE
        )
    }

    fn write(&self, value: &Value, enc: &mut Encoder) -> Result<(), PayloadError> {
        match value {
            Value::Bool(b) => enc.write_bool(*b),
            Value::Int(i) => enc.write_i64(*i),
            Value::Float(f) => enc.write_u64(f.to_bits()),
            Value::Str(s) => enc.write_str(s),
            Value::Bytes(b) => enc.write_bytes(b),
            other => {
                return Err(PayloadError::Malformed(format!(
                    "scalar serializer cannot write {}",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    fn read(&self, type_name: &str, dec: &mut Decoder) -> Result<Value, PayloadError> {
        Ok(match type_name {
            BOOL_TYPE => Value::Bool(dec.read_bool()?),
            INT_TYPE => Value::Int(dec.read_i64()?),
            FLOAT_TYPE => Value::Float(f64::from_bits(dec.read_u64()?)),
            STRING_TYPE => Value::Str(dec.read_string()?),
            BYTES_TYPE => Value::Bytes(dec.read_bytes()?.to_vec()),
            other => {
                return Err(PayloadError::Malformed(format!(
                    "scalar serializer cannot read {other}"
                )))
            }
        })
    }
}

const TAG_STOP: u8 = 0;
const TAG_RUN: u8 = 1;
const TAG_RUN_THEN_STOP: u8 = 2;

/// Codec for [`RequestMessage`]. Arguments go through the first matching
/// [`ArgumentSerializer`], falling back to the payload serializer.
#[derive(Clone)]
pub struct RequestSerializer {
    arguments: ArgumentSerializerRegistry,
    payload: PayloadSerializer,
    skip_incoming_arguments: bool,
}

impl RequestSerializer {
    pub fn new(arguments: ArgumentSerializerRegistry, payload: PayloadSerializer) -> Self {
        Self {
            arguments,
            payload,
            skip_incoming_arguments: false,
        }
    }

    /// Decoded requests carry `Value::Null` for every argument and the
    /// argument bytes are never interpreted.
    pub fn skip_incoming_arguments(mut self, skip: bool) -> Self {
        self.skip_incoming_arguments = skip;
        self
    }

    fn write_request(&self, request: &Request, enc: &mut Encoder) -> Result<(), PayloadError> {
        enc.write_str(&request.method);
        enc.write_u32(request.param_types.len() as u32);
        for param_type in &request.param_types {
            enc.write_str(param_type);
        }
        enc.write_u32(request.args.len() as u32);
        for arg in &request.args {
            if arg.is_null() {
                enc.write_str(NULL_TYPE);
                continue;
            }
            let type_name = arg.type_name();
            enc.write_str(type_name);
            let mut inner = Encoder::new();
            match self.arguments.find(type_name) {
                Some(serializer) => serializer.write(arg, &mut inner)?,
                None => self.payload.serialize_to(arg, &mut inner)?,
            }
            enc.write_bytes(&inner.finish());
        }

        let op = request.build_operation;
        let op_value = Value::List(vec![
            Value::Int(op.id as i64),
            op.parent.map_or(Value::Null, |p| Value::Int(p as i64)),
        ]);
        self.payload.serialize_to(&op_value, enc)
    }

    fn read_request(&self, dec: &mut Decoder) -> Result<Request, PayloadError> {
        let method = dec.read_string()?;
        let param_count = dec.read_u32()? as usize;
        let mut param_types = Vec::with_capacity(param_count.min(256));
        for _ in 0..param_count {
            param_types.push(dec.read_string()?);
        }
        let arg_count = dec.read_u32()? as usize;
        let mut args = Vec::with_capacity(arg_count.min(256));
        for _ in 0..arg_count {
            let type_name = dec.read_string()?;
            if type_name == NULL_TYPE {
                args.push(Value::Null);
                continue;
            }
            if self.skip_incoming_arguments {
                dec.skip_bytes()?;
                args.push(Value::Null);
                continue;
            }
            let mut inner = Decoder::new(dec.read_bytes()?);
            let value = match self.arguments.find(&type_name) {
                Some(serializer) => serializer.read(&type_name, &mut inner)?,
                None => self.payload.deserialize_from(&mut inner)?,
            };
            inner.expect_end()?;
            args.push(value);
        }

        let build_operation = match self.payload.deserialize_from(dec)? {
            Value::List(items) => match items.as_slice() {
                [Value::Int(id), Value::Null] => BuildOperationRef::new(*id as u64),
                [Value::Int(id), Value::Int(parent)] => {
                    BuildOperationRef::child_of(*id as u64, *parent as u64)
                }
                _ => return Err(PayloadError::Malformed("invalid build operation".into())),
            },
            _ => return Err(PayloadError::Malformed("missing build operation".into())),
        };
        Ok(Request {
            method,
            param_types,
            args,
            build_operation,
        })
    }
}

impl MessageCodec<RequestMessage> for RequestSerializer {
    fn encode(&self, message: &RequestMessage) -> Result<Bytes, CodecError> {
        let (tag, request) = match message {
            RequestMessage::Stop => (TAG_STOP, None),
            RequestMessage::Run(request) => (TAG_RUN, Some(request)),
            RequestMessage::RunThenStop(request) => (TAG_RUN_THEN_STOP, Some(request)),
        };
        let mut out = BytesMut::new();
        out.extend_from_slice(&[tag]);
        if let Some(request) = request {
            let mut enc = Encoder::new();
            self.write_request(request, &mut enc)?;
            write_chunked(&enc.finish(), &mut out);
        }
        Ok(out.freeze())
    }

    fn decode(&self, mut body: Bytes) -> Result<RequestMessage, CodecError> {
        if body.is_empty() {
            return Err(CodecError::Malformed("empty request message".into()));
        }
        let tag = body.split_to(1)[0];
        if tag == TAG_STOP {
            return Ok(RequestMessage::Stop);
        }
        let block = read_chunked(&mut body)?;
        let mut dec = Decoder::new(block);
        let request = self.read_request(&mut dec)?;
        dec.expect_end()?;
        match tag {
            TAG_RUN => Ok(RequestMessage::Run(request)),
            TAG_RUN_THEN_STOP => Ok(RequestMessage::RunThenStop(request)),
            other => Err(CodecError::Malformed(format!("unknown request tag {other}"))),
        }
    }
}

const TAG_COMPLETED: u8 = 0;
const TAG_FAILED: u8 = 1;
const TAG_INFRASTRUCTURE_FAILED: u8 = 2;

/// Codec for [`ResponseMessage`]; every variant is a payload.
#[derive(Clone)]
pub struct ResponseSerializer {
    payload: PayloadSerializer,
}

impl ResponseSerializer {
    pub fn new(payload: PayloadSerializer) -> Self {
        Self { payload }
    }
}

impl MessageCodec<ResponseMessage> for ResponseSerializer {
    fn encode(&self, message: &ResponseMessage) -> Result<Bytes, CodecError> {
        let mut enc = Encoder::new();
        match message {
            ResponseMessage::Completed(value) => {
                enc.write_u8(TAG_COMPLETED);
                self.payload.serialize_to(value, &mut enc)?;
            }
            ResponseMessage::Failed(err) => {
                enc.write_u8(TAG_FAILED);
                self.payload.serialize_to(&Value::Error(err.clone()), &mut enc)?;
            }
            ResponseMessage::InfrastructureFailed(err) => {
                enc.write_u8(TAG_INFRASTRUCTURE_FAILED);
                self.payload.serialize_to(&Value::Error(err.clone()), &mut enc)?;
            }
        }
        Ok(enc.finish())
    }

    fn decode(&self, body: Bytes) -> Result<ResponseMessage, CodecError> {
        let mut dec = Decoder::new(body);
        let tag = dec.read_u8()?;
        let value = self.payload.deserialize_from(&mut dec)?;
        dec.expect_end()?;
        match (tag, value) {
            (TAG_COMPLETED, value) => Ok(ResponseMessage::Completed(value)),
            (TAG_FAILED, Value::Error(err)) => Ok(ResponseMessage::Failed(err)),
            (TAG_INFRASTRUCTURE_FAILED, Value::Error(err)) => {
                Ok(ResponseMessage::InfrastructureFailed(err))
            }
            (tag, other) => Err(CodecError::Malformed(format!(
                "response tag {tag} cannot carry {}",
                other.type_name()
            ))),
        }
    }
}
