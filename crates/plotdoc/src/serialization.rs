//! Wire codec for property values and models.
//!
//! Values are encoded into JSON-safe representations. Anything JSON cannot
//! carry natively is wrapped in a tagged object:
//!
//! ```json
//! {"type": "number", "value": "nan"}
//! {"type": "map", "entries": [["a", 1]]}
//! {"type": "bytes", "data": {"id": "p1042"}}
//! {"type": "typed_array", "array": {...}, "order": "little", "dtype": "float64"}
//! {"type": "object", "name": "Plot", "id": "p1001", "attributes": {...}}
//! {"id": "p1001"}
//! ```
//!
//! A model is emitted in full the first time the serializer meets it and as a
//! bare `{"id"}` reference afterwards (or always, if the receiver is known to
//! hold it already).

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use indexmap::IndexMap;
use serde_json::{json, Map, Value as Json};

use crate::kinds::KindError;
use crate::model::{make_id, ModelId, ModelStore, PropertyError};
use crate::registry::{Registry, RegistryError};
use crate::value::{ByteOrder, DType, NdArray, Slice, TypedArray, Value};

pub type JsonMap = Map<String, Json>;

/// Binary payloads received alongside a message, keyed by buffer id.
pub type Buffers = IndexMap<String, Vec<u8>>;

/// An out-of-band binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub id: String,
    pub data: Vec<u8>,
}

impl Buffer {
    pub fn to_base64(&self) -> String {
        B64.encode(&self.data)
    }
}

/// Encoded content together with the buffers it references.
#[derive(Debug, Clone, PartialEq)]
pub struct Serialized<T> {
    pub content: T,
    pub buffers: Vec<Buffer>,
}

impl<T> Serialized<T> {
    /// Buffers in the keyed form [`Deserializer::with_buffers`] expects.
    pub fn buffer_map(&self) -> Buffers {
        self.buffers
            .iter()
            .map(|b| (b.id.clone(), b.data.clone()))
            .collect()
    }
}

// ── Encode ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("can't serialize reference to unknown model {0}")]
    UnknownModel(ModelId),
}

/// Serializer configuration.
#[derive(Debug, Clone, Copy)]
pub struct SerializerOptions {
    /// Emit properties that still hold their type default.
    pub include_defaults: bool,
    /// Move byte payloads into side buffers instead of inline base64.
    pub binary: bool,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            include_defaults: true,
            binary: false,
        }
    }
}

pub struct Serializer<'a> {
    store: &'a ModelStore,
    registry: &'a Registry,
    options: SerializerOptions,
    references: HashSet<ModelId>,
    buffers: Vec<Buffer>,
}

impl<'a> Serializer<'a> {
    pub fn new(store: &'a ModelStore, registry: &'a Registry, options: SerializerOptions) -> Self {
        Self {
            store,
            registry,
            options,
            references: HashSet::new(),
            buffers: Vec::new(),
        }
    }

    /// Models the receiver already holds; these are always emitted as `{id}`.
    pub fn with_references(mut self, known: impl IntoIterator<Item = ModelId>) -> Self {
        self.references.extend(known);
        self
    }

    pub fn has_ref(&self, id: &ModelId) -> bool {
        self.references.contains(id)
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }

    pub fn encode(&mut self, value: &Value) -> Result<Json, SerializationError> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => encode_float(*f),
            Value::Str(s) => json!(s),
            Value::Bytes(data) => self.encode_bytes(data),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| self.encode(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Set(items) => {
                let entries = items
                    .iter()
                    .map(|v| self.encode(v))
                    .collect::<Result<Vec<_>, _>>()?;
                json!({ "type": "set", "entries": entries })
            }
            Value::Dict(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map {
                    entries.push(json!([k, self.encode(v)?]));
                }
                json!({ "type": "map", "entries": entries })
            }
            Value::Map(pairs) => {
                let mut entries = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    entries.push(json!([self.encode(k)?, self.encode(v)?]));
                }
                json!({ "type": "map", "entries": entries })
            }
            Value::Ref(id) => self.encode_model(id)?,
            Value::Slice(slice) => json!({
                "type": "slice",
                "start": slice.start,
                "stop": slice.stop,
                "step": slice.step,
            }),
            Value::TypedArray(array) => json!({
                "type": "typed_array",
                "array": self.encode_bytes(array.as_le_bytes()),
                "order": ByteOrder::Little.as_str(),
                "dtype": array.dtype().as_str(),
            }),
            Value::NdArray(nd) => json!({
                "type": "ndarray",
                "array": self.encode_bytes(nd.array.as_le_bytes()),
                "order": ByteOrder::Little.as_str(),
                "dtype": nd.array.dtype().as_str(),
                "shape": nd.shape,
            }),
        })
    }

    /// Encodes a model as a full object representation, or as `{id}` when
    /// the model is already known.
    pub fn encode_model(&mut self, id: &ModelId) -> Result<Json, SerializationError> {
        if self.references.contains(id) {
            return Ok(json!({ "id": id.as_str() }));
        }
        let model = self
            .store
            .get(id)
            .ok_or_else(|| SerializationError::UnknownModel(id.clone()))?;
        // Registered before the attributes so cycles come back as refs.
        self.references.insert(id.clone());

        let mut attributes = JsonMap::new();
        for (attr, value) in model.properties() {
            if !self.options.include_defaults
                && self.registry.default_value(model.type_name(), attr) == Some(value)
            {
                continue;
            }
            attributes.insert(attr.clone(), self.encode(value)?);
        }

        let mut rep = JsonMap::new();
        rep.insert("type".into(), json!("object"));
        rep.insert("name".into(), json!(model.type_name()));
        rep.insert("id".into(), json!(id.as_str()));
        if !attributes.is_empty() {
            rep.insert("attributes".into(), Json::Object(attributes));
        }
        Ok(Json::Object(rep))
    }

    fn encode_bytes(&mut self, data: &[u8]) -> Json {
        if self.options.binary {
            let buffer = Buffer {
                id: make_id().to_string(),
                data: data.to_vec(),
            };
            let rep = json!({ "type": "bytes", "data": { "id": buffer.id } });
            self.buffers.push(buffer);
            rep
        } else {
            json!({ "type": "bytes", "data": B64.encode(data) })
        }
    }
}

fn encode_float(f: f64) -> Json {
    if f.is_nan() {
        json!({ "type": "number", "value": "nan" })
    } else if f.is_infinite() {
        json!({ "type": "number", "value": if f < 0.0 { "-inf" } else { "+inf" } })
    } else {
        json!(f)
    }
}

// ── Decode ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    #[error("can't resolve reference '{0}'")]
    UnresolvedReference(ModelId),
    #[error("can't resolve type '{0}'")]
    UnknownType(String),
    #[error("can't resolve buffer '{0}'")]
    UnknownBuffer(String),
    #[error("unable to decode an object of type '{0}'")]
    UnknownRepType(String),
    #[error("can't resolve named symbol '{0}'")]
    UnknownSymbol(String),
    #[error("unsupported dtype '{0}'")]
    UnsupportedDType(String),
    #[error("malformed representation: {0}")]
    Malformed(String),
    #[error("base model {base} of {name} is not defined")]
    UndefinedBase { base: String, name: String },
    #[error(transparent)]
    Kind(#[from] KindError),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decoder for a custom `"type"` tag.
pub type Decoder = fn(&JsonMap, &mut Deserializer<'_>) -> Result<Value, DeserializationError>;

pub struct Deserializer<'a> {
    store: &'a mut ModelStore,
    registry: &'a mut Registry,
    buffers: Buffers,
    decoders: IndexMap<String, Decoder>,
    on_materialize: Option<Box<dyn FnMut(&ModelId) + 'a>>,
}

impl<'a> Deserializer<'a> {
    /// Refs resolve against `store`; new models are materialized into it.
    /// The `"model"` definition tag is pre-registered.
    pub fn new(store: &'a mut ModelStore, registry: &'a mut Registry) -> Self {
        let mut decoders: IndexMap<String, Decoder> = IndexMap::new();
        decoders.insert(crate::defs::MODEL_DEF_TAG.to_owned(), crate::defs::decode_def);
        Self {
            store,
            registry,
            buffers: Buffers::new(),
            decoders,
            on_materialize: None,
        }
    }

    pub fn with_buffers(mut self, buffers: Buffers) -> Self {
        self.buffers = buffers;
        self
    }

    /// Called for each new model right after it is allocated and before its
    /// attributes are decoded.
    pub fn on_materialize(mut self, callback: impl FnMut(&ModelId) + 'a) -> Self {
        self.on_materialize = Some(Box::new(callback));
        self
    }

    /// Installs a decoder for a custom representation tag.
    pub fn register(&mut self, tag: impl Into<String>, decoder: Decoder) {
        self.decoders.insert(tag.into(), decoder);
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        self.registry
    }

    pub fn store(&self) -> &ModelStore {
        self.store
    }

    pub fn decode(&mut self, rep: &Json) -> Result<Value, DeserializationError> {
        match rep {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Json::String(s) => Ok(Value::Str(s.clone())),
            Json::Array(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|v| self.decode(v))
                    .collect::<Result<_, _>>()?,
            )),
            Json::Object(obj) => self.decode_object(obj),
        }
    }

    fn decode_object(&mut self, obj: &JsonMap) -> Result<Value, DeserializationError> {
        let Some(tag) = obj.get("type").and_then(Json::as_str) else {
            if obj.contains_key("id") {
                return self.decode_ref(obj);
            }
            let mut out = IndexMap::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.clone(), self.decode(v)?);
            }
            return Ok(Value::Dict(out));
        };

        if let Some(decoder) = self.decoders.get(tag).copied() {
            return decoder(obj, self);
        }
        match tag {
            "ref" => self.decode_ref(obj),
            "symbol" => Err(DeserializationError::UnknownSymbol(
                str_field(obj, "name")?.to_owned(),
            )),
            "number" => decode_number(obj),
            "array" => Ok(Value::List(self.decode_entries(obj)?)),
            "set" => Ok(Value::Set(self.decode_entries(obj)?)),
            "map" => self.decode_map(obj),
            "bytes" => Ok(Value::Bytes(self.decode_bytes(obj)?)),
            "slice" => Ok(Value::Slice(Slice {
                start: opt_int(obj, "start")?,
                stop: opt_int(obj, "stop")?,
                step: opt_int(obj, "step")?,
            })),
            "typed_array" => Ok(Value::TypedArray(self.decode_typed_array(obj)?)),
            "ndarray" => self.decode_ndarray(obj),
            "object" if obj.contains_key("id") => self.decode_object_ref(obj),
            other => Err(DeserializationError::UnknownRepType(other.to_owned())),
        }
    }

    fn decode_ref(&mut self, obj: &JsonMap) -> Result<Value, DeserializationError> {
        let id = ModelId::from(str_field(obj, "id")?);
        if self.store.contains(&id) {
            Ok(Value::Ref(id))
        } else {
            Err(DeserializationError::UnresolvedReference(id))
        }
    }

    fn decode_object_ref(&mut self, obj: &JsonMap) -> Result<Value, DeserializationError> {
        let id = ModelId::from(str_field(obj, "id")?);
        let attributes = match obj.get("attributes") {
            None | Some(Json::Null) => None,
            Some(Json::Object(attrs)) => Some(attrs),
            Some(other) => {
                return Err(DeserializationError::Malformed(format!(
                    "attributes of {id} must be an object, got {other}"
                )))
            }
        };

        if self.store.contains(&id) {
            tracing::debug!(model = %id, "reference already known, updating in place");
        } else {
            let name = str_field(obj, "name")?;
            if !self.registry.contains(name) {
                return Err(DeserializationError::UnknownType(name.to_owned()));
            }
            self.store.instantiate(self.registry, name, id.clone())?;
            if let Some(callback) = self.on_materialize.as_mut() {
                callback(&id);
            }
        }

        if let Some(attrs) = attributes {
            for (attr, rep) in attrs {
                let value = self.decode(rep)?;
                self.store
                    .set_property(self.registry, &id, attr, value, true)?;
            }
        }
        Ok(Value::Ref(id))
    }

    fn decode_entries(&mut self, obj: &JsonMap) -> Result<Vec<Value>, DeserializationError> {
        match obj.get("entries") {
            None => Ok(Vec::new()),
            Some(Json::Array(entries)) => entries.iter().map(|v| self.decode(v)).collect(),
            Some(other) => Err(DeserializationError::Malformed(format!(
                "entries must be an array, got {other}"
            ))),
        }
    }

    fn decode_map(&mut self, obj: &JsonMap) -> Result<Value, DeserializationError> {
        let mut pairs = Vec::new();
        for entry in self.raw_entries(obj)? {
            match entry.as_array().map(Vec::as_slice) {
                Some([k, v]) => {
                    let key = self.decode(k)?;
                    let value = self.decode(v)?;
                    pairs.push((key, value));
                }
                _ => {
                    return Err(DeserializationError::Malformed(format!(
                        "map entry must be a pair, got {entry}"
                    )))
                }
            }
        }
        if pairs.iter().all(|(k, _)| matches!(k, Value::Str(_))) {
            let mut dict = IndexMap::with_capacity(pairs.len());
            for (key, value) in pairs {
                if let Value::Str(key) = key {
                    dict.insert(key, value);
                }
            }
            Ok(Value::Dict(dict))
        } else {
            Ok(Value::Map(pairs))
        }
    }

    fn raw_entries<'j>(&self, obj: &'j JsonMap) -> Result<&'j [Json], DeserializationError> {
        match obj.get("entries") {
            None => Ok(&[]),
            Some(Json::Array(entries)) => Ok(entries),
            Some(other) => Err(DeserializationError::Malformed(format!(
                "entries must be an array, got {other}"
            ))),
        }
    }

    fn decode_bytes(&mut self, obj: &JsonMap) -> Result<Vec<u8>, DeserializationError> {
        match obj.get("data") {
            Some(Json::String(b64)) => Ok(B64.decode(b64)?),
            Some(Json::Object(reference)) => {
                let id = reference.get("id").and_then(Json::as_str).ok_or_else(|| {
                    DeserializationError::Malformed("buffer reference without id".into())
                })?;
                self.buffers
                    .get(id)
                    .cloned()
                    .ok_or_else(|| DeserializationError::UnknownBuffer(id.to_owned()))
            }
            _ => Err(DeserializationError::Malformed(
                "bytes data must be base64 or a buffer reference".into(),
            )),
        }
    }

    /// Decodes the `array` member of a typed or nd array into raw bytes.
    fn array_bytes(&mut self, obj: &JsonMap) -> Result<Vec<u8>, DeserializationError> {
        match self.decode(field(obj, "array")?)? {
            Value::Bytes(data) => Ok(data),
            other => Err(DeserializationError::Malformed(format!(
                "array payload must be bytes, got {}",
                other.type_name()
            ))),
        }
    }

    fn decode_typed_array(&mut self, obj: &JsonMap) -> Result<TypedArray, DeserializationError> {
        let dtype_name = str_field(obj, "dtype")?;
        let dtype = DType::parse(dtype_name)
            .ok_or_else(|| DeserializationError::UnsupportedDType(dtype_name.to_owned()))?;
        let order = parse_order(obj)?;
        let data = self.array_bytes(obj)?;
        TypedArray::from_bytes(dtype, data, order).ok_or_else(|| {
            DeserializationError::Malformed(format!("payload is not a whole number of {dtype_name}"))
        })
    }

    fn decode_ndarray(&mut self, obj: &JsonMap) -> Result<Value, DeserializationError> {
        let dtype_name = str_field(obj, "dtype")?;
        let shape: Vec<usize> = match obj.get("shape") {
            Some(Json::Array(dims)) => dims
                .iter()
                .map(|d| d.as_u64().map(|d| d as usize))
                .collect::<Option<_>>()
                .ok_or_else(|| DeserializationError::Malformed("invalid ndarray shape".into()))?,
            _ => return Err(DeserializationError::Malformed("ndarray without shape".into())),
        };

        if dtype_name == "object" {
            // Object arrays travel as plain lists.
            return match self.decode(field(obj, "array")?)? {
                Value::List(items) => Ok(Value::List(items)),
                other => Err(DeserializationError::Malformed(format!(
                    "object ndarray must carry a list, got {}",
                    other.type_name()
                ))),
            };
        }

        let dtype = DType::parse(dtype_name)
            .ok_or_else(|| DeserializationError::UnsupportedDType(dtype_name.to_owned()))?;
        let order = parse_order(obj)?;
        let data = self.array_bytes(obj)?;
        let array = TypedArray::from_bytes(dtype, data, order).ok_or_else(|| {
            DeserializationError::Malformed(format!("payload is not a whole number of {dtype_name}"))
        })?;
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| DeserializationError::Malformed(format!("ndarray shape {shape:?} overflows")))?;
        if elements != array.len() {
            return Err(DeserializationError::Malformed(format!(
                "ndarray shape {shape:?} does not match {} elements",
                array.len()
            )));
        }
        Ok(Value::NdArray(NdArray::new(array, shape)))
    }
}

fn field<'j>(obj: &'j JsonMap, name: &str) -> Result<&'j Json, DeserializationError> {
    obj.get(name)
        .ok_or_else(|| DeserializationError::Malformed(format!("missing field '{name}'")))
}

pub(crate) fn str_field<'j>(obj: &'j JsonMap, name: &str) -> Result<&'j str, DeserializationError> {
    field(obj, name)?
        .as_str()
        .ok_or_else(|| DeserializationError::Malformed(format!("field '{name}' must be a string")))
}

fn opt_int(obj: &JsonMap, name: &str) -> Result<Option<i64>, DeserializationError> {
    match obj.get(name) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| DeserializationError::Malformed(format!("field '{name}' must be an integer"))),
    }
}

fn parse_order(obj: &JsonMap) -> Result<ByteOrder, DeserializationError> {
    match obj.get("order") {
        None => Ok(ByteOrder::Little),
        Some(v) => v
            .as_str()
            .and_then(ByteOrder::parse)
            .ok_or_else(|| DeserializationError::Malformed(format!("invalid byte order {v}"))),
    }
}

fn decode_number(obj: &JsonMap) -> Result<Value, DeserializationError> {
    match field(obj, "value")? {
        Json::String(s) => match s.as_str() {
            "nan" => Ok(Value::Float(f64::NAN)),
            "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
            "+inf" | "inf" => Ok(Value::Float(f64::INFINITY)),
            other => Err(DeserializationError::Malformed(format!("invalid number '{other}'"))),
        },
        Json::Number(n) => Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN))),
        other => Err(DeserializationError::Malformed(format!("invalid number {other}"))),
    }
}
