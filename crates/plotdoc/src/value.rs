//! Property values.
//!
//! A [`Value`] is the in-memory form of anything a model property can hold:
//! JSON-like scalars and containers, references to other models, binary
//! blobs, slices and packed numeric arrays. Model references are plain
//! [`ModelId`]s resolved against a [`ModelStore`](crate::model::ModelStore),
//! so a value tree is always acyclic even when the model graph is not.

use indexmap::IndexMap;

use crate::model::ModelId;

// ── Value ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Set(Vec<Value>),
    /// String-keyed mapping; insertion order is preserved.
    Dict(IndexMap<String, Value>),
    /// Mapping with arbitrary keys.
    Map(Vec<(Value, Value)>),
    Ref(ModelId),
    Slice(Slice),
    TypedArray(TypedArray),
    NdArray(NdArray),
}

impl Value {
    /// Builds a [`Value::Dict`] from key/value pairs.
    pub fn dict<K, V, I>(entries: I) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a [`Value::List`] from anything convertible into values.
    pub fn list<V, I>(items: I) -> Value
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&ModelId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Map(_) => "map",
            Value::Ref(_) => "ref",
            Value::Slice(_) => "slice",
            Value::TypedArray(_) => "typed_array",
            Value::NdArray(_) => "ndarray",
        }
    }

    /// Appends every model id referenced anywhere in this value to `out`.
    pub fn collect_refs(&self, out: &mut Vec<ModelId>) {
        match self {
            Value::Ref(id) => out.push(id.clone()),
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            Value::Dict(map) => {
                for item in map.values() {
                    item.collect_refs(out);
                }
            }
            Value::Map(entries) => {
                for (k, v) in entries {
                    k.collect_refs(out);
                    v.collect_refs(out);
                }
            }
            _ => {}
        }
    }

    /// Every model id referenced anywhere in this value.
    pub fn refs(&self) -> Vec<ModelId> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    pub fn has_refs(&self) -> bool {
        match self {
            Value::Ref(_) => true,
            Value::List(items) | Value::Set(items) => items.iter().any(Value::has_refs),
            Value::Dict(map) => map.values().any(Value::has_refs),
            Value::Map(entries) => entries.iter().any(|(k, v)| k.has_refs() || v.has_refs()),
            _ => false,
        }
    }

    /// Number of rows when this value is used as a data column.
    pub fn column_len(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(items.len()),
            Value::TypedArray(array) => Some(array.len()),
            Value::NdArray(nd) => nd.shape.first().copied(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ModelId> for Value {
    fn from(v: ModelId) -> Self {
        Value::Ref(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<TypedArray> for Value {
    fn from(v: TypedArray) -> Self {
        Value::TypedArray(v)
    }
}

impl From<Option<&str>> for Value {
    fn from(v: Option<&str>) -> Self {
        v.map_or(Value::Null, Value::from)
    }
}

// ── Slice ───────────────────────────────────────────────────────────────────

/// A half-open index range with an optional stride, as used by column patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl Slice {
    pub fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// Resolves the slice against a sequence of length `len`.
    ///
    /// Negative bounds count from the end. Returns `None` for a non-positive step.
    pub fn indices(&self, len: usize) -> Option<Vec<usize>> {
        let step = self.step.unwrap_or(1);
        if step <= 0 {
            return None;
        }
        let len = len as i64;
        let clamp = |v: i64| -> i64 {
            let v = if v < 0 { v + len } else { v };
            v.clamp(0, len)
        };
        let start = self.start.map_or(0, clamp);
        let stop = self.stop.map_or(len, clamp);
        let step = usize::try_from(step).unwrap_or(usize::MAX);
        Some((start..stop).step_by(step).map(|i| i as usize).collect())
    }
}

// ── Typed arrays ────────────────────────────────────────────────────────────

/// Element type of a packed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "uint8" => Self::Uint8,
            "int8" => Self::Int8,
            "uint16" => Self::Uint16,
            "int16" => Self::Int16,
            "uint32" => Self::Uint32,
            "int32" => Self::Int32,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            _ => return None,
        })
    }

    pub fn item_size(self) -> usize {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

/// Byte order of a serialized array payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Little => "little",
            Self::Big => "big",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "little" => Some(Self::Little),
            "big" => Some(Self::Big),
            _ => None,
        }
    }
}

/// A packed one-dimensional numeric array.
///
/// Elements are stored as little-endian bytes regardless of host order; the
/// wire codec byte-swaps big-endian payloads on the way in.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    dtype: DType,
    bytes: Vec<u8>,
}

impl TypedArray {
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            bytes: Vec::new(),
        }
    }

    /// Wraps a little-endian payload. Fails when the length is not a whole
    /// number of elements.
    pub fn from_le_bytes(dtype: DType, bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() % dtype.item_size() != 0 {
            return None;
        }
        Some(Self { dtype, bytes })
    }

    pub fn from_bytes(dtype: DType, mut bytes: Vec<u8>, order: ByteOrder) -> Option<Self> {
        let size = dtype.item_size();
        if bytes.len() % size != 0 {
            return None;
        }
        if order == ByteOrder::Big && size > 1 {
            for chunk in bytes.chunks_exact_mut(size) {
                chunk.reverse();
            }
        }
        Some(Self { dtype, bytes })
    }

    pub fn from_f64s(values: &[f64]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::Float64,
            bytes,
        }
    }

    pub fn from_i32s(values: &[i32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::Int32,
            bytes,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.dtype.item_size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_le_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        let size = self.dtype.item_size();
        let chunk = self.bytes.get(index * size..(index + 1) * size)?;
        Some(read_elem(self.dtype, chunk))
    }

    /// Overwrites one element. Returns `false` when out of bounds or when
    /// `value` is not numeric.
    pub fn set(&mut self, index: usize, value: &Value) -> bool {
        let size = self.dtype.item_size();
        let dtype = self.dtype;
        match self.bytes.get_mut(index * size..(index + 1) * size) {
            Some(chunk) => write_elem(dtype, value, chunk),
            None => false,
        }
    }

    pub fn push(&mut self, value: &Value) -> bool {
        let size = self.dtype.item_size();
        let start = self.bytes.len();
        self.bytes.resize(start + size, 0);
        if write_elem(self.dtype, value, &mut self.bytes[start..]) {
            true
        } else {
            self.bytes.truncate(start);
            false
        }
    }

    /// Appends every value, all or nothing.
    pub fn extend(&mut self, values: &[Value]) -> bool {
        let start = self.bytes.len();
        for value in values {
            if !self.push(value) {
                self.bytes.truncate(start);
                return false;
            }
        }
        true
    }

    /// Removes the first `count` elements.
    pub fn drain_front(&mut self, count: usize) {
        let n = (count * self.dtype.item_size()).min(self.bytes.len());
        self.bytes.drain(..n);
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.bytes
            .chunks_exact(self.dtype.item_size())
            .map(|chunk| read_elem(self.dtype, chunk))
            .collect()
    }
}

fn read_elem(dtype: DType, b: &[u8]) -> Value {
    match dtype {
        DType::Bool => Value::Bool(b[0] != 0),
        DType::Uint8 => Value::Int(b[0] as i64),
        DType::Int8 => Value::Int(b[0] as i8 as i64),
        DType::Uint16 => Value::Int(u16::from_le_bytes([b[0], b[1]]) as i64),
        DType::Int16 => Value::Int(i16::from_le_bytes([b[0], b[1]]) as i64),
        DType::Uint32 => Value::Int(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64),
        DType::Int32 => Value::Int(i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64),
        DType::Float32 => Value::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64),
        DType::Float64 => Value::Float(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
    }
}

fn write_elem(dtype: DType, value: &Value, out: &mut [u8]) -> bool {
    let num = match value {
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        other => match other.as_f64() {
            Some(n) => n,
            None => return false,
        },
    };
    match dtype {
        DType::Bool => out[0] = (num != 0.0) as u8,
        DType::Uint8 => out[0] = num as u8,
        DType::Int8 => out[0] = (num as i8) as u8,
        DType::Uint16 => out.copy_from_slice(&(num as u16).to_le_bytes()),
        DType::Int16 => out.copy_from_slice(&(num as i16).to_le_bytes()),
        DType::Uint32 => out.copy_from_slice(&(num as u32).to_le_bytes()),
        DType::Int32 => out.copy_from_slice(&(num as i32).to_le_bytes()),
        DType::Float32 => out.copy_from_slice(&(num as f32).to_le_bytes()),
        DType::Float64 => out.copy_from_slice(&num.to_le_bytes()),
    }
    true
}

/// A packed array with an explicit shape, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub array: TypedArray,
    pub shape: Vec<usize>,
}

impl NdArray {
    pub fn new(array: TypedArray, shape: Vec<usize>) -> Self {
        Self { array, shape }
    }

    /// Number of scalar elements in one leading-axis row.
    pub fn row_size(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>().max(1)
    }
}
