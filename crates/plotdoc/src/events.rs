//! Document change events and their patch wire records.
//!
//! # Overview
//!
//! Every local mutation of a [`Document`](crate::Document) is described by a
//! [`DocumentChange`] tagged with the id of the document that produced it.
//! Changes are delivered to `on_change` callbacks one at a time or, while the
//! document is held, as a single batch. A list of changes is turned into a
//! [`Patch`] by `create_json_patch`; each change becomes one record:
//!
//! ```json
//! {"kind": "ModelChanged", "model": {"id": "p1002"}, "attr": "width", "new": 300}
//! {"kind": "ColumnsStreamed", "model": {"id": "p1003"}, "attr": "data",
//!  "data": {"type": "map", "entries": [["x", [4, 5]]]}, "rollover": 100}
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::error::DocumentError;
use crate::model::{DocumentId, ModelId};
use crate::serialization::{Buffers, SerializationError, Serializer};
use crate::value::Value;

/// Column name → column values.
pub type ColumnData = IndexMap<String, Value>;

/// Column name → `(index, value)` pairs. An index is an `Int`, a `Slice`, or
/// a list `[row, i, j]` addressing into a multi-dimensional cell.
pub type ColumnPatches = IndexMap<String, Vec<(Value, Value)>>;

/// Message type used for application events sent through the change pipeline.
pub const BOKEH_EVENT: &str = "bokeh_event";

// ── Changes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    ModelChanged {
        model: ModelId,
        attr: String,
        old: Value,
        new: Value,
        /// Cheaper equivalent change. Serialized in place of the full value.
        hint: Option<Box<DocumentChange>>,
    },
    MessageSent {
        msg_type: String,
        msg_data: Value,
    },
    TitleChanged {
        title: String,
    },
    RootAdded {
        model: ModelId,
    },
    RootRemoved {
        model: ModelId,
    },
    ColumnDataChanged {
        model: ModelId,
        attr: String,
        data: ColumnData,
        cols: Option<Vec<String>>,
    },
    ColumnsStreamed {
        model: ModelId,
        attr: String,
        data: ColumnData,
        rollover: Option<usize>,
    },
    ColumnsPatched {
        model: ModelId,
        attr: String,
        patches: ColumnPatches,
    },
}

impl DocumentChange {
    /// The wire `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentChange::ModelChanged { .. } => "ModelChanged",
            DocumentChange::MessageSent { .. } => "MessageSent",
            DocumentChange::TitleChanged { .. } => "TitleChanged",
            DocumentChange::RootAdded { .. } => "RootAdded",
            DocumentChange::RootRemoved { .. } => "RootRemoved",
            DocumentChange::ColumnDataChanged { .. } => "ColumnDataChanged",
            DocumentChange::ColumnsStreamed { .. } => "ColumnsStreamed",
            DocumentChange::ColumnsPatched { .. } => "ColumnsPatched",
        }
    }

    /// The model the change applies to, if any.
    pub fn model(&self) -> Option<&ModelId> {
        match self {
            DocumentChange::ModelChanged { model, .. }
            | DocumentChange::RootAdded { model }
            | DocumentChange::RootRemoved { model }
            | DocumentChange::ColumnDataChanged { model, .. }
            | DocumentChange::ColumnsStreamed { model, .. }
            | DocumentChange::ColumnsPatched { model, .. } => Some(model),
            DocumentChange::MessageSent { .. } | DocumentChange::TitleChanged { .. } => None,
        }
    }

    /// Encodes the change as a patch record.
    pub fn to_json(&self, ser: &mut Serializer<'_>) -> Result<Json, SerializationError> {
        let kind = self.kind();
        Ok(match self {
            DocumentChange::ModelChanged { hint: Some(hint), .. } => return hint.to_json(ser),
            DocumentChange::ModelChanged { model, attr, new, .. } => json!({
                "kind": kind,
                "model": model_ref(model),
                "attr": attr,
                "new": ser.encode(new)?,
            }),
            DocumentChange::MessageSent { msg_type, msg_data } => json!({
                "kind": kind,
                "msg_type": msg_type,
                "msg_data": ser.encode(msg_data)?,
            }),
            DocumentChange::TitleChanged { title } => json!({ "kind": kind, "title": title }),
            DocumentChange::RootAdded { model } => json!({
                "kind": kind,
                "model": ser.encode(&Value::Ref(model.clone()))?,
            }),
            DocumentChange::RootRemoved { model } => json!({
                "kind": kind,
                "model": model_ref(model),
            }),
            DocumentChange::ColumnDataChanged { model, attr, data, cols } => {
                let data: ColumnData = match cols {
                    Some(cols) => cols
                        .iter()
                        .filter_map(|c| data.get(c).map(|v| (c.clone(), v.clone())))
                        .collect(),
                    None => data.clone(),
                };
                json!({
                    "kind": kind,
                    "model": model_ref(model),
                    "attr": attr,
                    "data": ser.encode(&Value::Dict(data))?,
                    "cols": cols,
                })
            }
            DocumentChange::ColumnsStreamed { model, attr, data, rollover } => json!({
                "kind": kind,
                "model": model_ref(model),
                "attr": attr,
                "data": ser.encode(&Value::Dict(data.clone()))?,
                "rollover": rollover,
            }),
            DocumentChange::ColumnsPatched { model, attr, patches } => {
                let mut encoded = Vec::with_capacity(patches.len());
                for (column, items) in patches {
                    let mut pairs = Vec::with_capacity(items.len());
                    for (index, value) in items {
                        pairs.push(json!([ser.encode(index)?, ser.encode(value)?]));
                    }
                    encoded.push(json!([column, pairs]));
                }
                json!({
                    "kind": kind,
                    "model": model_ref(model),
                    "attr": attr,
                    "patches": { "type": "map", "entries": encoded },
                })
            }
        })
    }

    /// Rebuilds a change from a decoded patch record.
    ///
    /// A `MessageSent` record without `msg_data` takes its payload from the
    /// single accompanying buffer.
    pub(crate) fn from_record(record: Value, buffers: &Buffers) -> Result<Self, DocumentError> {
        let mut fields = match record {
            Value::Dict(fields) => fields,
            other => {
                return Err(malformed(format!(
                    "patch event must be an object, got {}",
                    other.type_name()
                )))
            }
        };
        let kind = match fields.shift_remove("kind") {
            Some(Value::Str(kind)) => kind,
            _ => return Err(malformed("patch event without kind".into())),
        };

        Ok(match kind.as_str() {
            "ModelChanged" => DocumentChange::ModelChanged {
                model: take_model(&mut fields)?,
                attr: take_str(&mut fields, "attr")?,
                old: Value::Null,
                new: fields.shift_remove("new").unwrap_or_default(),
                hint: None,
            },
            "MessageSent" => {
                let msg_type = take_str(&mut fields, "msg_type")?;
                let msg_data = match fields.shift_remove("msg_data") {
                    Some(data) => data,
                    None if buffers.len() == 1 => {
                        Value::Bytes(buffers.values().next().cloned().unwrap_or_default())
                    }
                    None => return Err(DocumentError::ExpectedOneBuffer(buffers.len())),
                };
                DocumentChange::MessageSent { msg_type, msg_data }
            }
            "TitleChanged" => DocumentChange::TitleChanged {
                title: take_str(&mut fields, "title")?,
            },
            "RootAdded" => DocumentChange::RootAdded {
                model: take_model(&mut fields)?,
            },
            "RootRemoved" => DocumentChange::RootRemoved {
                model: take_model(&mut fields)?,
            },
            "ColumnDataChanged" => DocumentChange::ColumnDataChanged {
                model: take_model(&mut fields)?,
                attr: take_attr(&mut fields)?,
                data: take_columns(&mut fields, "data")?,
                cols: match fields.shift_remove("cols") {
                    None | Some(Value::Null) => None,
                    Some(Value::List(cols)) => Some(
                        cols.into_iter()
                            .map(|c| match c {
                                Value::Str(c) => Ok(c),
                                other => Err(malformed(format!("column name must be a string, got {}", other.type_name()))),
                            })
                            .collect::<Result<_, _>>()?,
                    ),
                    Some(other) => return Err(malformed(format!("cols must be a list, got {}", other.type_name()))),
                },
            },
            "ColumnsStreamed" => DocumentChange::ColumnsStreamed {
                model: take_model(&mut fields)?,
                attr: take_attr(&mut fields)?,
                data: take_columns(&mut fields, "data")?,
                rollover: match fields.shift_remove("rollover") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        v.as_i64()
                            .and_then(|n| usize::try_from(n).ok())
                            .ok_or_else(|| malformed("rollover must be a non-negative integer".into()))?,
                    ),
                },
            },
            "ColumnsPatched" => {
                let model = take_model(&mut fields)?;
                let attr = take_attr(&mut fields)?;
                let mut patches = ColumnPatches::new();
                for (column, items) in take_columns(&mut fields, "patches")? {
                    let Value::List(items) = items else {
                        return Err(malformed(format!("patches for '{column}' must be a list")));
                    };
                    let mut pairs = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::List(pair) if pair.len() == 2 => {
                                let mut pair = pair.into_iter();
                                let index = pair.next().unwrap_or_default();
                                let value = pair.next().unwrap_or_default();
                                pairs.push((index, value));
                            }
                            _ => return Err(malformed(format!("patch for '{column}' must be an [index, value] pair"))),
                        }
                    }
                    patches.insert(column, pairs);
                }
                DocumentChange::ColumnsPatched { model, attr, patches }
            }
            _ => return Err(DocumentError::UnknownPatchEvent(kind)),
        })
    }
}

fn model_ref(id: &ModelId) -> Json {
    json!({ "id": id.as_str() })
}

fn malformed(msg: String) -> DocumentError {
    DocumentError::MalformedEvent(msg)
}

fn take_str(fields: &mut IndexMap<String, Value>, name: &str) -> Result<String, DocumentError> {
    match fields.shift_remove(name) {
        Some(Value::Str(s)) => Ok(s),
        _ => Err(malformed(format!("field '{name}' must be a string"))),
    }
}

fn take_attr(fields: &mut IndexMap<String, Value>) -> Result<String, DocumentError> {
    match fields.shift_remove("attr") {
        None | Some(Value::Null) => Ok("data".to_owned()),
        Some(Value::Str(s)) => Ok(s),
        Some(_) => Err(malformed("field 'attr' must be a string".into())),
    }
}

fn take_model(fields: &mut IndexMap<String, Value>) -> Result<ModelId, DocumentError> {
    match fields.shift_remove("model") {
        Some(Value::Ref(id)) => Ok(id),
        _ => Err(malformed("field 'model' must reference a model".into())),
    }
}

fn take_columns(fields: &mut IndexMap<String, Value>, name: &str) -> Result<ColumnData, DocumentError> {
    match fields.shift_remove(name) {
        Some(Value::Dict(columns)) => Ok(columns),
        None | Some(Value::Null) => Ok(ColumnData::new()),
        Some(other) => Err(malformed(format!("field '{name}' must be a mapping, got {}", other.type_name()))),
    }
}

/// A change together with the document it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChangedEvent {
    pub document: DocumentId,
    pub change: DocumentChange,
}

/// What `on_change` callbacks receive.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    Changed(DocumentChangedEvent),
    /// Changes queued while the document was held.
    Batch(Vec<DocumentChangedEvent>),
}

impl DocumentEvent {
    pub fn events(&self) -> &[DocumentChangedEvent] {
        match self {
            DocumentEvent::Changed(event) => std::slice::from_ref(event),
            DocumentEvent::Batch(events) => events,
        }
    }
}

/// Serialized patch content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub events: Vec<Json>,
}

// ── Application events ──────────────────────────────────────────────────────

/// Name of the event sent once a document finished its initial layout.
pub const DOCUMENT_READY: &str = "document_ready";
/// Name of the event opening an interactive level-of-detail session.
pub const LOD_START: &str = "lodstart";
/// Name of the event closing an interactive level-of-detail session.
pub const LOD_END: &str = "lodend";

/// An application-level event, optionally targeted at one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvent {
    pub name: String,
    pub origin: Option<ModelId>,
    pub values: IndexMap<String, Value>,
}

impl ModelEvent {
    pub fn new(name: impl Into<String>, origin: Option<ModelId>) -> Self {
        Self {
            name: name.into(),
            origin,
            values: IndexMap::new(),
        }
    }

    pub fn document_ready() -> Self {
        Self::new(DOCUMENT_READY, None)
    }

    pub fn lod_start(model: ModelId) -> Self {
        Self::new(LOD_START, Some(model))
    }

    pub fn lod_end(model: ModelId) -> Self {
        Self::new(LOD_END, Some(model))
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// `{name, values}` with the origin carried as `values.model`.
    pub fn to_value(&self) -> Value {
        let mut values = self.values.clone();
        if let Some(origin) = &self.origin {
            values.insert("model".to_owned(), Value::Ref(origin.clone()));
        }
        let mut out = IndexMap::new();
        out.insert("name".to_owned(), Value::Str(self.name.clone()));
        out.insert("values".to_owned(), Value::Dict(values));
        Value::Dict(out)
    }
}
