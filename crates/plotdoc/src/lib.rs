//! Document synchronization core for a plotting library.
//!
//! A [`Document`] holds a graph of property-bag [`Model`]s, tracks which of
//! them are reachable from its roots, reports local edits as change events,
//! and exchanges JSON documents and patches with a peer holding a copy of the
//! same scene graph.
//!
//! ```
//! use plotdoc::{Document, Value};
//!
//! let mut doc = Document::new();
//! let source = doc
//!     .create_model("ColumnDataSource", [("data", Value::dict([("x", Value::list([1, 2, 3]))]))])
//!     .unwrap();
//! doc.add_root(&source).unwrap();
//! assert!(doc.get_model_by_id(&source).is_some());
//!
//! let json = doc.to_json_string(true).unwrap();
//! let copy = Document::from_json_string(&json).unwrap();
//! assert_eq!(copy.roots(), doc.roots());
//! ```

pub mod defs;
pub mod document;
pub mod error;
pub mod events;
pub mod kinds;
pub mod model;
pub mod registry;
pub mod serialization;
pub mod sources;
pub mod value;

pub use defs::{decode_def, encode_def, ModelDef, OverrideDef, PropertyDef};
pub use document::{
    CallbackId, DocJson, Document, DocumentBuilder, EventManager, HoldPolicy, LifecycleEvent,
    VERSION,
};
pub use error::DocumentError;
pub use events::{DocumentChange, DocumentChangedEvent, DocumentEvent, ModelEvent, Patch};
pub use kinds::{kind_of, Kind, KindError};
pub use model::{make_id, DocumentId, Model, ModelId, ModelStore, MutationContext, PropertyError};
pub use registry::{Registry, RegistryError, TypeDescriptor};
pub use serialization::{
    Buffer, Buffers, DeserializationError, Deserializer, SerializationError, Serialized, Serializer,
    SerializerOptions,
};
pub use sources::ColumnError;
pub use value::{NdArray, Slice, TypedArray, Value};
