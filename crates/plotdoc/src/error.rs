use crate::model::{DocumentId, ModelId, PropertyError};
use crate::registry::RegistryError;
use crate::serialization::{DeserializationError, SerializationError};
use crate::sources::ColumnError;

/// Errors raised by [`Document`](crate::Document) operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("attempted to overwrite a document with itself")]
    MoveIntoSelf,
    #[error("model {0} is not in the document")]
    UnknownModel(ModelId),
    #[error("found more than one model named '{name}' ({count} matches)")]
    AmbiguousName { name: String, count: usize },
    #[error("patch event belongs to document {found}, not {expected}")]
    ForeignEvent { expected: DocumentId, found: DocumentId },
    #[error("unknown patch event '{0}'")]
    UnknownPatchEvent(String),
    #[error("malformed patch event: {0}")]
    MalformedEvent(String),
    #[error("expected exactly one buffer, got {0}")]
    ExpectedOneBuffer(usize),
    #[error("model {0} is not a column data source")]
    NotADataSource(ModelId),
    #[error("document invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error("invalid document json: {0}")]
    Json(#[from] serde_json::Error),
}
