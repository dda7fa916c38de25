//! Model arena.
//!
//! # Overview
//!
//! Models are property bags addressed by a [`ModelId`] and stored in a
//! [`ModelStore`]. A model points at another model by holding a
//! [`Value::Ref`] in one of its properties, so the object graph (which may be
//! cyclic through shared children) lives entirely in id space and is walked
//! with an explicit worklist in [`ModelStore::references`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};

use crate::kinds::InstanceCheck;
use crate::registry::Registry;
use crate::value::Value;

static NEXT_ID: AtomicU64 = AtomicU64::new(1000);
static NEXT_DOCUMENT: AtomicU64 = AtomicU64::new(1);

/// Globally unique model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a fresh process-unique id (`p1000`, `p1001`, ...).
pub fn make_id() -> ModelId {
    ModelId(format!("p{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)))
}

/// Identity of a [`Document`](crate::Document).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(u64);

impl DocumentId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DOCUMENT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc{}", self.0)
    }
}

/// Who is performing a property mutation.
///
/// Local edits produce change events; replaying a received patch must not,
/// since the change is already synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationContext {
    UserEdit,
    PatchReplay,
}

#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    #[error("unknown model {0}")]
    UnknownModel(ModelId),
    #[error("can't resolve type '{0}'")]
    UnknownType(String),
    #[error("model {0} already exists")]
    DuplicateId(ModelId),
    #[error("{type_name} has no property '{attr}'")]
    UnknownProperty { type_name: String, attr: String },
    #[error("{type_name}.{attr} expected a value of kind {expected}, got {got}")]
    InvalidValue {
        type_name: String,
        attr: String,
        expected: String,
        got: &'static str,
    },
}

/// A node of the scene graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    id: ModelId,
    type_name: String,
    properties: IndexMap<String, Value>,
    document: Option<DocumentId>,
}

impl Model {
    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.properties.get(attr)
    }

    pub fn properties(&self) -> &IndexMap<String, Value> {
        &self.properties
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get("name").and_then(Value::as_str)
    }

    /// The document this model is currently attached to.
    pub fn document(&self) -> Option<DocumentId> {
        self.document
    }

    pub(crate) fn attach_document(&mut self, doc: DocumentId) {
        self.document = Some(doc);
    }

    pub(crate) fn detach_document(&mut self) {
        self.document = None;
    }

    /// Direct references held by this model's properties.
    pub fn direct_refs(&self) -> Vec<ModelId> {
        let mut out = Vec::new();
        for value in self.properties.values() {
            value.collect_refs(&mut out);
        }
        out
    }
}

/// Arena of models keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    models: IndexMap<ModelId, Model>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, id: &ModelId) -> Option<&Model> {
        self.models.get(id)
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub(crate) fn get_mut(&mut self, id: &ModelId) -> Option<&mut Model> {
        self.models.get_mut(id)
    }

    pub(crate) fn insert(&mut self, model: Model) -> Result<(), PropertyError> {
        if self.models.contains_key(&model.id) {
            return Err(PropertyError::DuplicateId(model.id));
        }
        self.models.insert(model.id.clone(), model);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: &ModelId) -> Option<Model> {
        self.models.shift_remove(id)
    }

    /// Allocates a model of `type_name` with every property at its default.
    pub fn instantiate(
        &mut self,
        registry: &Registry,
        type_name: &str,
        id: ModelId,
    ) -> Result<&Model, PropertyError> {
        if !registry.contains(type_name) {
            return Err(PropertyError::UnknownType(type_name.to_owned()));
        }
        if self.models.contains_key(&id) {
            return Err(PropertyError::DuplicateId(id));
        }
        let model = Model {
            id: id.clone(),
            type_name: type_name.to_owned(),
            properties: registry.defaults(type_name),
            document: None,
        };
        Ok(self.models.entry(id).or_insert(model))
    }

    /// Checks that `value` is acceptable for `attr` on model `id`.
    pub fn validate(
        &self,
        registry: &Registry,
        id: &ModelId,
        attr: &str,
        value: &Value,
    ) -> Result<(), PropertyError> {
        let model = self
            .models
            .get(id)
            .ok_or_else(|| PropertyError::UnknownModel(id.clone()))?;
        let prop = registry.property(&model.type_name, attr).ok_or_else(|| {
            PropertyError::UnknownProperty {
                type_name: model.type_name.clone(),
                attr: attr.to_owned(),
            }
        })?;
        let check = TypeView {
            store: self,
            registry,
        };
        if prop.kind.validate(value, &check) {
            Ok(())
        } else {
            Err(PropertyError::InvalidValue {
                type_name: model.type_name.clone(),
                attr: attr.to_owned(),
                expected: prop.kind.to_string(),
                got: value.type_name(),
            })
        }
    }

    /// Validates and stores a property value.
    ///
    /// Returns the previous value when the property changed. With `check_eq`
    /// an equal value is a no-op and returns `None`.
    pub fn set_property(
        &mut self,
        registry: &Registry,
        id: &ModelId,
        attr: &str,
        value: Value,
        check_eq: bool,
    ) -> Result<Option<Value>, PropertyError> {
        self.validate(registry, id, attr, &value)?;
        let model = self
            .models
            .get_mut(id)
            .ok_or_else(|| PropertyError::UnknownModel(id.clone()))?;
        match model.properties.get_mut(attr) {
            Some(slot) => {
                if check_eq && *slot == value {
                    return Ok(None);
                }
                Ok(Some(std::mem::replace(slot, value)))
            }
            None => {
                model.properties.insert(attr.to_owned(), value);
                Ok(Some(Value::Null))
            }
        }
    }

    /// The model itself plus every model transitively reachable from it.
    ///
    /// Cycle safe. Ids that do not resolve in this store are skipped.
    pub fn references(&self, id: &ModelId) -> IndexSet<ModelId> {
        let mut seen = IndexSet::new();
        let mut work = vec![id.clone()];
        while let Some(next) = work.pop() {
            if seen.contains(&next) {
                continue;
            }
            let Some(model) = self.models.get(&next) else {
                tracing::warn!(model = %next, "skipping dangling model reference");
                continue;
            };
            let refs = model.direct_refs();
            seen.insert(next);
            for r in refs.into_iter().rev() {
                if !seen.contains(&r) {
                    work.push(r);
                }
            }
        }
        seen
    }

    pub fn is_instance(&self, registry: &Registry, id: &ModelId, type_name: &str) -> bool {
        self.models
            .get(id)
            .is_some_and(|m| registry.is_subtype(&m.type_name, type_name))
    }
}

/// Joins a store and a registry to answer kind-validation questions.
pub(crate) struct TypeView<'a> {
    pub store: &'a ModelStore,
    pub registry: &'a Registry,
}

impl InstanceCheck for TypeView<'_> {
    fn exists(&self, id: &ModelId) -> bool {
        self.store.contains(id)
    }

    fn is_instance(&self, id: &ModelId, type_name: &str) -> bool {
        self.store.is_instance(self.registry, id, type_name)
    }
}
