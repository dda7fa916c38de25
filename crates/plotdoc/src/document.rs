//! The synchronized document.
//!
//! # Overview
//!
//! A [`Document`] owns a model arena, the type [`Registry`] used to
//! materialize models, and the list of roots. The set of models reachable
//! from the roots (the closure, see [`Document::all_models`]) is recomputed
//! whenever root membership or a reference-bearing property changes. Models
//! entering the closure are attached to the document, models leaving it are
//! detached, each exactly once per transition.
//!
//! Structural edits can be grouped with [`Document::push_freeze`] /
//! [`Document::pop_freeze`] (or [`Document::with_freeze`]); the closure is
//! recomputed once, when the outermost freeze is released.
//!
//! Local edits produce [`DocumentChangedEvent`]s which `on_change` callbacks
//! receive and which [`Document::create_json_patch`] turns into a [`Patch`].
//! [`Document::apply_json_patch`] replays a patch produced by a peer without
//! producing new change events.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::defs::{encode_def, ModelDef};
use crate::error::DocumentError;
use crate::events::{
    ColumnData, ColumnPatches, DocumentChange, DocumentChangedEvent, DocumentEvent, ModelEvent,
    Patch, BOKEH_EVENT,
};
use crate::model::{make_id, DocumentId, Model, ModelId, ModelStore, MutationContext};
use crate::registry::{Registry, COLUMN_DATA_SOURCE, LAYOUT_DOM};
use crate::serialization::{
    Buffers, DeserializationError, Deserializer, Serialized, Serializer, SerializerOptions,
};
use crate::sources;
use crate::value::Value;

/// Library version stamped into serialized documents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Title of a freshly created document.
pub const DEFAULT_TITLE: &str = "Bokeh Application";

/// Property holding the columns of a data source.
const DATA: &str = "data";

/// Handle returned when registering a callback, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Attach/detach notification for a model entering or leaving the closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Attached(ModelId),
    Detached(ModelId),
}

/// How changes are queued while a document is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPolicy {
    /// Later changes to the same model attribute replace earlier ones.
    Combine,
    /// Every change is kept.
    Collect,
}

pub type ChangeCallback = Box<dyn FnMut(&DocumentEvent)>;
pub type MessageCallback = Box<dyn FnMut(&Value)>;
pub type LifecycleCallback = Box<dyn FnMut(&LifecycleEvent)>;
pub type IdleCallback = Box<dyn FnMut()>;
pub type EventHandler = Box<dyn FnMut(&ModelEvent)>;
/// Invoked when an interactive session ends.
pub type Finalize = Box<dyn FnOnce()>;

// ── Wire form ───────────────────────────────────────────────────────────────

/// Serialized document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defs: Option<Vec<ModelDef>>,
    pub roots: Vec<Json>,
}

fn pyify(version: &str) -> String {
    version.replacen("-dev.", "dev", 1).replacen("-rc.", "rc", 1)
}

fn check_version(version: Option<&str>) {
    let Some(remote) = version else {
        tracing::warn!("'version' field is missing");
        return;
    };
    let is_dev = remote.contains('+') || remote.contains('-');
    if !is_dev && pyify(VERSION) != remote {
        tracing::warn!(local = VERSION, remote, "library version mismatch");
    } else {
        tracing::debug!(local = VERSION, remote, "library versions");
    }
}

// ── Event manager ───────────────────────────────────────────────────────────

/// Routes application events to the models subscribed to them.
#[derive(Default)]
pub struct EventManager {
    subscribed: IndexMap<ModelId, EventHandler>,
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribed", &self.subscribed.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, model: ModelId, handler: impl FnMut(&ModelEvent) + 'static) {
        self.subscribed.insert(model, Box::new(handler));
    }

    pub fn unsubscribe(&mut self, model: &ModelId) -> bool {
        self.subscribed.shift_remove(model).is_some()
    }

    pub fn is_subscribed(&self, model: &ModelId) -> bool {
        self.subscribed.contains_key(model)
    }

    /// Delivers `event` to every subscriber, or only to its origin when it
    /// has one. Returns the number of handlers invoked.
    pub fn trigger(&mut self, event: &ModelEvent) -> usize {
        let mut delivered = 0;
        for (model, handler) in self.subscribed.iter_mut() {
            if event.origin.as_ref().is_some_and(|origin| origin != model) {
                continue;
            }
            handler(event);
            delivered += 1;
        }
        delivered
    }

    /// Wraps an application event as a message for the change pipeline.
    pub fn send_event(&self, event: &ModelEvent) -> DocumentChange {
        DocumentChange::MessageSent {
            msg_type: BOKEH_EVENT.to_owned(),
            msg_data: event.to_value(),
        }
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Configures a new [`Document`].
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    registry: Option<Registry>,
    title: Option<String>,
    id: Option<DocumentId>,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type registry to resolve models against. Defaults to the builtins.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Reuses an existing identity instead of allocating a fresh one.
    pub fn id(mut self, id: DocumentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn build(self) -> Document {
        Document {
            id: self.id.unwrap_or_else(DocumentId::next),
            registry: self.registry.unwrap_or_default(),
            store: ModelStore::new(),
            roots: Vec::new(),
            all_models: IndexSet::new(),
            new_models: IndexSet::new(),
            title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_owned()),
            freeze_count: 0,
            closure_version: 0,
            next_callback: 0,
            callbacks: IndexMap::new(),
            message_callbacks: IndexMap::new(),
            lifecycle_callbacks: IndexMap::new(),
            idle_callbacks: IndexMap::new(),
            idle_roots: HashSet::new(),
            idle_fired: false,
            interactive: None,
            held: None,
            event_manager: EventManager::new(),
        }
    }
}

// ── Document ────────────────────────────────────────────────────────────────

struct InteractiveSession {
    model: ModelId,
    finalize: Option<Finalize>,
    started: Instant,
}

pub struct Document {
    id: DocumentId,
    registry: Registry,
    store: ModelStore,
    roots: Vec<ModelId>,
    all_models: IndexSet<ModelId>,
    new_models: IndexSet<ModelId>,
    title: String,
    freeze_count: usize,
    closure_version: u64,
    next_callback: u64,
    callbacks: IndexMap<CallbackId, (bool, ChangeCallback)>,
    message_callbacks: IndexMap<String, IndexMap<CallbackId, MessageCallback>>,
    lifecycle_callbacks: IndexMap<CallbackId, LifecycleCallback>,
    idle_callbacks: IndexMap<CallbackId, IdleCallback>,
    idle_roots: HashSet<ModelId>,
    idle_fired: bool,
    interactive: Option<InteractiveSession>,
    held: Option<(HoldPolicy, Vec<DocumentChangedEvent>)>,
    event_manager: EventManager,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("roots", &self.roots)
            .field("all_models", &self.all_models.len())
            .field("freeze_count", &self.freeze_count)
            .finish_non_exhaustive()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        DocumentBuilder::new().build()
    }

    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn roots(&self) -> &[ModelId] {
        &self.roots
    }

    /// Every model reachable from the roots.
    pub fn all_models(&self) -> &IndexSet<ModelId> {
        &self.all_models
    }

    /// Models attached since the last patch was created.
    pub fn new_models(&self) -> &IndexSet<ModelId> {
        &self.new_models
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Number of closure recomputations performed so far.
    pub fn closure_version(&self) -> u64 {
        self.closure_version
    }

    pub fn freeze_count(&self) -> usize {
        self.freeze_count
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.event_manager
    }

    pub fn event_manager_mut(&mut self) -> &mut EventManager {
        &mut self.event_manager
    }

    // ── Models ──────────────────────────────────────────────────────────────

    /// Creates a model with a fresh id. It joins the closure once reachable
    /// from a root.
    pub fn create_model<'a>(
        &mut self,
        type_name: &str,
        attrs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<ModelId, DocumentError> {
        self.create_model_with_id(type_name, make_id(), attrs)
    }

    pub fn create_model_with_id<'a>(
        &mut self,
        type_name: &str,
        id: ModelId,
        attrs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<ModelId, DocumentError> {
        self.store.instantiate(&self.registry, type_name, id.clone())?;
        for (attr, value) in attrs {
            if let Err(err) = self.store.set_property(&self.registry, &id, attr, value, false) {
                self.store.remove(&id);
                return Err(err.into());
            }
        }
        Ok(id)
    }

    /// Any model held by this document, attached or not.
    pub fn model(&self, id: &ModelId) -> Option<&Model> {
        self.store.get(id)
    }

    pub fn is_instance(&self, id: &ModelId, type_name: &str) -> bool {
        self.store.is_instance(&self.registry, id, type_name)
    }

    /// A model of the closure by id.
    pub fn get_model_by_id(&self, id: &ModelId) -> Option<&Model> {
        if self.all_models.contains(id) {
            self.store.get(id)
        } else {
            None
        }
    }

    /// A model of the closure by its `name` property.
    pub fn get_model_by_name(&self, name: &str) -> Result<Option<&Model>, DocumentError> {
        let mut found = self
            .all_models
            .iter()
            .filter_map(|id| self.store.get(id))
            .filter(|m| m.name() == Some(name));
        let first = found.next();
        let rest = found.count();
        if rest > 0 {
            return Err(DocumentError::AmbiguousName {
                name: name.to_owned(),
                count: rest + 1,
            });
        }
        Ok(first)
    }

    /// Sets a property as a local edit.
    pub fn set_property(&mut self, id: &ModelId, attr: &str, value: impl Into<Value>) -> Result<(), DocumentError> {
        self.set_property_with(id, attr, value.into(), MutationContext::UserEdit, true, None)
    }

    fn set_property_with(
        &mut self,
        id: &ModelId,
        attr: &str,
        value: Value,
        context: MutationContext,
        check_eq: bool,
        hint: Option<DocumentChange>,
    ) -> Result<(), DocumentError> {
        let new = value.clone();
        let Some(old) = self
            .store
            .set_property(&self.registry, id, attr, value, check_eq)?
        else {
            return Ok(());
        };
        if !self.all_models.contains(id) {
            return Ok(());
        }
        if old.has_refs() || new.has_refs() {
            tracing::debug!(model = %id, attr, "references changed, invalidating closure");
            self.push_freeze();
            self.pop_freeze();
        }
        if context == MutationContext::UserEdit {
            self.trigger_on_change(DocumentChange::ModelChanged {
                model: id.clone(),
                attr: attr.to_owned(),
                old,
                new,
                hint: hint.map(Box::new),
            });
        }
        Ok(())
    }

    // ── Roots ───────────────────────────────────────────────────────────────

    pub fn add_root(&mut self, id: &ModelId) -> Result<(), DocumentError> {
        self.add_root_with(id, MutationContext::UserEdit)
    }

    fn add_root_with(&mut self, id: &ModelId, context: MutationContext) -> Result<(), DocumentError> {
        if !self.store.contains(id) {
            return Err(DocumentError::UnknownModel(id.clone()));
        }
        if self.roots.contains(id) {
            return Ok(());
        }
        tracing::debug!(document = %self.id, model = %id, "adding root");
        self.with_freeze(|doc| doc.roots.push(id.clone()));
        if context == MutationContext::UserEdit {
            self.trigger_on_change(DocumentChange::RootAdded { model: id.clone() });
        }
        Ok(())
    }

    /// Removes a root. Removing a model that is not a root does nothing.
    pub fn remove_root(&mut self, id: &ModelId) {
        self.remove_root_with(id, MutationContext::UserEdit);
    }

    fn remove_root_with(&mut self, id: &ModelId, context: MutationContext) {
        let Some(index) = self.roots.iter().position(|r| r == id) else {
            return;
        };
        tracing::debug!(document = %self.id, model = %id, "removing root");
        self.with_freeze(|doc| {
            doc.roots.remove(index);
        });
        if context == MutationContext::UserEdit {
            self.trigger_on_change(DocumentChange::RootRemoved { model: id.clone() });
        }
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.set_title_with(title.into(), MutationContext::UserEdit);
    }

    fn set_title_with(&mut self, title: String, context: MutationContext) {
        if title == self.title {
            return;
        }
        self.title = title.clone();
        if context == MutationContext::UserEdit {
            self.trigger_on_change(DocumentChange::TitleChanged { title });
        }
    }

    /// Removes every root, recomputing the closure once.
    pub fn clear(&mut self) {
        self.with_freeze(|doc| {
            while let Some(root) = doc.roots.first().cloned() {
                doc.remove_root(&root);
            }
        });
    }

    // ── Freeze ──────────────────────────────────────────────────────────────

    pub fn push_freeze(&mut self) {
        self.freeze_count += 1;
    }

    /// Releases one freeze level, recomputing the closure at the outermost.
    pub fn pop_freeze(&mut self) {
        match self.freeze_count {
            0 => tracing::warn!(document = %self.id, "pop_freeze without matching push_freeze"),
            1 => {
                self.freeze_count = 0;
                self.recompute_all_models();
            }
            _ => self.freeze_count -= 1,
        }
    }

    pub fn with_freeze<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push_freeze();
        let out = f(self);
        self.pop_freeze();
        out
    }

    /// Recomputes the closure, detaching models that left it before
    /// attaching the ones that joined.
    pub fn recompute_all_models(&mut self) {
        let mut closure = IndexSet::new();
        for root in &self.roots {
            closure.extend(self.store.references(root));
        }
        let detached: Vec<ModelId> = self.all_models.difference(&closure).cloned().collect();
        let attached: Vec<ModelId> = closure.difference(&self.all_models).cloned().collect();
        self.all_models = closure;
        self.closure_version += 1;

        for id in detached {
            if let Some(model) = self.store.get_mut(&id) {
                model.detach_document();
            }
            self.new_models.shift_remove(&id);
            self.idle_roots.remove(&id);
            self.notify_lifecycle(LifecycleEvent::Detached(id));
        }
        for id in attached {
            if let Some(model) = self.store.get_mut(&id) {
                model.attach_document(self.id);
            }
            self.new_models.insert(id.clone());
            self.notify_lifecycle(LifecycleEvent::Attached(id));
        }
        tracing::debug!(
            document = %self.id,
            models = self.all_models.len(),
            version = self.closure_version,
            "recomputed closure"
        );
    }

    fn notify_lifecycle(&mut self, event: LifecycleEvent) {
        for callback in self.lifecycle_callbacks.values_mut() {
            callback(&event);
        }
    }

    // ── Move ────────────────────────────────────────────────────────────────

    /// Moves every root of `self`, with the models they reach, into `dest`.
    ///
    /// `dest` is cleared first and its title replaced; `self` is left empty.
    pub fn destructively_move(&mut self, dest: &mut Document) -> Result<(), DocumentError> {
        if self.id == dest.id {
            return Err(DocumentError::MoveIntoSelf);
        }
        dest.clear();
        dest.store = ModelStore::new();
        dest.new_models.clear();
        dest.idle_roots.clear();
        dest.idle_fired = false;

        let roots = self.roots.clone();
        let closure = self.all_models.clone();
        self.clear();

        for root in &roots {
            if self.store.get(root).and_then(Model::document).is_some() {
                return Err(DocumentError::Invariant(format!(
                    "root {root} is still attached after removal"
                )));
            }
        }
        if !self.all_models.is_empty() {
            return Err(DocumentError::Invariant(format!(
                "{} models remain in the closure after clear",
                self.all_models.len()
            )));
        }

        for id in &closure {
            if let Some(model) = self.store.remove(id) {
                dest.store.insert(model)?;
            }
        }
        dest.registry.merge_from(&self.registry);
        dest.with_freeze(|dest| -> Result<(), DocumentError> {
            for root in &roots {
                dest.add_root(root)?;
            }
            Ok(())
        })?;
        dest.set_title(self.title.clone());
        Ok(())
    }

    // ── JSON ────────────────────────────────────────────────────────────────

    pub fn to_json(&self, include_defaults: bool) -> Result<DocJson, DocumentError> {
        let mut ser = Serializer::new(
            &self.store,
            &self.registry,
            SerializerOptions {
                include_defaults,
                binary: false,
            },
        );
        let mut defs = Vec::new();
        for desc in self.registry.user_types() {
            defs.push(encode_def(desc, &mut ser)?);
        }
        let mut roots = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            roots.push(ser.encode_model(root)?);
        }
        Ok(DocJson {
            version: Some(VERSION.to_owned()),
            title: Some(self.title.clone()),
            defs: (!defs.is_empty()).then_some(defs),
            roots,
        })
    }

    pub fn to_json_string(&self, include_defaults: bool) -> Result<String, DocumentError> {
        Ok(serde_json::to_string(&self.to_json(include_defaults)?)?)
    }

    pub fn from_json(json: &DocJson) -> Result<Document, DocumentError> {
        Self::from_json_with(json, Registry::with_builtins())
    }

    /// Like [`Document::from_json`], resolving types against `registry`.
    pub fn from_json_with(json: &DocJson, registry: Registry) -> Result<Document, DocumentError> {
        tracing::debug!("creating document from json");
        check_version(json.version.as_deref());

        let mut doc = DocumentBuilder::new().registry(registry).build();
        let mut roots = Vec::with_capacity(json.roots.len());
        {
            let mut de = Deserializer::new(&mut doc.store, &mut doc.registry);
            for def in json.defs.iter().flatten() {
                de.decode(&serde_json::to_value(def)?)?;
            }
            for rep in &json.roots {
                match de.decode(rep)? {
                    Value::Ref(id) => roots.push(id),
                    other => {
                        return Err(DeserializationError::Malformed(format!(
                            "document root must be a model, got {}",
                            other.type_name()
                        ))
                        .into())
                    }
                }
            }
        }
        doc.with_freeze(|doc| -> Result<(), DocumentError> {
            for root in &roots {
                doc.add_root(root)?;
            }
            Ok(())
        })?;
        if let Some(title) = &json.title {
            doc.set_title(title.clone());
        }
        Ok(doc)
    }

    pub fn from_json_string(s: &str) -> Result<Document, DocumentError> {
        let json: DocJson = serde_json::from_str(s)?;
        Self::from_json(&json)
    }

    /// Replaces the content of this document with `json`.
    pub fn replace_with_json(&mut self, json: &DocJson) -> Result<(), DocumentError> {
        let mut replacement = Self::from_json_with(json, self.registry.clone())?;
        replacement.destructively_move(self)
    }

    // ── Patches ─────────────────────────────────────────────────────────────

    /// Serializes `events` for a peer that holds every model attached before
    /// the previous patch. Marks all current models as known.
    pub fn create_json_patch(
        &mut self,
        events: &[DocumentChangedEvent],
    ) -> Result<Serialized<Patch>, DocumentError> {
        if let Some(foreign) = events.iter().find(|e| e.document != self.id) {
            return Err(DocumentError::ForeignEvent {
                expected: self.id,
                found: foreign.document,
            });
        }
        let known: Vec<ModelId> = self
            .all_models
            .iter()
            .filter(|id| !self.new_models.contains(*id))
            .cloned()
            .collect();
        let mut ser = Serializer::new(
            &self.store,
            &self.registry,
            SerializerOptions {
                include_defaults: false,
                binary: true,
            },
        )
        .with_references(known);

        let mut records = Vec::with_capacity(events.len());
        for event in events {
            records.push(event.change.to_json(&mut ser)?);
        }
        let buffers = ser.into_buffers();
        self.new_models.clear();
        Ok(Serialized {
            content: Patch { events: records },
            buffers,
        })
    }

    /// Replays a patch produced by a peer. No change events are emitted.
    pub fn apply_json_patch(&mut self, patch: &Patch, buffers: &Buffers) -> Result<(), DocumentError> {
        self.with_freeze(|doc| doc.replay_patch(patch, buffers))
    }

    fn replay_patch(&mut self, patch: &Patch, buffers: &Buffers) -> Result<(), DocumentError> {
        let mut materialized = Vec::new();
        let records = {
            let mut de = Deserializer::new(&mut self.store, &mut self.registry)
                .with_buffers(buffers.clone())
                .on_materialize(|id| materialized.push(id.clone()));
            patch
                .events
                .iter()
                .map(|event| de.decode(event))
                .collect::<Result<Vec<_>, _>>()?
        };
        let changes = records
            .into_iter()
            .map(|record| DocumentChange::from_record(record, buffers))
            .collect::<Result<Vec<_>, _>>()?;

        let context = MutationContext::PatchReplay;
        for change in changes {
            if let Some(target) = change.model() {
                let is_root_change = matches!(change, DocumentChange::RootAdded { .. });
                if !is_root_change && !self.all_models.contains(target) && !materialized.contains(target) {
                    return Err(DocumentError::UnknownModel(target.clone()));
                }
            }
            match change {
                DocumentChange::ModelChanged { model, attr, new, .. } => {
                    self.set_property_with(&model, &attr, new, context, true, None)?;
                }
                DocumentChange::ColumnDataChanged { model, attr, data, cols } => {
                    let current = self.columns(&model, &attr)?;
                    let merged = sources::merge_sparse(&current, data, cols.as_deref());
                    self.set_property_with(&model, &attr, Value::Dict(merged), context, false, None)?;
                }
                DocumentChange::ColumnsStreamed { model, attr, data, rollover } => {
                    self.stream_with(&model, &attr, data, rollover, context)?;
                }
                DocumentChange::ColumnsPatched { model, attr, patches } => {
                    self.patch_with(&model, &attr, patches, context)?;
                }
                DocumentChange::RootAdded { model } => self.add_root_with(&model, context)?,
                DocumentChange::RootRemoved { model } => self.remove_root_with(&model, context),
                DocumentChange::TitleChanged { title } => self.set_title_with(title, context),
                DocumentChange::MessageSent { msg_type, msg_data } => {
                    self.trigger_on_message(&msg_type, &msg_data);
                }
            }
        }
        Ok(())
    }

    // ── Columnar data ───────────────────────────────────────────────────────

    fn data_source(&self, id: &ModelId) -> Result<(), DocumentError> {
        if !self.store.contains(id) {
            return Err(DocumentError::UnknownModel(id.clone()));
        }
        if !self.is_instance(id, COLUMN_DATA_SOURCE) {
            return Err(DocumentError::NotADataSource(id.clone()));
        }
        Ok(())
    }

    /// Current columns of `attr` on a data source.
    fn columns(&self, id: &ModelId, attr: &str) -> Result<ColumnData, DocumentError> {
        self.data_source(id)?;
        Ok(self
            .store
            .get(id)
            .and_then(|m| m.get(attr))
            .and_then(Value::as_dict)
            .cloned()
            .unwrap_or_default())
    }

    /// Appends rows to a data source, keeping at most `rollover` rows.
    pub fn stream(
        &mut self,
        id: &ModelId,
        data: ColumnData,
        rollover: Option<usize>,
    ) -> Result<(), DocumentError> {
        self.stream_with(id, DATA, data, rollover, MutationContext::UserEdit)
    }

    fn stream_with(
        &mut self,
        id: &ModelId,
        attr: &str,
        data: ColumnData,
        rollover: Option<usize>,
        context: MutationContext,
    ) -> Result<(), DocumentError> {
        let mut columns = self.columns(id, attr)?;
        sources::stream_columns(&mut columns, &data, rollover)?;
        let hint = DocumentChange::ColumnsStreamed {
            model: id.clone(),
            attr: attr.to_owned(),
            data,
            rollover,
        };
        self.set_property_with(id, attr, Value::Dict(columns), context, false, Some(hint))
    }

    /// Overwrites cells of a data source.
    pub fn patch_columns(&mut self, id: &ModelId, patches: ColumnPatches) -> Result<(), DocumentError> {
        self.patch_with(id, DATA, patches, MutationContext::UserEdit)
    }

    fn patch_with(
        &mut self,
        id: &ModelId,
        attr: &str,
        patches: ColumnPatches,
        context: MutationContext,
    ) -> Result<(), DocumentError> {
        let mut columns = self.columns(id, attr)?;
        sources::patch_columns(&mut columns, &patches)?;
        let hint = DocumentChange::ColumnsPatched {
            model: id.clone(),
            attr: attr.to_owned(),
            patches,
        };
        self.set_property_with(id, attr, Value::Dict(columns), context, false, Some(hint))
    }

    /// Replaces the columns of a data source. With `cols`, only the listed
    /// columns are sent and columns absent from `data` are kept.
    pub fn set_columns(
        &mut self,
        id: &ModelId,
        data: ColumnData,
        cols: Option<Vec<String>>,
    ) -> Result<(), DocumentError> {
        let current = self.columns(id, DATA)?;
        let merged = sources::merge_sparse(&current, data, cols.as_deref());
        let hint = DocumentChange::ColumnDataChanged {
            model: id.clone(),
            attr: DATA.to_owned(),
            data: merged.clone(),
            cols,
        };
        self.set_property_with(
            id,
            DATA,
            Value::Dict(merged),
            MutationContext::UserEdit,
            false,
            Some(hint),
        )
    }

    // ── Callbacks ───────────────────────────────────────────────────────────

    fn next_callback_id(&mut self) -> CallbackId {
        self.next_callback += 1;
        CallbackId(self.next_callback)
    }

    /// Registers a change callback. Without `allow_batches`, batches are
    /// delivered one event at a time.
    pub fn on_change(&mut self, callback: impl FnMut(&DocumentEvent) + 'static, allow_batches: bool) -> CallbackId {
        let id = self.next_callback_id();
        self.callbacks.insert(id, (allow_batches, Box::new(callback)));
        id
    }

    pub fn remove_on_change(&mut self, id: CallbackId) -> bool {
        self.callbacks.shift_remove(&id).is_some()
    }

    pub fn on_message(&mut self, msg_type: impl Into<String>, callback: impl FnMut(&Value) + 'static) -> CallbackId {
        let id = self.next_callback_id();
        self.message_callbacks
            .entry(msg_type.into())
            .or_default()
            .insert(id, Box::new(callback));
        id
    }

    pub fn remove_on_message(&mut self, msg_type: &str, id: CallbackId) -> bool {
        self.message_callbacks
            .get_mut(msg_type)
            .is_some_and(|callbacks| callbacks.shift_remove(&id).is_some())
    }

    pub fn on_lifecycle(&mut self, callback: impl FnMut(&LifecycleEvent) + 'static) -> CallbackId {
        let id = self.next_callback_id();
        self.lifecycle_callbacks.insert(id, Box::new(callback));
        id
    }

    pub fn remove_on_lifecycle(&mut self, id: CallbackId) -> bool {
        self.lifecycle_callbacks.shift_remove(&id).is_some()
    }

    fn trigger_on_message(&mut self, msg_type: &str, msg_data: &Value) {
        if let Some(callbacks) = self.message_callbacks.get_mut(msg_type) {
            for callback in callbacks.values_mut() {
                callback(msg_data);
            }
        }
    }

    fn trigger_on_change(&mut self, change: DocumentChange) {
        let event = DocumentChangedEvent {
            document: self.id,
            change,
        };
        match &mut self.held {
            Some((policy, queue)) => {
                if *policy == HoldPolicy::Combine && combine_into(queue, &event) {
                    return;
                }
                queue.push(event);
            }
            None => self.dispatch(DocumentEvent::Changed(event)),
        }
    }

    fn dispatch(&mut self, event: DocumentEvent) {
        for (allow_batches, callback) in self.callbacks.values_mut() {
            match &event {
                DocumentEvent::Batch(events) if !*allow_batches => {
                    for single in events {
                        callback(&DocumentEvent::Changed(single.clone()));
                    }
                }
                _ => callback(&event),
            }
        }
    }

    // ── Hold ────────────────────────────────────────────────────────────────

    /// Queues change events until [`Document::unhold`].
    pub fn hold(&mut self, policy: HoldPolicy) {
        match &self.held {
            Some((current, _)) if *current != policy => {
                tracing::warn!(?current, requested = ?policy, "document already held with another policy");
            }
            Some(_) => {}
            None => self.held = Some((policy, Vec::new())),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Delivers queued events as one batch.
    pub fn unhold(&mut self) {
        let Some((_, events)) = self.held.take() else {
            return;
        };
        if !events.is_empty() {
            self.dispatch(DocumentEvent::Batch(events));
        }
    }

    // ── Application events ──────────────────────────────────────────────────

    /// Sends an application event through the change pipeline.
    pub fn send_event(&mut self, event: &ModelEvent) {
        let change = self.event_manager.send_event(event);
        self.trigger_on_change(change);
    }

    /// Delivers an incoming application event to subscribed models.
    pub fn trigger_event(&mut self, event: &ModelEvent) -> usize {
        self.event_manager.trigger(event)
    }

    // ── Idle ────────────────────────────────────────────────────────────────

    pub fn on_idle(&mut self, callback: impl FnMut() + 'static) -> CallbackId {
        let id = self.next_callback_id();
        self.idle_callbacks.insert(id, Box::new(callback));
        id
    }

    /// True once every layout root has reported idle.
    pub fn is_idle(&self) -> bool {
        self.roots
            .iter()
            .filter(|r| self.is_instance(r, LAYOUT_DOM))
            .all(|r| self.idle_roots.contains(r))
    }

    pub fn notify_idle(&mut self, model: &ModelId) {
        self.idle_roots.insert(model.clone());
        if self.idle_fired || !self.is_idle() {
            return;
        }
        self.idle_fired = true;
        tracing::info!(document = %self.id, "document idle");
        self.send_event(&ModelEvent::document_ready());
        for callback in self.idle_callbacks.values_mut() {
            callback();
        }
    }

    // ── Interactive sessions ────────────────────────────────────────────────

    /// Opens an interactive session on `model`. Nested calls keep the
    /// original model and only refresh the finalizer and timestamp.
    pub fn interactive_start(&mut self, model: &ModelId, finalize: Option<Finalize>) {
        match &mut self.interactive {
            Some(session) => {
                session.finalize = finalize;
                session.started = Instant::now();
            }
            None => {
                self.interactive = Some(InteractiveSession {
                    model: model.clone(),
                    finalize,
                    started: Instant::now(),
                });
                self.fire_lod(ModelEvent::lod_start(model.clone()));
            }
        }
    }

    pub fn interactive_stop(&mut self) {
        let Some(session) = self.interactive.take() else {
            return;
        };
        self.fire_lod(ModelEvent::lod_end(session.model));
        if let Some(finalize) = session.finalize {
            finalize();
        }
    }

    /// Delivers a level-of-detail event to its model's handler, then
    /// forwards it to the peer.
    fn fire_lod(&mut self, event: ModelEvent) {
        self.event_manager.trigger(&event);
        self.send_event(&event);
    }

    pub fn interactive_model(&self) -> Option<&ModelId> {
        self.interactive.as_ref().map(|s| &s.model)
    }

    pub fn interactive_duration(&self) -> Option<Duration> {
        self.interactive.as_ref().map(|s| s.started.elapsed())
    }
}

/// Folds `event` into an earlier queued change of the same attribute.
fn combine_into(queue: &mut [DocumentChangedEvent], event: &DocumentChangedEvent) -> bool {
    let DocumentChange::ModelChanged {
        model,
        attr,
        new,
        hint: None,
        ..
    } = &event.change
    else {
        return false;
    };
    for queued in queue.iter_mut().rev() {
        if let DocumentChange::ModelChanged {
            model: queued_model,
            attr: queued_attr,
            new: queued_new,
            hint: None,
            ..
        } = &mut queued.change
        {
            if queued_model == model && queued_attr == attr {
                *queued_new = new.clone();
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::Kind;
    use crate::registry::TypeDescriptor;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn doc() -> Document {
        let mut registry = Registry::with_builtins();
        registry
            .register(
                TypeDescriptor::new("Node")
                    .property("children", Kind::list(Kind::AnyRef), Value::List(Vec::new()))
                    .property("weight", Kind::Float, 0.0),
            )
            .unwrap();
        Document::builder().registry(registry).build()
    }

    fn record(doc: &mut Document) -> Rc<RefCell<Vec<DocumentEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        doc.on_change(move |e| sink.borrow_mut().push(e.clone()), true);
        seen
    }

    #[test]
    fn nested_freeze_recomputes_once() {
        let mut doc = doc();
        let before = doc.closure_version();
        doc.push_freeze();
        doc.push_freeze();
        doc.pop_freeze();
        assert_eq!(doc.closure_version(), before);
        doc.pop_freeze();
        assert_eq!(doc.closure_version(), before + 1);
    }

    #[test]
    fn clear_recomputes_once() {
        let mut doc = doc();
        let a = doc.create_model("Node", []).unwrap();
        let b = doc.create_model("Node", []).unwrap();
        doc.add_root(&a).unwrap();
        doc.add_root(&b).unwrap();
        let before = doc.closure_version();
        doc.clear();
        assert_eq!(doc.closure_version(), before + 1);
        assert!(doc.all_models().is_empty());
        assert!(doc.model(&a).unwrap().document().is_none());
    }

    #[test]
    fn add_root_is_idempotent_and_emits_once() {
        let mut doc = doc();
        let seen = record(&mut doc);
        let a = doc.create_model("Node", []).unwrap();
        doc.add_root(&a).unwrap();
        doc.add_root(&a).unwrap();
        assert_eq!(doc.roots(), &[a.clone()]);
        assert_eq!(seen.borrow().len(), 1);
        assert!(matches!(
            doc.add_root(&ModelId::from("ghost")),
            Err(DocumentError::UnknownModel(_))
        ));
    }

    #[test]
    fn setting_references_updates_closure() {
        let mut doc = doc();
        let root = doc.create_model("Node", []).unwrap();
        let child = doc.create_model("Node", []).unwrap();
        doc.add_root(&root).unwrap();
        assert!(doc.get_model_by_id(&child).is_none());

        doc.set_property(&root, "children", Value::list([child.clone()]))
            .unwrap();
        assert!(doc.get_model_by_id(&child).is_some());
        assert_eq!(doc.model(&child).unwrap().document(), Some(doc.id()));

        doc.set_property(&root, "children", Value::List(Vec::new()))
            .unwrap();
        assert!(doc.get_model_by_id(&child).is_none());
    }

    #[test]
    fn title_change_only_when_different() {
        let mut doc = doc();
        let seen = record(&mut doc);
        assert_eq!(doc.title(), DEFAULT_TITLE);
        doc.set_title(DEFAULT_TITLE);
        assert!(seen.borrow().is_empty());
        doc.set_title("Sales");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn hold_combine_merges_same_attribute() {
        let mut doc = doc();
        let seen = record(&mut doc);
        let a = doc.create_model("Node", []).unwrap();
        doc.add_root(&a).unwrap();
        seen.borrow_mut().clear();

        doc.hold(HoldPolicy::Combine);
        doc.set_property(&a, "weight", 1.0).unwrap();
        doc.set_property(&a, "weight", 2.0).unwrap();
        doc.set_title("held");
        assert!(seen.borrow().is_empty());
        doc.unhold();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        let DocumentEvent::Batch(events) = &seen[0] else {
            panic!("expected a batch");
        };
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].change,
            DocumentChange::ModelChanged { new: Value::Float(w), old: Value::Float(o), .. } if *w == 2.0 && *o == 0.0
        ));
    }

    #[test]
    fn batches_split_for_callbacks_without_batch_support() {
        let mut doc = doc();
        let singles = Rc::new(RefCell::new(0));
        let sink = singles.clone();
        doc.on_change(
            move |e| {
                assert!(matches!(e, DocumentEvent::Changed(_)));
                *sink.borrow_mut() += 1;
            },
            false,
        );
        doc.hold(HoldPolicy::Collect);
        doc.set_title("a");
        doc.set_title("b");
        doc.unhold();
        assert_eq!(*singles.borrow(), 2);
    }

    #[test]
    fn idle_fires_once_all_layout_roots_report() {
        let mut doc = doc();
        let p1 = doc.create_model(LAYOUT_DOM, []).unwrap();
        let p2 = doc.create_model(LAYOUT_DOM, []).unwrap();
        let other = doc.create_model("Node", []).unwrap();
        for r in [&p1, &p2, &other] {
            doc.add_root(r).unwrap();
        }
        let fired = Rc::new(RefCell::new(0));
        let sink = fired.clone();
        doc.on_idle(move || *sink.borrow_mut() += 1);
        let seen = record(&mut doc);

        doc.notify_idle(&p1);
        assert_eq!(*fired.borrow(), 0);
        doc.notify_idle(&p2);
        doc.notify_idle(&p2);
        assert_eq!(*fired.borrow(), 1);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0].events()[0].change,
            DocumentChange::MessageSent { msg_type, .. } if msg_type == BOKEH_EVENT
        ));
    }

    #[test]
    fn event_manager_targets_origin() {
        let mut doc = doc();
        let hits = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let sink = hits.clone();
            doc.event_manager_mut()
                .subscribe(ModelId::from(name), move |e: &ModelEvent| {
                    sink.borrow_mut().push((name, e.name.clone()))
                });
        }
        assert_eq!(doc.trigger_event(&ModelEvent::new("tap", Some(ModelId::from("b")))), 1);
        assert_eq!(doc.trigger_event(&ModelEvent::new("reset", None)), 2);
        assert_eq!(
            *hits.borrow(),
            vec![
                ("b", "tap".to_owned()),
                ("a", "reset".to_owned()),
                ("b", "reset".to_owned())
            ]
        );
    }

    #[test]
    fn version_normalization() {
        assert_eq!(pyify("3.4.0-dev.5"), "3.4.0dev5");
        assert_eq!(pyify("3.4.0-rc.1"), "3.4.0rc1");
        assert_eq!(pyify("3.4.0"), "3.4.0");
    }
}
