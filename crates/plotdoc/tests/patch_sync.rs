//! Patch exchange between two documents holding the same scene graph.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use plotdoc::events::BOKEH_EVENT;
use plotdoc::{
    Buffers, DeserializationError, Document, DocumentError, ModelEvent, ModelId, Patch,
    TypedArray, Value,
};
use serde_json::json;

struct Pair {
    sender: Document,
    receiver: Document,
    root: ModelId,
    source: ModelId,
}

/// A sender and a receiver in sync, with a node root and a data source root.
fn synced_pair() -> Pair {
    let mut sender = common::document();
    let leaf = common::node(&mut sender, &[]);
    let root = common::node(&mut sender, &[leaf]);
    let source = common::data_source(
        &mut sender,
        vec![("a", Value::list([1, 2])), ("b", Value::list([3, 4]))],
    );
    sender.add_root(&root).unwrap();
    sender.add_root(&source).unwrap();

    let json = sender.to_json(true).unwrap();
    let receiver = Document::from_json_with(&json, common::registry()).unwrap();
    // The receiver now knows every model.
    sender.create_json_patch(&[]).unwrap();
    Pair {
        sender,
        receiver,
        root,
        source,
    }
}

impl Pair {
    /// Ships everything `f` does on the sender over to the receiver.
    fn sync(&mut self, f: impl FnOnce(&mut Document)) -> Patch {
        let changes = common::record_changes(&mut self.sender);
        f(&mut self.sender);
        let events = changes.borrow().clone();
        let patch = self.sender.create_json_patch(&events).unwrap();
        self.receiver
            .apply_json_patch(&patch.content, &patch.buffer_map())
            .unwrap();
        patch.content
    }

    fn assert_in_sync(&self) {
        let sent = self.sender.to_json(true).unwrap();
        let received = self.receiver.to_json(true).unwrap();
        assert_eq!(sent.title, received.title);
        assert_eq!(sent.roots, received.roots);
        assert_eq!(self.sender.all_models(), self.receiver.all_models());
    }
}

fn raw(doc: &mut Document, events: Vec<serde_json::Value>) -> Result<(), DocumentError> {
    doc.apply_json_patch(&Patch { events }, &Buffers::new())
}

fn kinds(patch: &Patch) -> Vec<&str> {
    patch
        .events
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect()
}

// ── Model changes ───────────────────────────────────────────────────────────

#[test]
fn property_edits_reach_the_receiver() {
    let mut pair = synced_pair();
    let root = pair.root.clone();
    let patch = pair.sync(|doc| {
        doc.set_property(&root, "weight", 2.5).unwrap();
        doc.set_property(&root, "name", "main").unwrap();
    });
    assert_eq!(kinds(&patch), ["ModelChanged", "ModelChanged"]);
    assert_eq!(
        pair.receiver.model(&root).unwrap().get("weight"),
        Some(&Value::Float(2.5))
    );
    pair.assert_in_sync();
}

#[test]
fn new_models_are_embedded_once_then_referenced() {
    let mut pair = synced_pair();
    let root = pair.root.clone();
    let mut fresh = None;
    let patch = pair.sync(|doc| {
        let child = common::node(doc, &[]);
        doc.set_property(&root, "children", Value::list([child.clone()]))
            .unwrap();
        doc.set_property(&child, "weight", 4.0).unwrap();
        fresh = Some(child);
    });
    let fresh = fresh.unwrap();

    let embedded = &patch.events[0]["new"][0];
    assert_eq!(embedded["type"], json!("object"));
    assert_eq!(embedded["id"], json!(fresh.as_str()));
    assert_eq!(patch.events[1]["model"], json!({ "id": fresh.as_str() }));
    assert!(pair.sender.new_models().is_empty());

    let received = pair.receiver.get_model_by_id(&fresh).unwrap();
    assert_eq!(received.get("weight"), Some(&Value::Float(4.0)));
    assert_eq!(received.document(), Some(pair.receiver.id()));
    pair.assert_in_sync();
}

#[test]
fn title_only_patch_touches_only_the_title() {
    let mut pair = synced_pair();
    let before = pair.receiver.to_json(true).unwrap();
    let patch = pair.sync(|doc| doc.set_title("Renamed"));

    assert_eq!(kinds(&patch), ["TitleChanged"]);
    assert_eq!(pair.receiver.title(), "Renamed");
    let after = pair.receiver.to_json(true).unwrap();
    assert_eq!(after.roots, before.roots);
}

#[test]
fn roots_are_added_and_removed() {
    let mut pair = synced_pair();
    let root = pair.root.clone();
    let mut added = None;
    pair.sync(|doc| {
        let extra = common::node(doc, &[]);
        doc.add_root(&extra).unwrap();
        doc.remove_root(&root);
        added = Some(extra);
    });
    let added = added.unwrap();
    assert!(pair.receiver.roots().contains(&added));
    assert!(!pair.receiver.roots().contains(&root));
    assert!(pair.receiver.get_model_by_id(&root).is_none());
    pair.assert_in_sync();
}

#[test]
fn applying_a_patch_emits_no_change_events() {
    let mut pair = synced_pair();
    let seen = common::record_changes(&mut pair.receiver);
    let root = pair.root.clone();
    pair.sync(|doc| doc.set_property(&root, "weight", 9.0).unwrap());
    assert!(seen.borrow().is_empty());
}

// ── Columnar data ───────────────────────────────────────────────────────────

#[test]
fn sparse_column_replace_keeps_other_columns() {
    let mut pair = synced_pair();
    let source = pair.source.clone();
    raw(
        &mut pair.receiver,
        vec![json!({
            "kind": "ColumnDataChanged",
            "model": { "id": source.as_str() },
            "attr": "data",
            "data": { "type": "map", "entries": [["a", [9, 9]]] },
            "cols": ["a"],
        })],
    )
    .unwrap();
    assert_eq!(common::column(&pair.receiver, &source, "a"), Value::list([9, 9]));
    assert_eq!(common::column(&pair.receiver, &source, "b"), Value::list([3, 4]));
}

#[test]
fn set_columns_sends_only_the_listed_columns() {
    let mut pair = synced_pair();
    let source = pair.source.clone();
    let patch = pair.sync(|doc| {
        let data = IndexMap::from([("a".to_owned(), Value::list([7, 8]))]);
        doc.set_columns(&source, data, Some(vec!["a".to_owned()]))
            .unwrap();
    });
    assert_eq!(kinds(&patch), ["ColumnDataChanged"]);
    let entries = patch.events[0]["data"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(common::column(&pair.receiver, &source, "a"), Value::list([7, 8]));
    assert_eq!(common::column(&pair.receiver, &source, "b"), Value::list([3, 4]));
}

#[test]
fn streamed_rows_travel_as_a_stream() {
    let mut pair = synced_pair();
    let source = pair.source.clone();
    let patch = pair.sync(|doc| {
        let rows = IndexMap::from([
            ("a".to_owned(), Value::list([5])),
            ("b".to_owned(), Value::list([6])),
        ]);
        doc.stream(&source, rows, Some(2)).unwrap();
    });
    assert_eq!(kinds(&patch), ["ColumnsStreamed"]);
    assert_eq!(patch.events[0]["rollover"], json!(2));
    assert_eq!(common::column(&pair.receiver, &source, "a"), Value::list([2, 5]));
    assert_eq!(common::column(&pair.receiver, &source, "b"), Value::list([4, 6]));
    pair.assert_in_sync();
}

#[test]
fn cell_patches_travel_as_patches() {
    let mut pair = synced_pair();
    let source = pair.source.clone();
    let patch = pair.sync(|doc| {
        let patches = IndexMap::from([("b".to_owned(), vec![(Value::Int(1), Value::Int(40))])]);
        doc.patch_columns(&source, patches).unwrap();
    });
    assert_eq!(kinds(&patch), ["ColumnsPatched"]);
    assert_eq!(common::column(&pair.receiver, &source, "b"), Value::list([3, 40]));
    pair.assert_in_sync();
}

#[test]
fn typed_columns_use_binary_buffers() {
    let mut pair = synced_pair();
    let source = pair.source.clone();
    let column = TypedArray::from_f64s(&[0.5, 1.5]);
    let changes = common::record_changes(&mut pair.sender);
    let data = IndexMap::from([("a".to_owned(), Value::from(column.clone()))]);
    pair.sender
        .set_columns(&source, data, Some(vec!["a".to_owned()]))
        .unwrap();
    let events = changes.borrow().clone();
    let patch = pair.sender.create_json_patch(&events).unwrap();
    assert_eq!(patch.buffers.len(), 1);

    pair.receiver
        .apply_json_patch(&patch.content, &patch.buffer_map())
        .unwrap();
    assert_eq!(common::column(&pair.receiver, &source, "a"), Value::TypedArray(column));

    // Without the buffer the patch can't be decoded.
    assert!(matches!(
        pair.receiver.apply_json_patch(&patch.content, &Buffers::new()),
        Err(DocumentError::Deserialization(DeserializationError::UnknownBuffer(_)))
    ));
}

// ── Messages ────────────────────────────────────────────────────────────────

#[test]
fn messages_are_dispatched_by_type() {
    let mut pair = synced_pair();
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    pair.receiver
        .on_message(BOKEH_EVENT, move |data| sink.borrow_mut().push(data.clone()));

    let root = pair.root.clone();
    pair.sync(|doc| {
        doc.send_event(&ModelEvent::new("tap", Some(root)).with_value("x", 3));
    });

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    let message = received[0].as_dict().unwrap();
    assert_eq!(message["name"], Value::from("tap"));
    let values = message["values"].as_dict().unwrap();
    assert_eq!(values["x"], Value::Int(3));
    assert_eq!(values["model"], Value::Ref(pair.root.clone()));
}

#[test]
fn message_without_data_takes_the_single_buffer() {
    let mut doc = common::document();
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    doc.on_message("blob", move |data| sink.borrow_mut().push(data.clone()));

    let patch = Patch {
        events: vec![json!({ "kind": "MessageSent", "msg_type": "blob" })],
    };
    let buffers = Buffers::from([("buf1".to_owned(), vec![1u8, 2, 3])]);
    doc.apply_json_patch(&patch, &buffers).unwrap();
    assert_eq!(*received.borrow(), vec![Value::Bytes(vec![1, 2, 3])]);

    assert!(matches!(
        doc.apply_json_patch(&patch, &Buffers::new()),
        Err(DocumentError::ExpectedOneBuffer(0))
    ));
}

// ── Rejections ──────────────────────────────────────────────────────────────

#[test]
fn unknown_event_kind_is_rejected() {
    let mut doc = common::document();
    let err = raw(&mut doc, vec![json!({ "kind": "Bogus" })]).unwrap_err();
    assert!(matches!(err, DocumentError::UnknownPatchEvent(kind) if kind == "Bogus"));
}

#[test]
fn events_from_another_document_are_rejected() {
    let mut pair = synced_pair();
    let mut other = common::document();
    let changes = common::record_changes(&mut other);
    other.set_title("elsewhere");
    let events = changes.borrow().clone();
    assert!(matches!(
        pair.sender.create_json_patch(&events),
        Err(DocumentError::ForeignEvent { .. })
    ));
}

#[test]
fn detached_targets_are_rejected() {
    let mut doc = common::document();
    let loose = common::node(&mut doc, &[]);
    let err = raw(
        &mut doc,
        vec![json!({
            "kind": "ModelChanged",
            "model": { "id": loose.as_str() },
            "attr": "weight",
            "new": 2.0,
        })],
    )
    .unwrap_err();
    assert!(matches!(err, DocumentError::UnknownModel(id) if id == loose));
}

#[test]
fn unknown_references_are_rejected() {
    let mut doc = common::document();
    let err = raw(
        &mut doc,
        vec![json!({
            "kind": "RootAdded",
            "model": { "id": "nowhere" },
        })],
    )
    .unwrap_err();
    assert!(matches!(
        err,
        DocumentError::Deserialization(DeserializationError::UnresolvedReference(_))
    ));
}
