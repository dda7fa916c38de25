//! Whole-document JSON: round trips, runtime type definitions, replacement
//! and moves between documents.

mod common;

use plotdoc::{
    DeserializationError, DocJson, Document, DocumentBuilder, DocumentError, ModelId, Registry,
    TypedArray, Value,
};
use serde_json::json;

fn populated() -> (Document, ModelId) {
    let mut doc = common::document();
    let leaf = common::node(&mut doc, &[]);
    doc.set_property(&leaf, "weight", 1.5).unwrap();
    doc.set_property(
        &leaf,
        "payload",
        Value::dict([("k", Value::list([1, 2])), ("nan", Value::Float(f64::NAN))]),
    )
    .unwrap();
    let source = common::data_source(
        &mut doc,
        vec![
            ("x", Value::from(TypedArray::from_f64s(&[1.0, 2.5]))),
            ("label", Value::list(["a", "b"])),
        ],
    );
    let plot = doc
        .create_model(
            "Plot",
            [
                ("renderers", Value::list([leaf.clone()])),
                ("source", Value::from(source)),
                ("width", Value::from(400)),
            ],
        )
        .unwrap();
    doc.add_root(&plot).unwrap();
    doc.set_title("Sales");
    (doc, plot)
}

fn assert_same_models(a: &Document, b: &Document) {
    assert_eq!(a.all_models(), b.all_models());
    for id in a.all_models() {
        let left = a.model(id).unwrap();
        let right = b.model(id).unwrap();
        assert_eq!(left.type_name(), right.type_name(), "type of {id}");
        for (attr, value) in left.properties() {
            // NaN never compares equal; payloads are checked separately.
            if attr != "payload" {
                assert_eq!(Some(value), right.get(attr), "{id}.{attr}");
            }
        }
    }
}

// ── Round trips ─────────────────────────────────────────────────────────────

#[test]
fn json_round_trip_preserves_structure_and_title() {
    let (doc, plot) = populated();
    let json = doc.to_json(true).unwrap();
    assert_eq!(json.title.as_deref(), Some("Sales"));
    assert_eq!(json.version.as_deref(), Some(plotdoc::VERSION));

    let copy = Document::from_json(&json).unwrap();
    assert_eq!(copy.title(), "Sales");
    assert_eq!(copy.roots(), &[plot.clone()][..]);
    assert_ne!(copy.id(), doc.id());
    assert_same_models(&doc, &copy);

    let payload = copy
        .model(&copy.roots()[0])
        .and_then(|m| m.get("renderers"))
        .and_then(Value::as_list)
        .and_then(|r| r[0].as_ref_id())
        .and_then(|leaf| copy.model(leaf))
        .and_then(|m| m.get("payload"))
        .and_then(Value::as_dict)
        .cloned()
        .unwrap();
    assert_eq!(payload["k"], Value::list([1, 2]));
    assert!(payload["nan"].as_f64().unwrap().is_nan());
}

#[test]
fn json_string_round_trip() {
    let (doc, _) = populated();
    let text = doc.to_json_string(true).unwrap();
    let copy = Document::from_json_string(&text).unwrap();
    assert_same_models(&doc, &copy);
    let again = copy.to_json(true).unwrap();
    let original = doc.to_json(true).unwrap();
    assert_eq!(again.title, original.title);
    assert_eq!(again.roots, original.roots);
}

#[test]
fn defaults_are_omitted_on_request() {
    let mut doc = common::document();
    let n = common::node(&mut doc, &[]);
    doc.add_root(&n).unwrap();

    let full = doc.to_json(true).unwrap();
    let sparse = doc.to_json(false).unwrap();
    assert!(full.roots[0]["attributes"].get("weight").is_some());
    assert!(sparse.roots[0].get("attributes").is_none());

    let copy = Document::from_json(&sparse).unwrap();
    assert_eq!(copy.model(&n).unwrap().get("weight"), Some(&Value::Float(0.0)));
}

#[test]
fn shared_models_are_serialized_once() {
    let mut doc = common::document();
    let shared = common::node(&mut doc, &[]);
    let a = common::node(&mut doc, &[shared.clone()]);
    let b = common::node(&mut doc, &[shared.clone()]);
    doc.add_root(&a).unwrap();
    doc.add_root(&b).unwrap();

    let json = doc.to_json(false).unwrap();
    assert_eq!(json.roots[0]["attributes"]["children"][0]["type"], json!("object"));
    assert_eq!(json.roots[1]["attributes"]["children"][0], json!({ "id": shared.as_str() }));

    let copy = Document::from_json(&json).unwrap();
    assert_eq!(copy.all_models().len(), 3);
}

#[test]
fn root_must_be_a_model() {
    let json = DocJson {
        version: Some(plotdoc::VERSION.to_owned()),
        title: None,
        defs: None,
        roots: vec![json!(42)],
    };
    assert!(matches!(
        Document::from_json(&json),
        Err(DocumentError::Deserialization(DeserializationError::Malformed(_)))
    ));
}

#[test]
fn missing_title_keeps_the_default() {
    let json: DocJson = serde_json::from_value(json!({ "roots": [] })).unwrap();
    let doc = Document::from_json(&json).unwrap();
    assert_eq!(doc.title(), plotdoc::document::DEFAULT_TITLE);
    assert!(doc.roots().is_empty());
}

// ── Runtime type definitions ────────────────────────────────────────────────

#[test]
fn user_types_travel_as_defs() {
    let (doc, _) = populated();
    let json = doc.to_json(true).unwrap();
    let names: Vec<&str> = json
        .defs
        .iter()
        .flatten()
        .map(|def| def.name.as_str())
        .collect();
    assert_eq!(names, ["Node", "Plot"]);

    // A bare registry learns the types from the defs.
    let copy = Document::from_json_with(&json, Registry::with_builtins()).unwrap();
    assert!(copy.registry().is_subtype("Plot", plotdoc::registry::LAYOUT_DOM));
    assert!(copy.is_instance(&copy.roots()[0], "Plot"));
}

#[test]
fn def_before_its_base_is_rejected() {
    let json: DocJson = serde_json::from_value(json!({
        "version": plotdoc::VERSION,
        "defs": [
            { "type": "model", "name": "Child", "extends": { "id": "Parent" } },
            { "type": "model", "name": "Parent" },
        ],
        "roots": [],
    }))
    .unwrap();
    match Document::from_json(&json) {
        Err(DocumentError::Deserialization(DeserializationError::UndefinedBase { base, name })) => {
            assert_eq!(base, "Parent");
            assert_eq!(name, "Child");
        }
        other => panic!("expected an undefined base error, got {other:?}"),
    }
}

#[test]
fn defs_in_order_register_a_hierarchy() {
    let json: DocJson = serde_json::from_value(json!({
        "version": plotdoc::VERSION,
        "defs": [
            {
                "type": "model",
                "name": "Parent",
                "properties": [
                    { "name": "size", "kind": "Int", "default": 3 },
                ],
            },
            {
                "type": "model",
                "name": "Child",
                "extends": { "id": "Parent" },
                "overrides": [{ "name": "size", "default": 7 }],
            },
        ],
        "roots": [
            { "type": "object", "name": "Child", "id": "c1" },
        ],
    }))
    .unwrap();
    let doc = Document::from_json(&json).unwrap();
    assert!(doc.registry().is_subtype("Child", "Parent"));
    let child = doc.model(&ModelId::new("c1")).unwrap();
    assert_eq!(child.get("size"), Some(&Value::Int(7)));
}

#[test]
fn property_without_default_stays_unset_through_round_trips() {
    let json: DocJson = serde_json::from_value(json!({
        "version": plotdoc::VERSION,
        "defs": [
            {
                "type": "model",
                "name": "Gauge",
                "properties": [{ "name": "level", "kind": "Number" }],
            },
        ],
        "roots": [{ "type": "object", "name": "Gauge", "id": "g1" }],
    }))
    .unwrap();
    let gauge = ModelId::new("g1");
    let mut doc = Document::from_json(&json).unwrap();
    assert_eq!(doc.model(&gauge).unwrap().get("level"), None);

    let full = doc.to_json(true).unwrap();
    assert!(full.roots[0]
        .get("attributes")
        .and_then(|a| a.get("level"))
        .is_none());
    assert!(full.defs.as_ref().unwrap()[0].properties[0].default.is_none());
    let copy = Document::from_json(&full).unwrap();
    assert_eq!(copy.model(&gauge).unwrap().get("level"), None);

    doc.set_property(&gauge, "level", 0.25).unwrap();
    let copy = Document::from_json(&doc.to_json(false).unwrap()).unwrap();
    assert_eq!(
        copy.model(&gauge).unwrap().get("level"),
        Some(&Value::Float(0.25))
    );
}

// ── Replace and move ────────────────────────────────────────────────────────

#[test]
fn replace_with_json_swaps_content_and_keeps_identity() {
    let (source, plot) = populated();
    let json = source.to_json(true).unwrap();

    let mut doc = common::document();
    let stale = common::node(&mut doc, &[]);
    doc.add_root(&stale).unwrap();
    let id = doc.id();

    doc.replace_with_json(&json).unwrap();
    assert_eq!(doc.id(), id);
    assert_eq!(doc.roots(), &[plot.clone()][..]);
    assert_eq!(doc.title(), "Sales");
    assert!(doc.model(&stale).is_none());
    for model in doc.all_models() {
        assert_eq!(doc.model(model).unwrap().document(), Some(id));
    }
}

#[test]
fn destructively_move_transfers_roots_and_title() {
    let (mut source, plot) = populated();
    let moved = source.all_models().clone();

    let mut dest = common::document();
    let old = common::node(&mut dest, &[]);
    dest.add_root(&old).unwrap();

    source.destructively_move(&mut dest).unwrap();

    assert!(source.roots().is_empty());
    assert!(source.all_models().is_empty());
    assert_eq!(dest.roots(), &[plot][..]);
    assert_eq!(dest.title(), "Sales");
    assert_eq!(dest.all_models(), &moved);
    assert!(dest.model(&old).is_none());
    for id in &moved {
        assert_eq!(dest.model(id).unwrap().document(), Some(dest.id()));
        assert!(source.model(id).is_none());
    }
}

#[test]
fn moving_into_itself_fails_and_changes_nothing() {
    let (mut doc, plot) = populated();
    let before = doc.all_models().clone();
    let mut same = DocumentBuilder::new()
        .registry(common::registry())
        .id(doc.id())
        .build();

    assert!(matches!(
        doc.destructively_move(&mut same),
        Err(DocumentError::MoveIntoSelf)
    ));
    assert_eq!(doc.roots(), &[plot][..]);
    assert_eq!(doc.all_models(), &before);
    assert_eq!(doc.title(), "Sales");
}
