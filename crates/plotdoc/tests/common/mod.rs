#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use plotdoc::registry::LAYOUT_DOM;
use plotdoc::{
    Document, DocumentBuilder, DocumentChangedEvent, DocumentEvent, Kind, LifecycleEvent, ModelId,
    Registry, TypeDescriptor, Value,
};

/// Builtins plus a generic graph node and a layoutable plot.
pub fn registry() -> Registry {
    let mut registry = Registry::with_builtins();
    registry
        .register(
            TypeDescriptor::new("Node")
                .property("children", Kind::list(Kind::AnyRef), Value::List(Vec::new()))
                .property("weight", Kind::Float, 0.0)
                .property("payload", Kind::Any, Value::Null),
        )
        .expect("register Node");
    registry
        .register(
            TypeDescriptor::new("Plot")
                .extends(LAYOUT_DOM)
                .property("renderers", Kind::list(Kind::Ref("Node".into())), Value::List(Vec::new()))
                .property("source", Kind::nullable(Kind::AnyRef), Value::Null),
        )
        .expect("register Plot");
    registry
}

pub fn document() -> Document {
    DocumentBuilder::new().registry(registry()).build()
}

pub fn node(doc: &mut Document, children: &[ModelId]) -> ModelId {
    doc.create_model(
        "Node",
        [("children", Value::list(children.iter().cloned()))],
    )
    .expect("create node")
}

pub fn named(doc: &mut Document, name: &str) -> ModelId {
    doc.create_model("Node", [("name", Value::from(name))])
        .expect("create named node")
}

/// Collects every change event, flattening batches.
pub fn record_changes(doc: &mut Document) -> Rc<RefCell<Vec<DocumentChangedEvent>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    doc.on_change(
        move |event: &DocumentEvent| sink.borrow_mut().extend(event.events().iter().cloned()),
        true,
    );
    seen
}

pub fn record_lifecycle(doc: &mut Document) -> Rc<RefCell<Vec<LifecycleEvent>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    doc.on_lifecycle(move |event| sink.borrow_mut().push(event.clone()));
    seen
}

pub fn data_source(doc: &mut Document, columns: Vec<(&str, Value)>) -> ModelId {
    doc.create_model("ColumnDataSource", [("data", Value::dict(columns))])
        .expect("create data source")
}

pub fn column(doc: &Document, source: &ModelId, name: &str) -> Value {
    doc.model(source)
        .and_then(|m| m.get("data"))
        .and_then(Value::as_dict)
        .and_then(|d| d.get(name))
        .cloned()
        .unwrap_or_default()
}
