//! Model type registry.
//!
//! Maps a qualified type name to a [`TypeDescriptor`]: the base type, the
//! declared properties with their kinds and defaults, and overridden defaults
//! of inherited properties. Instances are generic property bags tagged with
//! the descriptor name, so "subclassing" is just a base-name chain walked by
//! [`Registry::lineage`].
//!
//! A registry is an explicit value owned by a [`Document`](crate::Document);
//! nothing here is process-global.

use indexmap::IndexMap;

use crate::kinds::Kind;
use crate::value::Value;

/// Name of the universal base type.
pub const MODEL: &str = "Model";
/// Base type of everything that takes part in layout.
pub const LAYOUT_DOM: &str = "LayoutDOM";
/// Columnar data source type.
pub const COLUMN_DATA_SOURCE: &str = "ColumnDataSource";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("base model {base} of {name} is not defined")]
    UnknownBase { base: String, name: String },
    #[error("model '{0}' was already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: Kind,
    /// `None` for a property that stays unset until assigned.
    pub default: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    /// `None` only for the universal base.
    pub base: Option<String>,
    pub properties: IndexMap<String, PropertyDescriptor>,
    pub overrides: IndexMap<String, Value>,
    builtin: bool,
}

impl TypeDescriptor {
    /// Starts a descriptor deriving from the universal base.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: Some(MODEL.to_owned()),
            properties: IndexMap::new(),
            overrides: IndexMap::new(),
            builtin: false,
        }
    }

    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn property(self, name: impl Into<String>, kind: Kind, default: impl Into<Value>) -> Self {
        self.declare(name.into(), kind, Some(default.into()))
    }

    /// Declares a property without a default. Instances leave it out until
    /// it is assigned.
    pub fn unset_property(self, name: impl Into<String>, kind: Kind) -> Self {
        self.declare(name.into(), kind, None)
    }

    fn declare(mut self, name: String, kind: Kind, default: Option<Value>) -> Self {
        self.properties
            .insert(name.clone(), PropertyDescriptor { name, kind, default });
        self
    }

    pub fn override_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.overrides.insert(name.into(), default.into());
        self
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    types: IndexMap<String, TypeDescriptor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Registry {
    /// A registry holding only the universal base type.
    pub fn new() -> Self {
        let mut base = TypeDescriptor::new(MODEL)
            .property("name", Kind::nullable(Kind::Str), Value::Null)
            .property("tags", Kind::list(Kind::Any), Value::List(Vec::new()))
            .builtin();
        base.base = None;
        let mut types = IndexMap::new();
        types.insert(MODEL.to_owned(), base);
        Self { types }
    }

    /// A registry with the builtin layout and data source types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins = [
            TypeDescriptor::new(LAYOUT_DOM)
                .property("visible", Kind::Bool, true)
                .property("width", Kind::nullable(Kind::Int), Value::Null)
                .property("height", Kind::nullable(Kind::Int), Value::Null)
                .builtin(),
            TypeDescriptor::new(COLUMN_DATA_SOURCE)
                .property("data", Kind::dict(Kind::Any), Value::Dict(IndexMap::new()))
                .builtin(),
        ];
        for desc in builtins {
            registry.types.insert(desc.name.clone(), desc);
        }
        registry
    }

    /// Registers a new type. The base must already be registered.
    pub fn register(&mut self, desc: TypeDescriptor) -> Result<(), RegistryError> {
        if self.types.contains_key(&desc.name) {
            return Err(RegistryError::AlreadyRegistered(desc.name));
        }
        if let Some(base) = &desc.base {
            if !self.types.contains_key(base) {
                return Err(RegistryError::UnknownBase {
                    base: base.clone(),
                    name: desc.name,
                });
            }
        }
        tracing::debug!(type_name = %desc.name, "registering model type");
        self.types.insert(desc.name.clone(), desc);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The type followed by each of its bases, ending at the universal base.
    pub fn lineage(&self, name: &str) -> Vec<&TypeDescriptor> {
        let mut out = Vec::new();
        let mut next = self.types.get(name);
        while let Some(desc) = next {
            out.push(desc);
            next = desc.base.as_deref().and_then(|b| self.types.get(b));
        }
        out
    }

    pub fn is_subtype(&self, name: &str, base: &str) -> bool {
        self.lineage(name).iter().any(|d| d.name == base)
    }

    /// Finds the declaration of `attr` for `type_name`, searching bases.
    pub fn property(&self, type_name: &str, attr: &str) -> Option<&PropertyDescriptor> {
        self.lineage(type_name)
            .into_iter()
            .find_map(|d| d.properties.get(attr))
    }

    /// Effective default of `attr`: the nearest override wins over the declaration.
    pub fn default_value(&self, type_name: &str, attr: &str) -> Option<&Value> {
        for desc in self.lineage(type_name) {
            if let Some(v) = desc.overrides.get(attr) {
                return Some(v);
            }
            if let Some(p) = desc.properties.get(attr) {
                return p.default.as_ref();
            }
        }
        None
    }

    /// Every property of `type_name` with its effective default, base properties first.
    pub fn defaults(&self, type_name: &str) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        for desc in self.lineage(type_name).into_iter().rev() {
            for name in desc.properties.keys() {
                if let Some(v) = self.default_value(type_name, name) {
                    out.insert(name.clone(), v.clone());
                }
            }
        }
        out
    }

    /// Types that were registered at runtime, in registration order.
    pub fn user_types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values().filter(|d| !d.builtin)
    }

    /// Copies over every runtime type `other` has and `self` lacks.
    pub fn merge_from(&mut self, other: &Registry) {
        for desc in other.user_types() {
            if !self.types.contains_key(&desc.name) {
                self.types.insert(desc.name.clone(), desc.clone());
            }
        }
    }
}
