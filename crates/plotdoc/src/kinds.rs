//! Property kinds.
//!
//! A [`Kind`] is a runtime type descriptor used to validate property values.
//! Kinds arrive over the wire as `KindRef` JSON (a string tag for primitives,
//! an array `["Tag", ...args]` for compositions) and are translated by
//! [`kind_of`]. [`Kind::to_ref`] produces the same wire form back.
//!
//! ```json
//! ["Or", "Int", ["List", "Number"], ["Ref", {"id": "Glyph"}]]
//! ```

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde_json::{json, Value as Json};

use crate::model::ModelId;
use crate::registry::Registry;
use crate::value::{DType, Value};

/// Errors raised while decoding a `KindRef`.
#[derive(Debug, thiserror::Error)]
pub enum KindError {
    #[error("unknown kind: {0}")]
    UnknownTag(String),
    #[error("malformed kind: {0}")]
    Malformed(String),
    #[error("{0} wasn't defined before referencing it")]
    UndefinedRef(String),
    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// Answers type questions about referenced models during validation.
pub trait InstanceCheck {
    fn exists(&self, id: &ModelId) -> bool;
    fn is_instance(&self, id: &ModelId, type_name: &str) -> bool;
}

/// A compiled pattern kind. Keeps the source so it can be re-encoded.
#[derive(Debug, Clone)]
pub struct RegexKind {
    pub pattern: String,
    pub flags: Option<String>,
    regex: regex::Regex,
}

impl RegexKind {
    pub fn new(pattern: &str, flags: Option<&str>) -> Result<Self, KindError> {
        let mut inline = String::new();
        for flag in flags.unwrap_or_default().chars() {
            // g, y and u have no meaning for a whole-value match.
            if matches!(flag, 'i' | 'm' | 's') {
                inline.push(flag);
            }
        }
        let source = if inline.is_empty() {
            pattern.to_owned()
        } else {
            format!("(?{inline}){pattern}")
        };
        Ok(Self {
            pattern: pattern.to_owned(),
            flags: flags.map(str::to_owned),
            regex: regex::Regex::new(&source)?,
        })
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }
}

impl PartialEq for RegexKind {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.flags == other.flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Any,
    Unknown,
    Bool,
    Float,
    Int,
    Bytes,
    Str,
    Null,
    Regex(RegexKind),
    Nullable(Box<Kind>),
    Or(Vec<Kind>),
    Tuple(Vec<Kind>),
    List(Box<Kind>),
    Struct(IndexMap<String, Kind>),
    Dict(Box<Kind>),
    Mapping(Box<Kind>, Box<Kind>),
    Enum(IndexSet<String>),
    /// Reference to an instance of the named model type (or a subtype).
    Ref(String),
    AnyRef,
}

impl Kind {
    pub fn nullable(kind: Kind) -> Kind {
        Kind::Nullable(Box::new(kind))
    }

    pub fn list(kind: Kind) -> Kind {
        Kind::List(Box::new(kind))
    }

    pub fn dict(kind: Kind) -> Kind {
        Kind::Dict(Box::new(kind))
    }

    pub fn enumeration<I, S>(items: I) -> Kind
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Kind::Enum(items.into_iter().map(Into::into).collect())
    }

    /// Returns `true` when `value` is acceptable for this kind.
    pub fn validate(&self, value: &Value, check: &dyn InstanceCheck) -> bool {
        match self {
            Kind::Any | Kind::Unknown => true,
            Kind::Bool => matches!(value, Value::Bool(_)),
            Kind::Float => matches!(value, Value::Int(_) | Value::Float(_)),
            Kind::Int => value.as_i64().is_some(),
            Kind::Bytes => matches!(value, Value::Bytes(_)),
            Kind::Str => matches!(value, Value::Str(_)),
            Kind::Null => value.is_null(),
            Kind::Regex(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            Kind::Nullable(inner) => value.is_null() || inner.validate(value, check),
            Kind::Or(kinds) => kinds.iter().any(|k| k.validate(value, check)),
            Kind::Tuple(kinds) => match value {
                Value::List(items) => {
                    items.len() == kinds.len()
                        && items.iter().zip(kinds).all(|(v, k)| k.validate(v, check))
                }
                _ => false,
            },
            Kind::List(item) => match value {
                Value::List(items) => items.iter().all(|v| item.validate(v, check)),
                Value::TypedArray(arr) => item.accepts_packed(arr.dtype()),
                Value::NdArray(nd) => item.accepts_packed(nd.array.dtype()),
                _ => false,
            },
            Kind::Struct(fields) => match value {
                Value::Dict(map) => {
                    map.len() == fields.len()
                        && fields.iter().all(|(name, kind)| {
                            map.get(name).is_some_and(|v| kind.validate(v, check))
                        })
                }
                _ => false,
            },
            Kind::Dict(item) => match value {
                Value::Dict(map) => map.values().all(|v| item.validate(v, check)),
                _ => false,
            },
            Kind::Mapping(key, item) => match value {
                Value::Dict(map) => map.iter().all(|(k, v)| {
                    key.validate(&Value::Str(k.clone()), check) && item.validate(v, check)
                }),
                Value::Map(entries) => entries
                    .iter()
                    .all(|(k, v)| key.validate(k, check) && item.validate(v, check)),
                _ => false,
            },
            Kind::Enum(items) => value.as_str().is_some_and(|s| items.contains(s)),
            Kind::Ref(type_name) => match value {
                Value::Ref(id) => check.is_instance(id, type_name),
                _ => false,
            },
            Kind::AnyRef => match value {
                Value::Ref(id) => check.exists(id),
                _ => false,
            },
        }
    }

    fn accepts_packed(&self, dtype: DType) -> bool {
        match self {
            Kind::Any | Kind::Unknown | Kind::Float => true,
            Kind::Int => !dtype.is_float() && dtype != DType::Bool,
            Kind::Bool => dtype == DType::Bool,
            Kind::Nullable(inner) => inner.accepts_packed(dtype),
            Kind::Or(kinds) => kinds.iter().any(|k| k.accepts_packed(dtype)),
            _ => false,
        }
    }

    /// Encodes this kind as its `KindRef` wire form.
    pub fn to_ref(&self) -> Json {
        match self {
            Kind::Any => json!("Any"),
            Kind::Unknown => json!("Unknown"),
            Kind::Bool => json!("Boolean"),
            Kind::Float => json!("Number"),
            Kind::Int => json!("Int"),
            Kind::Bytes => json!("Bytes"),
            Kind::Str => json!("String"),
            Kind::Null => json!("Null"),
            Kind::Regex(re) => match &re.flags {
                Some(flags) => json!(["Regex", re.pattern, flags]),
                None => json!(["Regex", re.pattern]),
            },
            Kind::Nullable(inner) => json!(["Nullable", inner.to_ref()]),
            Kind::Or(kinds) => tagged("Or", kinds.iter().map(Kind::to_ref)),
            Kind::Tuple(kinds) => tagged("Tuple", kinds.iter().map(Kind::to_ref)),
            Kind::List(item) => json!(["List", item.to_ref()]),
            Kind::Struct(fields) => tagged(
                "Struct",
                fields.iter().map(|(name, kind)| json!([name, kind.to_ref()])),
            ),
            Kind::Dict(item) => json!(["Dict", item.to_ref()]),
            Kind::Mapping(key, item) => json!(["Mapping", key.to_ref(), item.to_ref()]),
            Kind::Enum(items) => tagged("Enum", items.iter().map(|s| json!(s))),
            Kind::Ref(type_name) => json!(["Ref", { "id": type_name }]),
            Kind::AnyRef => json!(["AnyRef"]),
        }
    }
}

fn tagged(tag: &str, args: impl Iterator<Item = Json>) -> Json {
    let mut out = vec![json!(tag)];
    out.extend(args);
    Json::Array(out)
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, kinds: &[Kind]) -> fmt::Result {
            for (i, k) in kinds.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}")?;
            }
            Ok(())
        }
        match self {
            Kind::Any => write!(f, "Any"),
            Kind::Unknown => write!(f, "Unknown"),
            Kind::Bool => write!(f, "Bool"),
            Kind::Float => write!(f, "Float"),
            Kind::Int => write!(f, "Int"),
            Kind::Bytes => write!(f, "Bytes"),
            Kind::Str => write!(f, "Str"),
            Kind::Null => write!(f, "Null"),
            Kind::Regex(re) => write!(f, "Regex(/{}/)", re.pattern),
            Kind::Nullable(inner) => write!(f, "Nullable({inner})"),
            Kind::Or(kinds) => {
                write!(f, "Or(")?;
                join(f, kinds)?;
                write!(f, ")")
            }
            Kind::Tuple(kinds) => {
                write!(f, "Tuple(")?;
                join(f, kinds)?;
                write!(f, ")")
            }
            Kind::List(item) => write!(f, "List({item})"),
            Kind::Struct(fields) => {
                write!(f, "Struct(")?;
                for (i, (name, kind)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {kind}")?;
                }
                write!(f, ")")
            }
            Kind::Dict(item) => write!(f, "Dict({item})"),
            Kind::Mapping(key, item) => write!(f, "Mapping({key}, {item})"),
            Kind::Enum(items) => {
                write!(f, "Enum(")?;
                for (i, s) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{s:?}")?;
                }
                write!(f, ")")
            }
            Kind::Ref(type_name) => write!(f, "Ref({type_name})"),
            Kind::AnyRef => write!(f, "AnyRef"),
        }
    }
}

// ── KindRef decoding ────────────────────────────────────────────────────────

/// Translates a `KindRef` into a [`Kind`].
///
/// `Ref` kinds must name a type already present in `registry`; there is no
/// deferred resolution.
pub fn kind_of(kind_ref: &Json, registry: &Registry) -> Result<Kind, KindError> {
    match kind_ref {
        Json::String(tag) => primitive(tag),
        Json::Array(items) => {
            let (tag, args) = match items.split_first() {
                Some((Json::String(tag), args)) => (tag.as_str(), args),
                _ => return Err(KindError::Malformed(kind_ref.to_string())),
            };
            composite(tag, args, kind_ref, registry)
        }
        other => Err(KindError::Malformed(other.to_string())),
    }
}

fn primitive(tag: &str) -> Result<Kind, KindError> {
    Ok(match tag {
        "Any" => Kind::Any,
        "Unknown" => Kind::Unknown,
        "Boolean" | "Bool" => Kind::Bool,
        "Number" | "Float" => Kind::Float,
        "Int" => Kind::Int,
        "Bytes" => Kind::Bytes,
        "String" | "Str" => Kind::Str,
        "Null" => Kind::Null,
        "AnyRef" => Kind::AnyRef,
        other => return Err(KindError::UnknownTag(other.to_owned())),
    })
}

fn composite(
    tag: &str,
    args: &[Json],
    whole: &Json,
    registry: &Registry,
) -> Result<Kind, KindError> {
    let malformed = || KindError::Malformed(whole.to_string());
    let one = |args: &[Json]| -> Result<Kind, KindError> {
        match args {
            [inner] => kind_of(inner, registry),
            _ => Err(malformed()),
        }
    };
    let many = |args: &[Json]| -> Result<Vec<Kind>, KindError> {
        if args.is_empty() {
            return Err(malformed());
        }
        args.iter().map(|k| kind_of(k, registry)).collect()
    };

    match tag {
        "Regex" => match args {
            [Json::String(pattern)] => Ok(Kind::Regex(RegexKind::new(pattern, None)?)),
            [Json::String(pattern), Json::String(flags)] => {
                Ok(Kind::Regex(RegexKind::new(pattern, Some(flags))?))
            }
            _ => Err(malformed()),
        },
        "Nullable" => Ok(Kind::Nullable(Box::new(one(args)?))),
        "Or" => Ok(Kind::Or(many(args)?)),
        "Tuple" => Ok(Kind::Tuple(many(args)?)),
        "List" => Ok(Kind::List(Box::new(one(args)?))),
        "Dict" => Ok(Kind::Dict(Box::new(one(args)?))),
        "Mapping" => match args {
            [key, item] => Ok(Kind::Mapping(
                Box::new(kind_of(key, registry)?),
                Box::new(kind_of(item, registry)?),
            )),
            _ => Err(malformed()),
        },
        "Struct" => {
            let mut fields = IndexMap::new();
            for entry in args {
                match entry.as_array().map(Vec::as_slice) {
                    Some([Json::String(name), kind]) => {
                        fields.insert(name.clone(), kind_of(kind, registry)?);
                    }
                    _ => return Err(malformed()),
                }
            }
            Ok(Kind::Struct(fields))
        }
        "Enum" => {
            let mut items = IndexSet::new();
            for item in args {
                items.insert(item.as_str().ok_or_else(malformed)?.to_owned());
            }
            Ok(Kind::Enum(items))
        }
        "Ref" => {
            let id = match args {
                [reference] => reference
                    .get("id")
                    .and_then(Json::as_str)
                    .ok_or_else(malformed)?,
                _ => return Err(malformed()),
            };
            if registry.contains(id) {
                Ok(Kind::Ref(id.to_owned()))
            } else {
                Err(KindError::UndefinedRef(id.to_owned()))
            }
        }
        "AnyRef" if args.is_empty() => Ok(Kind::AnyRef),
        other => Err(KindError::UnknownTag(other.to_owned())),
    }
}
