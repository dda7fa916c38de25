//! Runtime model type definitions.
//!
//! A `ModelDef` describes a new model type on the wire: its name, the type it
//! extends, the properties it declares and the inherited defaults it
//! overrides. Decoding one registers a [`TypeDescriptor`] so that instances
//! of the new type can follow it in the same document.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::kinds::{kind_of, Kind};
use crate::model::{PropertyError, TypeView};
use crate::registry::{TypeDescriptor, MODEL};
use crate::serialization::{DeserializationError, Deserializer, JsonMap, SerializationError, Serializer};
use crate::value::Value;

/// Representation tag of a model definition.
pub const MODEL_DEF_TAG: &str = "model";

/// `{"id": name}` pointer to a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "model")]
pub struct ModelDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverrideDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    /// A `KindRef`.
    pub kind: Json,
    /// Absent when the property has no default. An explicit `null` is a
    /// null default.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Json>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Json>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Json::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideDef {
    pub name: String,
    pub default: Json,
}

/// Decoder for the `"model"` representation tag.
///
/// Registers the described type and yields its name. A type that is already
/// registered is left untouched.
pub fn decode_def(obj: &JsonMap, de: &mut Deserializer<'_>) -> Result<Value, DeserializationError> {
    let def: ModelDef = serde_json::from_value(Json::Object(obj.clone()))
        .map_err(|err| DeserializationError::Malformed(format!("invalid model definition: {err}")))?;

    if de.registry().contains(&def.name) {
        tracing::debug!(type_name = %def.name, "model definition already registered");
        return Ok(Value::Str(def.name));
    }

    let base = match &def.extends {
        None => MODEL,
        Some(TypeRef { id }) if id == MODEL => MODEL,
        Some(TypeRef { id }) => {
            if !de.registry().contains(id) {
                return Err(DeserializationError::UndefinedBase {
                    base: id.clone(),
                    name: def.name,
                });
            }
            id.as_str()
        }
    };
    let mut desc = TypeDescriptor::new(def.name.clone()).extends(base);

    for prop in &def.properties {
        let kind = kind_of(&prop.kind, de.registry())?;
        desc = match &prop.default {
            Some(rep) => {
                let default = de.decode(rep)?;
                check_default(de, &def.name, &prop.name, &kind, &default)?;
                desc.property(prop.name.clone(), kind, default)
            }
            None => desc.unset_property(prop.name.clone(), kind),
        };
    }

    for over in &def.overrides {
        let Some(kind) = de.registry().property(base, &over.name).map(|p| p.kind.clone()) else {
            return Err(PropertyError::UnknownProperty {
                type_name: base.to_owned(),
                attr: over.name.clone(),
            }
            .into());
        };
        let default = de.decode(&over.default)?;
        check_default(de, &def.name, &over.name, &kind, &default)?;
        desc = desc.override_default(over.name.clone(), default);
    }

    de.registry_mut().register(desc)?;
    Ok(Value::Str(def.name))
}

fn check_default(
    de: &Deserializer<'_>,
    type_name: &str,
    attr: &str,
    kind: &Kind,
    default: &Value,
) -> Result<(), PropertyError> {
    let check = TypeView {
        store: de.store(),
        registry: de.registry(),
    };
    if kind.validate(default, &check) {
        Ok(())
    } else {
        Err(PropertyError::InvalidValue {
            type_name: type_name.to_owned(),
            attr: attr.to_owned(),
            expected: kind.to_string(),
            got: default.type_name(),
        })
    }
}

/// Describes a registered type as a [`ModelDef`]. Defaults go through `ser`.
pub fn encode_def(desc: &TypeDescriptor, ser: &mut Serializer<'_>) -> Result<ModelDef, SerializationError> {
    let extends = desc
        .base
        .as_ref()
        .filter(|base| base.as_str() != MODEL)
        .map(|base| TypeRef { id: base.clone() });

    let mut properties = Vec::with_capacity(desc.properties.len());
    for prop in desc.properties.values() {
        let default = match &prop.default {
            Some(value) => Some(ser.encode(value)?),
            None => None,
        };
        properties.push(PropertyDef {
            name: prop.name.clone(),
            kind: prop.kind.to_ref(),
            default,
        });
    }

    let mut overrides = Vec::with_capacity(desc.overrides.len());
    for (name, default) in &desc.overrides {
        overrides.push(OverrideDef {
            name: name.clone(),
            default: ser.encode(default)?,
        });
    }

    Ok(ModelDef {
        name: desc.name.clone(),
        extends,
        properties,
        overrides,
    })
}
