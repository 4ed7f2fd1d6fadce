//! Component schemas and registration-time validation
//!
//! Component structs must be describable as a fixed list of primitive field
//! kinds so they can be encoded for contract consumers. Big integers need an
//! explicit `uint<N>`/`int<N>` annotation and platform-sized integers are
//! refused outright. All of this is checked when a component is registered,
//! before any world exists.

use std::collections::BTreeMap;

use thiserror::Error;

use super::ComponentTypeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Uint(u16),
    Int(u16),
    Bool,
    String,
    Bytes,
    Address,
    /// Arbitrary precision integer; needs an annotation giving its size.
    BigInt,
    UnsizedUint,
    UnsizedInt,
    Slice(Box<FieldKind>),
    Struct(Vec<Field>),
}

impl FieldKind {
    /// Parses a kind name such as `uint64`, `[]string` or `bigint`.
    ///
    /// `struct` is not accepted here; nested structs are built with
    /// [`FieldKind::Struct`] directly.
    pub fn from_name(name: &str) -> Result<Self, SchemaError> {
        if let Some(inner) = name.strip_prefix("[]") {
            return Ok(FieldKind::Slice(Box::new(Self::from_name(inner)?)));
        }
        let kind = match name {
            "bool" => FieldKind::Bool,
            "string" => FieldKind::String,
            "bytes" => FieldKind::Bytes,
            "address" => FieldKind::Address,
            "bigint" => FieldKind::BigInt,
            "uint" => FieldKind::UnsizedUint,
            "int" => FieldKind::UnsizedInt,
            other => {
                if let Some(bits) = other.strip_prefix("uint").and_then(|b| b.parse().ok()) {
                    FieldKind::Uint(bits)
                } else if let Some(bits) = other.strip_prefix("int").and_then(|b| b.parse().ok()) {
                    FieldKind::Int(bits)
                } else {
                    return Err(SchemaError::UnknownKind(other.to_string()));
                }
            }
        };
        Ok(kind)
    }

    fn element(&self) -> &FieldKind {
        match self {
            FieldKind::Slice(inner) => inner.element(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    /// Size annotation for big integers (or slices of them), e.g. `uint256`.
    pub annotation: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            annotation: None,
        }
    }

    pub fn annotated(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSchema {
    pub id: ComponentTypeId,
    pub name: String,
    pub fields: Vec<Field>,
}

impl ComponentSchema {
    pub fn new(id: ComponentTypeId, name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            id,
            name: name.into(),
            fields,
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_fields(&self.name, "", &self.fields)
    }
}

fn validate_fields(component: &str, prefix: &str, fields: &[Field]) -> Result<(), SchemaError> {
    for field in fields {
        let path = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        match field.kind.element() {
            FieldKind::BigInt => match field.annotation.as_deref() {
                Some(annotation) if is_sized_integer(annotation) => {}
                Some(annotation) => {
                    return Err(SchemaError::BadAnnotation {
                        component: component.to_string(),
                        field: path,
                        annotation: annotation.to_string(),
                    })
                }
                None => {
                    return Err(SchemaError::MissingAnnotation {
                        component: component.to_string(),
                        field: path,
                    })
                }
            },
            FieldKind::UnsizedUint | FieldKind::UnsizedInt => {
                return Err(SchemaError::UnsizedInteger {
                    component: component.to_string(),
                    field: path,
                })
            }
            FieldKind::Uint(bits) | FieldKind::Int(bits) if !matches!(*bits, 8 | 16 | 32 | 64) => {
                return Err(SchemaError::InvalidWidth {
                    component: component.to_string(),
                    field: path,
                    bits: *bits,
                })
            }
            FieldKind::Struct(nested) => validate_fields(component, &path, nested)?,
            _ => {}
        }
        if field.annotation.is_some() && !matches!(field.kind.element(), FieldKind::BigInt) {
            return Err(SchemaError::UnexpectedAnnotation {
                component: component.to_string(),
                field: path,
            });
        }
    }
    Ok(())
}

fn is_sized_integer(annotation: &str) -> bool {
    let bits = annotation
        .strip_prefix("uint")
        .or_else(|| annotation.strip_prefix("int"))
        .and_then(|b| b.parse::<u16>().ok());
    matches!(bits, Some(bits) if bits % 8 == 0 && (8..=256).contains(&bits))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown field kind `{0}`")]
    UnknownKind(String),
    #[error("{component}.{field}: big integer fields need a size annotation such as `uint256` or `int256`")]
    MissingAnnotation { component: String, field: String },
    #[error("{component}.{field}: `{annotation}` is not a valid size annotation, expected uint<N> or int<N> with N a multiple of 8 up to 256")]
    BadAnnotation {
        component: String,
        field: String,
        annotation: String,
    },
    #[error("{component}.{field}: platform-sized integers are not supported, use a fixed width such as uint64 or int64")]
    UnsizedInteger { component: String, field: String },
    #[error("{component}.{field}: unsupported integer width {bits}, expected 8, 16, 32 or 64")]
    InvalidWidth {
        component: String,
        field: String,
        bits: u16,
    },
    #[error("{component}.{field}: size annotations only apply to big integer fields")]
    UnexpectedAnnotation { component: String, field: String },
    #[error("component id {0} registered twice")]
    DuplicateId(ComponentTypeId),
    #[error("component name `{0}` registered twice")]
    DuplicateName(String),
}

/// The validated set of component types a world may use.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    schemas: BTreeMap<ComponentTypeId, ComponentSchema>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ComponentSchema) -> Result<ComponentTypeId, SchemaError> {
        schema.validate()?;
        if self.schemas.contains_key(&schema.id) {
            return Err(SchemaError::DuplicateId(schema.id));
        }
        if self.by_name(&schema.name).is_some() {
            return Err(SchemaError::DuplicateName(schema.name));
        }
        let id = schema.id;
        self.schemas.insert(id, schema);
        Ok(id)
    }

    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.schemas.contains_key(&id)
    }

    pub fn get(&self, id: ComponentTypeId) -> Option<&ComponentSchema> {
        self.schemas.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ComponentSchema> {
        self.schemas.values().find(|schema| schema.name == name)
    }

    pub fn ids(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.schemas.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
