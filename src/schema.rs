//! Data-driven schema descriptors.
//!
//! A [`Schema`] describes the required shape of one collection's fields:
//! presence, type, format constraints, and an optional discriminated union
//! where a tag field (e.g. `provider`) selects which extra fields are
//! required. [`validate`] is pure and reports every violation it finds.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Top-level names owned by the store. Client payloads may never carry them.
pub const RESERVED_FIELDS: &[&str] = &[
    "_id",
    "createdAt",
    "createdBy",
    "updatedAt",
    "updatedBy",
    "deleted",
    "deletedAt",
    "deletedBy",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// One violation: where, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "document {}", self.reason)
        } else {
            write!(f, "{} {}", self.path, self.reason)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The error reported for `path`, if any.
    pub fn at(&self, path: &str) -> Option<&FieldError> {
        self.0.iter().find(|e| e.path == path)
    }
}

impl From<FieldError> for ValidationErrors {
    fn from(error: FieldError) -> Self {
        Self(vec![error])
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Any,
    String,
    NonEmptyString,
    /// A string that looks like a document identifier.
    Id,
    Integer,
    Number,
    Boolean,
    /// RFC 3339 timestamp string.
    Timestamp,
    Enum(Vec<String>),
    Array(Box<FieldType>),
    Object(Vec<Field>),
}

impl FieldType {
    pub fn enumeration(values: &[&str]) -> Self {
        FieldType::Enum(values.iter().map(|v| v.to_string()).collect())
    }

    pub fn array_of(item: FieldType) -> Self {
        FieldType::Array(Box::new(item))
    }

    pub fn object(fields: Vec<Field>) -> Self {
        FieldType::Object(fields)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    ty: FieldType,
    optional: bool,
}

impl Field {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &FieldType {
        &self.ty
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Discriminated union: the value of `tag` selects one case's fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Variants {
    tag: String,
    cases: Vec<(String, Vec<Field>)>,
}

impl Variants {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn case(&self, value: &str) -> Option<&[Field]> {
        self.cases
            .iter()
            .find(|(name, _)| name == value)
            .map(|(_, fields)| fields.as_slice())
    }

    fn case_names(&self) -> Vec<&str> {
        self.cases.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn declares(&self, field: &str) -> bool {
        self.cases
            .iter()
            .any(|(_, fields)| fields.iter().any(|f| f.name == field))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<Field>,
    variants: Option<Variants>,
    soft_delete: bool,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn variants(&self) -> Option<&Variants> {
        self.variants.as_ref()
    }

    /// Whether documents carry a delete state managed by the soft-delete layer.
    pub fn is_soft_deletable(&self) -> bool {
        self.soft_delete
    }

    pub fn validate(&self, value: &Value) -> std::result::Result<Map<String, Value>, ValidationErrors> {
        validate(value, self)
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<Field>,
    tag: Option<String>,
    cases: Vec<(String, Vec<Field>)>,
    soft_delete: bool,
}

impl SchemaBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn required(self, name: &str, ty: FieldType) -> Self {
        self.field(Field::required(name, ty))
    }

    pub fn optional(self, name: &str, ty: FieldType) -> Self {
        self.field(Field::optional(name, ty))
    }

    /// Name the tag field of a discriminated union.
    pub fn discriminator(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    /// Fields required when the tag equals `value`.
    pub fn variant(mut self, value: &str, fields: Vec<Field>) -> Self {
        self.cases.push((value.to_string(), fields));
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Check the descriptor itself for ambiguity and build it.
    pub fn build(self) -> Result<Schema> {
        let mut base = HashSet::new();
        for field in &self.fields {
            if RESERVED_FIELDS.contains(&field.name.as_str()) {
                return Err(Error::Schema(format!("{} is a reserved field", field.name)));
            }
            if !base.insert(field.name.as_str()) {
                return Err(Error::Schema(format!("duplicate field {}", field.name)));
            }
            check_nested(&field.name, &field.ty)?;
        }

        let variants = match (self.tag, self.cases.is_empty()) {
            (None, true) => None,
            (None, false) => {
                return Err(Error::Schema("variants declared without a discriminator".into()));
            }
            (Some(tag), true) => {
                return Err(Error::Schema(format!("discriminator {tag} has no variants")));
            }
            (Some(tag), false) => {
                if base.contains(tag.as_str()) || RESERVED_FIELDS.contains(&tag.as_str()) {
                    return Err(Error::Schema(format!("discriminator {tag} clashes with a field")));
                }
                let mut seen = HashSet::new();
                for (value, fields) in &self.cases {
                    if !seen.insert(value.as_str()) {
                        return Err(Error::Schema(format!("duplicate variant {tag}={value}")));
                    }
                    let mut own = HashSet::new();
                    for field in fields {
                        let name = field.name.as_str();
                        if name == tag || base.contains(name) || RESERVED_FIELDS.contains(&name) {
                            return Err(Error::Schema(format!(
                                "variant {tag}={value} redeclares field {name}"
                            )));
                        }
                        if !own.insert(name) {
                            return Err(Error::Schema(format!("duplicate field {name}")));
                        }
                        check_nested(name, &field.ty)?;
                    }
                }
                Some(Variants {
                    tag,
                    cases: self.cases,
                })
            }
        };

        Ok(Schema {
            fields: self.fields,
            variants,
            soft_delete: self.soft_delete,
        })
    }
}

fn check_nested(path: &str, ty: &FieldType) -> Result<()> {
    match ty {
        FieldType::Object(fields) => {
            let mut seen = HashSet::new();
            for field in fields {
                let nested = format!("{path}.{}", field.name);
                if !seen.insert(field.name.as_str()) {
                    return Err(Error::Schema(format!("duplicate field {nested}")));
                }
                check_nested(&nested, &field.ty)?;
            }
            Ok(())
        }
        FieldType::Array(item) => check_nested(path, item),
        FieldType::Enum(values) if values.is_empty() => {
            Err(Error::Schema(format!("enum {path} has no values")))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Does `s` look like a document identifier?
///
/// Accepts UUIDs and 17-character random ids drawn from the unambiguous
/// alphabet used for legacy identifiers.
pub fn looks_like_id(s: &str) -> bool {
    const ALPHABET: &str = "23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";
    uuid::Uuid::parse_str(s).is_ok() || (s.len() == 17 && s.chars().all(|c| ALPHABET.contains(c)))
}

/// Validate `value` against `schema`.
///
/// On success returns the normalized fields (explicit `null`s on optional
/// fields dropped). On failure returns every violation found.
pub fn validate(
    value: &Value,
    schema: &Schema,
) -> std::result::Result<Map<String, Value>, ValidationErrors> {
    let Some(obj) = value.as_object() else {
        return Err(FieldError::new("", "must be an object").into());
    };

    let mut errors = Vec::new();
    let mut allowed: Vec<&Field> = schema.fields.iter().collect();
    let mut tag_ok = true;

    if let Some(ref variants) = schema.variants {
        let tag = variants.tag.as_str();
        match obj.get(tag) {
            None | Some(Value::Null) => {
                errors.push(FieldError::new(tag, "is required"));
                tag_ok = false;
            }
            Some(Value::String(value)) => match variants.case(value) {
                Some(fields) => allowed.extend(fields),
                None => {
                    errors.push(FieldError::new(
                        tag,
                        format!("must be one of {}", variants.case_names().join(", ")),
                    ));
                    tag_ok = false;
                }
            },
            Some(_) => {
                errors.push(FieldError::new(tag, "must be a string"));
                tag_ok = false;
            }
        }
    }

    let mut out = check_fields(obj, &allowed, "", &mut errors);

    for key in obj.keys() {
        if allowed.iter().any(|f| f.name == *key) {
            continue;
        }
        match schema.variants {
            Some(ref v) if v.tag == *key => {
                if let Some(tag) = obj.get(key) {
                    out.insert(key.clone(), tag.clone());
                }
            }
            // Fields of an unresolvable variant are already covered by the tag error.
            Some(ref v) if !tag_ok && v.declares(key) => {}
            _ if RESERVED_FIELDS.contains(&key.as_str()) => {
                errors.push(FieldError::new(key.as_str(), "is system-managed"));
            }
            _ => errors.push(FieldError::new(key.as_str(), "is not allowed by the schema")),
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(ValidationErrors(errors))
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn check_fields(
    obj: &Map<String, Value>,
    fields: &[&Field],
    prefix: &str,
    errors: &mut Vec<FieldError>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for field in fields {
        let path = join(prefix, &field.name);
        match obj.get(&field.name) {
            None | Some(Value::Null) => {
                if !field.optional {
                    errors.push(FieldError::new(path, "is required"));
                }
            }
            Some(value) => {
                let normalized = check_type(value, &field.ty, &path, errors);
                out.insert(field.name.clone(), normalized);
            }
        }
    }
    out
}

fn check_type(value: &Value, ty: &FieldType, path: &str, errors: &mut Vec<FieldError>) -> Value {
    let reason = match ty {
        FieldType::Any => None,
        FieldType::String if !value.is_string() => Some("must be a string".to_string()),
        FieldType::NonEmptyString => match value.as_str() {
            Some(s) if !s.is_empty() => None,
            Some(_) => Some("must not be empty".to_string()),
            None => Some("must be a string".to_string()),
        },
        FieldType::Id => match value.as_str() {
            Some(s) if looks_like_id(s) => None,
            Some(_) => Some("must be an identifier".to_string()),
            None => Some("must be a string".to_string()),
        },
        FieldType::Integer if !(value.is_i64() || value.is_u64()) => {
            Some("must be an integer".to_string())
        }
        FieldType::Number if !value.is_number() => Some("must be a number".to_string()),
        FieldType::Boolean if !value.is_boolean() => Some("must be a boolean".to_string()),
        FieldType::Timestamp => match value.as_str() {
            Some(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => None,
            _ => Some("must be an RFC 3339 timestamp".to_string()),
        },
        FieldType::Enum(values) => match value.as_str() {
            Some(s) if values.iter().any(|v| v == s) => None,
            _ => Some(format!("must be one of {}", values.join(", "))),
        },
        FieldType::Array(item) => {
            let Some(items) = value.as_array() else {
                errors.push(FieldError::new(path, "must be an array"));
                return value.clone();
            };
            let normalized = items
                .iter()
                .enumerate()
                .map(|(i, v)| check_type(v, item, &format!("{path}.{i}"), errors))
                .collect();
            return Value::Array(normalized);
        }
        FieldType::Object(fields) => {
            let Some(obj) = value.as_object() else {
                errors.push(FieldError::new(path, "must be an object"));
                return value.clone();
            };
            let refs: Vec<&Field> = fields.iter().collect();
            let out = check_fields(obj, &refs, path, errors);
            for key in obj.keys() {
                if !fields.iter().any(|f| f.name == *key) {
                    errors.push(FieldError::new(join(path, key), "is not allowed by the schema"));
                }
            }
            return Value::Object(out);
        }
        _ => None,
    };

    if let Some(reason) = reason {
        errors.push(FieldError::new(path, reason));
    }
    value.clone()
}
