use crate::common::{FieldMap, FieldValue, FIELD_NAME_PATTERN};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::LazyLock;

static FIELD_NAME_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(FIELD_NAME_PATTERN).ok());

/// Type of a schema field.
///
/// The textual form (`string`, `list:number`, ...) is what change properties
/// carry as `oldType` / `newType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Html,
    Number,
    Boolean,
    Date,
    Node,
    Binary,
    List(Box<FieldType>),
}

impl FieldType {
    /// Creates a list type of the given item type.
    pub fn list_of(item: FieldType) -> Self {
        FieldType::List(Box::new(item))
    }

    /// Whether a value of this type is searchable as free text.
    pub fn is_textual(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Html)
    }

    /// Whether `value` can be stored in a field of this type as is.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (_, FieldValue::Null) => true,
            (FieldType::String, FieldValue::String(_)) => true,
            (FieldType::Html, FieldValue::Html(_)) => true,
            (FieldType::Number, FieldValue::Number(_)) => true,
            (FieldType::Boolean, FieldValue::Boolean(_)) => true,
            (FieldType::Date, FieldValue::Date(_)) => true,
            (FieldType::Node, FieldValue::Node(_)) => true,
            (FieldType::Binary, FieldValue::Binary(_)) => true,
            (FieldType::List(item), FieldValue::List(values)) => values.iter().all(|v| item.accepts(v)),
            _ => false,
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Html => write!(f, "html"),
            FieldType::Number => write!(f, "number"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Date => write!(f, "date"),
            FieldType::Node => write!(f, "node"),
            FieldType::Binary => write!(f, "binary"),
            FieldType::List(item) => write!(f, "list:{}", item),
        }
    }
}

impl FromStr for FieldType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(item) = s.strip_prefix("list:") {
            return Ok(FieldType::list_of(item.parse()?));
        }
        match s {
            "string" => Ok(FieldType::String),
            "html" => Ok(FieldType::Html),
            "number" => Ok(FieldType::Number),
            "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "node" => Ok(FieldType::Node),
            "binary" => Ok(FieldType::Binary),
            other => Err(MeshError::new(
                &format!("Unknown field type '{}'", other),
                ErrorKind::ValidationError,
            )),
        }
    }
}

/// Definition of a single schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldValue>,
}

impl FieldSchema {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        FieldSchema {
            name: name.to_string(),
            field_type,
            label: None,
            required: false,
            default: None,
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn default_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Whether everything except the name matches `other`.
    pub(crate) fn same_shape(&self, other: &FieldSchema) -> bool {
        self.field_type == other.field_type
            && self.label == other.label
            && self.required == other.required
            && self.default == other.default
    }
}

/// A schema definition: the shape of one content type at one version.
///
/// # Usage
/// ```rust
/// use contentmesh::schema::{FieldSchema, FieldType, SchemaDefinition};
///
/// let schema = SchemaDefinition::new("article")
///     .with_field(FieldSchema::new("title", FieldType::String).required(true))
///     .with_field(FieldSchema::new("published", FieldType::Boolean).default_value(false))
///     .display_field("title");
/// assert!(schema.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_field: Option<String>,
    #[serde(default)]
    pub container: bool,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl SchemaDefinition {
    pub fn new(name: &str) -> Self {
        SchemaDefinition {
            name: name.to_string(),
            display_field: None,
            segment_field: None,
            container: false,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn display_field(mut self, name: &str) -> Self {
        self.display_field = Some(name.to_string());
        self
    }

    pub fn segment_field(mut self, name: &str) -> Self {
        self.segment_field = Some(name.to_string());
        self
    }

    pub fn container(mut self, container: bool) -> Self {
        self.container = container;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Checks names, uniqueness and the display/segment field references.
    pub fn validate(&self) -> MeshResult<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::new("Schema name must not be empty", ErrorKind::ValidationError));
        }

        let regex = FIELD_NAME_REGEX.as_ref().ok_or_else(|| {
            MeshError::new("Field name pattern failed to compile", ErrorKind::InternalError)
        })?;

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !regex.is_match(&field.name) {
                return Err(MeshError::new(
                    &format!("Invalid field name '{}' in schema '{}'", field.name, self.name),
                    ErrorKind::InvalidFieldName,
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(MeshError::new(
                    &format!("Duplicate field '{}' in schema '{}'", field.name, self.name),
                    ErrorKind::ValidationError,
                ));
            }
            if let Some(default) = &field.default {
                if !field.field_type.accepts(default) {
                    return Err(MeshError::new(
                        &format!(
                            "Default value of field '{}' is a {} but the field is {}",
                            field.name,
                            default.kind_name(),
                            field.field_type
                        ),
                        ErrorKind::ValidationError,
                    ));
                }
            }
        }

        if let Some(display) = &self.display_field {
            match self.field(display) {
                Some(field) if field.field_type.is_textual() => {}
                Some(_) => {
                    return Err(MeshError::new(
                        &format!("Display field '{}' must be a string or html field", display),
                        ErrorKind::ValidationError,
                    ))
                }
                None => {
                    return Err(MeshError::new(
                        &format!("Display field '{}' does not exist", display),
                        ErrorKind::ValidationError,
                    ))
                }
            }
        }

        if let Some(segment) = &self.segment_field {
            if self.field(segment).is_none() {
                return Err(MeshError::new(
                    &format!("Segment field '{}' does not exist", segment),
                    ErrorKind::ValidationError,
                ));
            }
        }

        Ok(())
    }

    /// Checks content values against this definition: every value must
    /// belong to a declared field of a matching type and required fields
    /// must be present and non-null.
    pub fn validate_fields(&self, fields: &FieldMap) -> MeshResult<()> {
        for (name, value) in fields {
            let field = self.field(name).ok_or_else(|| {
                MeshError::new(
                    &format!("Field '{}' is not declared in schema '{}'", name, self.name),
                    ErrorKind::ValidationError,
                )
            })?;
            if !field.field_type.accepts(value) {
                return Err(MeshError::new(
                    &format!(
                        "Field '{}' expects {} but got {}",
                        name,
                        field.field_type,
                        value.kind_name()
                    ),
                    ErrorKind::ValidationError,
                ));
            }
        }
        for field in self.fields.iter().filter(|f| f.required) {
            if fields.get(&field.name).map_or(true, FieldValue::is_null) {
                return Err(MeshError::new(
                    &format!("Required field '{}' is missing", field.name),
                    ErrorKind::ValidationError,
                ));
            }
        }
        Ok(())
    }
}
