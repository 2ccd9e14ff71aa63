use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Ordered map of field name to value, the body of a field container.
pub type FieldMap = IndexMap<String, FieldValue>;

/// A single field value stored in a content field container.
///
/// Each variant corresponds to one schema field type. Lists are homogeneous
/// by convention but this is enforced by the schema, not by the value.
///
/// # Usage
/// ```rust
/// use contentmesh::common::FieldValue;
///
/// let title = FieldValue::from("Hello");
/// let flag = FieldValue::from(false);
/// assert_eq!(title.as_str(), Some("Hello"));
/// assert_eq!(flag.as_bool(), Some(false));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    /// Absence of a value.
    #[default]
    Null,
    /// Plain text.
    String(String),
    /// Html markup.
    Html(String),
    /// Numeric value.
    Number(f64),
    /// Boolean flag.
    Boolean(bool),
    /// Point in time.
    Date(DateTime<Utc>),
    /// Reference to another content node.
    Node(Uuid),
    /// Reference (content hash) of a stored binary.
    Binary(String),
    /// Ordered list of values.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Name of the value kind, matching the schema field type names.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::String(_) => "string",
            FieldValue::Html(_) => "html",
            FieldValue::Number(_) => "number",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Date(_) => "date",
            FieldValue::Node(_) => "node",
            FieldValue::Binary(_) => "binary",
            FieldValue::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the text of string and html values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) | FieldValue::Html(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            FieldValue::Date(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<FieldValue>> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Converts the value to its search document representation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::String(s) | FieldValue::Html(s) | FieldValue::Binary(s) => {
                serde_json::Value::String(s.clone())
            }
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Date(d) => {
                serde_json::Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            FieldValue::Node(uuid) => serde_json::Value::String(uuid.to_string()),
            FieldValue::List(items) => {
                serde_json::Value::Array(items.iter().map(FieldValue::to_json).collect())
            }
        }
    }

    /// Collects the free text of the value for full-text indexing.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::String(s) | FieldValue::Html(s) => s.clone(),
            FieldValue::List(items) => items
                .iter()
                .map(FieldValue::to_text)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::String(s) | FieldValue::Html(s) | FieldValue::Binary(s) => write!(f, "{}", s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
            FieldValue::Node(uuid) => write!(f, "{}", uuid),
            FieldValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Node(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(values: Vec<T>) -> Self {
        FieldValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Builds a [FieldMap] from `name => value` pairs.
///
/// ```rust
/// use contentmesh::fields;
///
/// let fields = fields! { "title" => "Hello", "views" => 3 };
/// assert_eq!(fields.len(), 2);
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::common::FieldMap::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::common::FieldMap::new();
        $( map.insert($name.to_string(), $crate::common::FieldValue::from($value)); )+
        map
    }};
}
