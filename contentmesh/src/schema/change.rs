use crate::common::{
    FieldMap, FieldValue, PROP_AFTER, PROP_CONTAINER, PROP_DEFAULT, PROP_DISPLAY_FIELD, PROP_FIELD,
    PROP_LABEL, PROP_NAME, PROP_NEW_TYPE, PROP_OLD_TYPE, PROP_ORDER, PROP_REQUIRED,
    PROP_SEGMENT_FIELD, PROP_TYPE,
};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::schema::{FieldSchema, FieldType, SchemaDefinition};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Property bag of a change, keyed by the rest property names.
pub type ChangeProperties = IndexMap<String, Value>;

/// Signature of a migration procedure: receives the change and the current
/// field values of one content unit and returns the migrated values.
pub type ScriptFn = dyn Fn(&Change, FieldMap) -> MeshResult<FieldMap> + Send + Sync;

/// The kind of an atomic schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    AddField,
    RemoveField,
    UpdateField,
    UpdateContainer,
}

impl Display for ChangeOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOperation::AddField => write!(f, "ADD_FIELD"),
            ChangeOperation::RemoveField => write!(f, "REMOVE_FIELD"),
            ChangeOperation::UpdateField => write!(f, "UPDATE_FIELD"),
            ChangeOperation::UpdateContainer => write!(f, "UPDATE_CONTAINER"),
        }
    }
}

/// A named custom migration procedure attached to a change.
///
/// When present it replaces the built-in transform of the change's
/// operation for every content unit.
#[derive(Clone)]
pub struct MigrationScript {
    name: String,
    func: Arc<ScriptFn>,
}

impl MigrationScript {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&Change, FieldMap) -> MeshResult<FieldMap> + Send + Sync + 'static,
    {
        MigrationScript {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, change: &Change, fields: FieldMap) -> MeshResult<FieldMap> {
        (self.func)(change, fields)
    }
}

impl Debug for MigrationScript {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationScript").field("name", &self.name).finish()
    }
}

/// One atomic edit between two adjacent schema versions.
///
/// A change is detached until the version chain links it; linking sets the
/// source/target versions and the neighbouring changes of the same
/// transition.
#[derive(Debug, Clone)]
pub struct Change {
    uuid: Uuid,
    operation: ChangeOperation,
    properties: ChangeProperties,
    script: Option<MigrationScript>,
    pub(crate) from_version: Option<Uuid>,
    pub(crate) to_version: Option<Uuid>,
    pub(crate) previous_change: Option<Uuid>,
    pub(crate) next_change: Option<Uuid>,
}

impl Change {
    pub fn new(operation: ChangeOperation, properties: ChangeProperties) -> Self {
        Change {
            uuid: Uuid::new_v4(),
            operation,
            properties,
            script: None,
            from_version: None,
            to_version: None,
            previous_change: None,
            next_change: None,
        }
    }

    /// Adds `field` right after the field named `after`, or first when
    /// `after` is `None`.
    pub fn add_field(field: &FieldSchema, after: Option<&str>) -> Self {
        let mut properties = ChangeProperties::new();
        properties.insert(PROP_FIELD.to_string(), Value::from(field.name.as_str()));
        properties.insert(PROP_TYPE.to_string(), Value::from(field.field_type.to_string()));
        insert_field_properties(&mut properties, field);
        properties.insert(
            PROP_AFTER.to_string(),
            after.map(Value::from).unwrap_or(Value::Null),
        );
        Change::new(ChangeOperation::AddField, properties)
    }

    pub fn remove_field(name: &str) -> Self {
        let mut properties = ChangeProperties::new();
        properties.insert(PROP_FIELD.to_string(), Value::from(name));
        Change::new(ChangeOperation::RemoveField, properties)
    }

    pub fn update_field(old: &FieldSchema, new: &FieldSchema) -> Self {
        let mut properties = ChangeProperties::new();
        properties.insert(PROP_FIELD.to_string(), Value::from(new.name.as_str()));
        properties.insert(PROP_OLD_TYPE.to_string(), Value::from(old.field_type.to_string()));
        properties.insert(PROP_NEW_TYPE.to_string(), Value::from(new.field_type.to_string()));
        insert_field_properties(&mut properties, new);
        Change::new(ChangeOperation::UpdateField, properties)
    }

    pub fn update_container(properties: ChangeProperties) -> Self {
        Change::new(ChangeOperation::UpdateContainer, properties)
    }

    /// Attaches a custom migration script.
    pub fn with_script(mut self, script: MigrationScript) -> Self {
        self.script = Some(script);
        self
    }

    pub fn set_script(&mut self, script: MigrationScript) {
        self.script = Some(script);
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn operation(&self) -> ChangeOperation {
        self.operation
    }

    pub fn properties(&self) -> &ChangeProperties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn script(&self) -> Option<&MigrationScript> {
        self.script.as_ref()
    }

    pub fn field_name(&self) -> Option<&str> {
        self.property(PROP_FIELD).and_then(Value::as_str)
    }

    pub fn old_type(&self) -> MeshResult<Option<FieldType>> {
        self.type_property(PROP_OLD_TYPE)
    }

    /// Target type of an added or updated field.
    pub fn new_type(&self) -> MeshResult<Option<FieldType>> {
        match self.operation {
            ChangeOperation::AddField => self.type_property(PROP_TYPE),
            _ => self.type_property(PROP_NEW_TYPE),
        }
    }

    pub fn is_required(&self) -> bool {
        self.property(PROP_REQUIRED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn default_value(&self) -> MeshResult<Option<FieldValue>> {
        match self.property(PROP_DEFAULT) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn from_version(&self) -> Option<Uuid> {
        self.from_version
    }

    pub fn to_version(&self) -> Option<Uuid> {
        self.to_version
    }

    pub fn previous_change(&self) -> Option<Uuid> {
        self.previous_change
    }

    pub fn next_change(&self) -> Option<Uuid> {
        self.next_change
    }

    /// Rest representation of the change.
    pub fn to_model(&self) -> ChangeModel {
        ChangeModel {
            uuid: self.uuid,
            operation: self.operation,
            properties: self.properties.clone(),
            migration_script: self.script.as_ref().map(|s| s.name().to_string()),
        }
    }

    /// Replays this change on a schema definition.
    pub fn apply_to(&self, definition: &mut SchemaDefinition) -> MeshResult<()> {
        match self.operation {
            ChangeOperation::AddField => {
                let field = self.field_from_properties(PROP_TYPE)?;
                if definition.field(&field.name).is_some() {
                    return Err(MeshError::new(
                        &format!("Field '{}' already exists in schema '{}'", field.name, definition.name),
                        ErrorKind::ValidationError,
                    ));
                }
                let names = definition.field_names();
                let after = self.property(PROP_AFTER).and_then(Value::as_str);
                let position = insert_position(&names, after);
                definition.fields.insert(position, field);
            }
            ChangeOperation::RemoveField => {
                let name = self.required_field_name()?;
                let position = definition.field_position(name).ok_or_else(|| {
                    MeshError::new(
                        &format!("Cannot remove unknown field '{}'", name),
                        ErrorKind::ValidationError,
                    )
                })?;
                definition.fields.remove(position);
            }
            ChangeOperation::UpdateField => {
                let field = self.field_from_properties(PROP_NEW_TYPE)?;
                let position = definition.field_position(&field.name).ok_or_else(|| {
                    MeshError::new(
                        &format!("Cannot update unknown field '{}'", field.name),
                        ErrorKind::ValidationError,
                    )
                })?;
                definition.fields[position] = field;
            }
            ChangeOperation::UpdateContainer => self.apply_container_properties(definition)?,
        }
        Ok(())
    }

    fn apply_container_properties(&self, definition: &mut SchemaDefinition) -> MeshResult<()> {
        if let Some(name) = self.property(PROP_NAME).and_then(Value::as_str) {
            definition.name = name.to_string();
        }
        if let Some(display) = self.property(PROP_DISPLAY_FIELD) {
            definition.display_field = display.as_str().map(str::to_string);
        }
        if let Some(segment) = self.property(PROP_SEGMENT_FIELD) {
            definition.segment_field = segment.as_str().map(str::to_string);
        }
        if let Some(container) = self.property(PROP_CONTAINER).and_then(Value::as_bool) {
            definition.container = container;
        }
        if let Some(order) = self.property(PROP_ORDER).and_then(Value::as_array) {
            let mut reordered = Vec::with_capacity(definition.fields.len());
            for name in order.iter().filter_map(Value::as_str) {
                let position = definition.field_position(name).ok_or_else(|| {
                    MeshError::new(
                        &format!("Field order references unknown field '{}'", name),
                        ErrorKind::ValidationError,
                    )
                })?;
                reordered.push(definition.fields.remove(position));
            }
            // fields the order list does not mention keep their relative order at the end
            reordered.append(&mut definition.fields);
            definition.fields = reordered;
        }
        Ok(())
    }

    fn required_field_name(&self) -> MeshResult<&str> {
        self.field_name().ok_or_else(|| {
            MeshError::new(
                &format!("{} change {} has no field property", self.operation, self.uuid),
                ErrorKind::ValidationError,
            )
        })
    }

    fn type_property(&self, key: &str) -> MeshResult<Option<FieldType>> {
        match self.property(key).and_then(Value::as_str) {
            Some(name) => Ok(Some(name.parse()?)),
            None => Ok(None),
        }
    }

    fn field_from_properties(&self, type_key: &str) -> MeshResult<FieldSchema> {
        let name = self.required_field_name()?;
        let field_type = self.type_property(type_key)?.ok_or_else(|| {
            MeshError::new(
                &format!("{} change for '{}' has no {} property", self.operation, name, type_key),
                ErrorKind::ValidationError,
            )
        })?;
        Ok(FieldSchema {
            name: name.to_string(),
            field_type,
            label: self.property(PROP_LABEL).and_then(Value::as_str).map(str::to_string),
            required: self.is_required(),
            default: self.default_value()?,
        })
    }
}

fn insert_field_properties(properties: &mut ChangeProperties, field: &FieldSchema) {
    properties.insert(
        PROP_LABEL.to_string(),
        field.label.as_deref().map(Value::from).unwrap_or(Value::Null),
    );
    properties.insert(PROP_REQUIRED.to_string(), Value::from(field.required));
    let default = field
        .default
        .as_ref()
        .and_then(|d| serde_json::to_value(d).ok())
        .unwrap_or(Value::Null);
    properties.insert(PROP_DEFAULT.to_string(), default);
}

/// Position at which an added field lands: right after `after` when that
/// field exists, at the end when it does not, first when `after` is unset.
pub(crate) fn insert_position(names: &[&str], after: Option<&str>) -> usize {
    match after {
        None => 0,
        Some(after) => names
            .iter()
            .position(|n| *n == after)
            .map(|p| p + 1)
            .unwrap_or(names.len()),
    }
}

/// Serializable rest representation of a [Change].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeModel {
    pub uuid: Uuid,
    pub operation: ChangeOperation,
    pub properties: ChangeProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_script: Option<String>,
}

/// Ordered list of changes connecting two adjacent schema versions.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet { changes: Vec::new() }
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn operations(&self) -> Vec<ChangeOperation> {
        self.changes.iter().map(Change::operation).collect()
    }

    /// Attaches `script` to the first change touching `field`.
    pub fn attach_script(&mut self, field: &str, script: MigrationScript) -> MeshResult<()> {
        match self.changes.iter_mut().find(|c| c.field_name() == Some(field)) {
            Some(change) => {
                change.set_script(script);
                Ok(())
            }
            None => Err(MeshError::new(
                &format!("No change touches field '{}'", field),
                ErrorKind::NotFound,
            )),
        }
    }

    /// Replays every change in order on a copy of `definition`.
    pub fn apply_to(&self, definition: &SchemaDefinition) -> MeshResult<SchemaDefinition> {
        let mut result = definition.clone();
        for change in &self.changes {
            change.apply_to(&mut result)?;
        }
        Ok(result)
    }

    pub fn to_models(&self) -> Vec<ChangeModel> {
        self.changes.iter().map(Change::to_model).collect()
    }

    pub(crate) fn into_changes(self) -> Vec<Change> {
        self.changes
    }
}

impl From<Vec<Change>> for ChangeSet {
    fn from(changes: Vec<Change>) -> Self {
        ChangeSet { changes }
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article() -> SchemaDefinition {
        SchemaDefinition::new("article")
            .with_field(FieldSchema::new("title", FieldType::String))
            .with_field(FieldSchema::new("subtitle", FieldType::String))
    }

    #[test]
    fn test_operation_serializes_screaming_snake() {
        let json = serde_json::to_string(&ChangeOperation::UpdateContainer).unwrap();
        assert_eq!(json, "\"UPDATE_CONTAINER\"");
        assert_eq!(ChangeOperation::AddField.to_string(), "ADD_FIELD");
    }

    #[test]
    fn test_add_field_properties() {
        let field = FieldSchema::new("published", FieldType::Boolean).default_value(false);
        let change = Change::add_field(&field, Some("title"));
        assert_eq!(change.field_name(), Some("published"));
        assert_eq!(change.new_type().unwrap(), Some(FieldType::Boolean));
        assert_eq!(change.default_value().unwrap(), Some(FieldValue::Boolean(false)));
        assert_eq!(change.property(PROP_AFTER), Some(&json!("title")));
    }

    #[test]
    fn test_add_field_after_inserts_at_position() {
        let field = FieldSchema::new("teaser", FieldType::Html);
        let mut schema = article();
        Change::add_field(&field, Some("title")).apply_to(&mut schema).unwrap();
        assert_eq!(schema.field_names(), vec!["title", "teaser", "subtitle"]);

        let mut schema = article();
        Change::add_field(&field, None).apply_to(&mut schema).unwrap();
        assert_eq!(schema.field_names(), vec!["teaser", "title", "subtitle"]);
    }

    #[test]
    fn test_add_existing_field_fails() {
        let field = FieldSchema::new("title", FieldType::String);
        let mut schema = article();
        assert!(Change::add_field(&field, None).apply_to(&mut schema).is_err());
    }

    #[test]
    fn test_remove_field() {
        let mut schema = article();
        Change::remove_field("subtitle").apply_to(&mut schema).unwrap();
        assert_eq!(schema.field_names(), vec!["title"]);
        assert!(Change::remove_field("subtitle").apply_to(&mut schema).is_err());
    }

    #[test]
    fn test_update_field_replaces_shape() {
        let old = FieldSchema::new("subtitle", FieldType::String);
        let new = FieldSchema::new("subtitle", FieldType::list_of(FieldType::String)).required(true);
        let change = Change::update_field(&old, &new);
        assert_eq!(change.old_type().unwrap(), Some(FieldType::String));
        assert_eq!(change.new_type().unwrap(), Some(FieldType::list_of(FieldType::String)));

        let mut schema = article();
        change.apply_to(&mut schema).unwrap();
        assert_eq!(schema.field("subtitle"), Some(&new));
    }

    #[test]
    fn test_update_container_properties_and_order() {
        let mut properties = ChangeProperties::new();
        properties.insert(PROP_DISPLAY_FIELD.to_string(), json!("subtitle"));
        properties.insert(PROP_CONTAINER.to_string(), json!(true));
        properties.insert(PROP_ORDER.to_string(), json!(["subtitle", "title"]));

        let mut schema = article().display_field("title");
        Change::update_container(properties).apply_to(&mut schema).unwrap();
        assert_eq!(schema.display_field.as_deref(), Some("subtitle"));
        assert!(schema.container);
        assert_eq!(schema.field_names(), vec!["subtitle", "title"]);
    }

    #[test]
    fn test_update_container_null_clears_display_field() {
        let mut properties = ChangeProperties::new();
        properties.insert(PROP_DISPLAY_FIELD.to_string(), Value::Null);
        let mut schema = article().display_field("title");
        Change::update_container(properties).apply_to(&mut schema).unwrap();
        assert!(schema.display_field.is_none());
    }

    #[test]
    fn test_script_attachment_and_model() {
        let mut set = ChangeSet::from(vec![Change::remove_field("subtitle")]);
        set.attach_script("subtitle", MigrationScript::new("keep", |_, fields| Ok(fields)))
            .unwrap();
        assert!(set.attach_script("missing", MigrationScript::new("x", |_, f| Ok(f))).is_err());

        let model = set.changes()[0].to_model();
        assert_eq!(model.migration_script.as_deref(), Some("keep"));
        assert_eq!(model.operation, ChangeOperation::RemoveField);
    }

    #[test]
    fn test_script_runs_with_change() {
        let script = MigrationScript::new("upper", |change, mut fields| {
            let name = change.field_name().unwrap_or_default().to_string();
            if let Some(value) = fields.get(&name).and_then(|v| v.as_str()).map(str::to_uppercase) {
                fields.insert(name, FieldValue::from(value));
            }
            Ok(fields)
        });
        let change = Change::remove_field("title");
        let result = script.run(&change, crate::fields! { "title" => "abc" }).unwrap();
        assert_eq!(result.get("title"), Some(&FieldValue::from("ABC")));
    }

    #[test]
    fn test_change_set_apply_to_is_ordered() {
        let set = ChangeSet::from(vec![
            Change::remove_field("subtitle"),
            Change::add_field(&FieldSchema::new("subtitle", FieldType::Number), Some("title")),
        ]);
        let result = set.apply_to(&article()).unwrap();
        assert_eq!(result.field("subtitle").map(|f| &f.field_type), Some(&FieldType::Number));
        assert_eq!(set.operations(), vec![ChangeOperation::RemoveField, ChangeOperation::AddField]);
    }
}
