use crate::common::{PROP_CONTAINER, PROP_DISPLAY_FIELD, PROP_NAME, PROP_ORDER, PROP_SEGMENT_FIELD};
use crate::schema::change::insert_position;
use crate::schema::{Change, ChangeOperation, ChangeProperties, ChangeSet, SchemaDefinition};
use serde_json::Value;

/// Computes the change set between two schema definitions.
///
/// Fields are matched by name. Changes come out in a fixed order so that
/// migration scripts always run in the same sequence:
///
/// 1. removals, in declaration order of the old schema
/// 2. additions, in declaration order of the new schema
/// 3. updates, in declaration order of the new schema
/// 4. at most one container change (name, display/segment field, container
///    flag, field order)
///
/// Structurally identical schemas produce an empty change set.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaDiffer;

impl SchemaDiffer {
    pub fn new() -> Self {
        SchemaDiffer
    }

    pub fn diff(&self, old: &SchemaDefinition, new: &SchemaDefinition) -> ChangeSet {
        let mut changes = ChangeSet::new();

        for field in &old.fields {
            if new.field(&field.name).is_none() {
                changes.push(Change::remove_field(&field.name));
            }
        }

        for (i, field) in new.fields.iter().enumerate() {
            if old.field(&field.name).is_none() {
                let after = if i > 0 { Some(new.fields[i - 1].name.as_str()) } else { None };
                changes.push(Change::add_field(field, after));
            }
        }

        for field in &new.fields {
            if let Some(previous) = old.field(&field.name) {
                if !previous.same_shape(field) {
                    changes.push(Change::update_field(previous, field));
                }
            }
        }

        let properties = self.container_properties(old, new, &changes);
        if !properties.is_empty() {
            changes.push(Change::update_container(properties));
        }

        log::debug!(
            "Schema diff '{}' -> '{}' produced {} changes",
            old.name,
            new.name,
            changes.len()
        );
        changes
    }

    fn container_properties(
        &self,
        old: &SchemaDefinition,
        new: &SchemaDefinition,
        field_changes: &ChangeSet,
    ) -> ChangeProperties {
        let mut properties = ChangeProperties::new();
        if old.name != new.name {
            properties.insert(PROP_NAME.to_string(), Value::from(new.name.as_str()));
        }
        if old.display_field != new.display_field {
            properties.insert(PROP_DISPLAY_FIELD.to_string(), optional_string(&new.display_field));
        }
        if old.segment_field != new.segment_field {
            properties.insert(PROP_SEGMENT_FIELD.to_string(), optional_string(&new.segment_field));
        }
        if old.container != new.container {
            properties.insert(PROP_CONTAINER.to_string(), Value::from(new.container));
        }

        let target = new.field_names();
        if simulate_field_order(old, field_changes) != target {
            properties.insert(
                PROP_ORDER.to_string(),
                Value::Array(target.into_iter().map(Value::from).collect()),
            );
        }
        properties
    }
}

fn optional_string(value: &Option<String>) -> Value {
    value.as_deref().map(Value::from).unwrap_or(Value::Null)
}

/// Field order that results from replaying the field changes on `old`.
fn simulate_field_order<'a>(old: &'a SchemaDefinition, changes: &'a ChangeSet) -> Vec<&'a str> {
    let mut names = old.field_names();
    for change in changes.iter() {
        let Some(field) = change.field_name() else { continue };
        match change.operation() {
            ChangeOperation::RemoveField => names.retain(|n| *n != field),
            ChangeOperation::AddField => {
                let after = change.property(crate::common::PROP_AFTER).and_then(Value::as_str);
                let position = insert_position(&names, after);
                names.insert(position, field);
            }
            _ => {}
        }
    }
    names
}
