use crate::common::{FieldMap, FieldValue};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::schema::{Change, ChangeOperation, FieldType};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// A built-in migration procedure.
pub type TransformFn = fn(&Change, FieldMap) -> MeshResult<FieldMap>;

/// Built-in transform table keyed by change operation.
pub fn builtin_transform(operation: ChangeOperation) -> TransformFn {
    match operation {
        ChangeOperation::AddField => add_field,
        ChangeOperation::RemoveField => remove_field,
        ChangeOperation::UpdateField => update_field,
        ChangeOperation::UpdateContainer => update_container,
    }
}

/// Runs the effective migration procedure of a change: its custom script
/// when one is attached, the built-in transform otherwise.
pub fn run_change(change: &Change, fields: FieldMap) -> MeshResult<FieldMap> {
    match change.script() {
        Some(script) => script.run(change, fields).map_err(|e| {
            MeshError::new_with_cause(
                &format!("Migration script '{}' failed", script.name()),
                ErrorKind::MigrationError,
                e,
            )
        }),
        None => builtin_transform(change.operation())(change, fields),
    }
}

/// Applies `changes` strictly in order to the values of one content unit.
pub fn migrate_fields<'a, I>(changes: I, fields: FieldMap) -> MeshResult<FieldMap>
where
    I: IntoIterator<Item = &'a Change>,
{
    changes
        .into_iter()
        .try_fold(fields, |fields, change| run_change(change, fields))
}

fn add_field(change: &Change, mut fields: FieldMap) -> MeshResult<FieldMap> {
    let name = field_name(change)?;
    if fields.get(name).is_some_and(|v| !v.is_null()) {
        return Ok(fields);
    }
    match change.default_value()? {
        Some(default) => {
            fields.insert(name.to_string(), default);
        }
        None if change.is_required() => {
            return Err(MeshError::new(
                &format!("Required field '{}' was added without a default value", name),
                ErrorKind::MigrationError,
            ))
        }
        None => {}
    }
    Ok(fields)
}

fn remove_field(change: &Change, mut fields: FieldMap) -> MeshResult<FieldMap> {
    fields.shift_remove(field_name(change)?);
    Ok(fields)
}

fn update_field(change: &Change, mut fields: FieldMap) -> MeshResult<FieldMap> {
    let name = field_name(change)?;
    let target = change.new_type()?.ok_or_else(|| {
        MeshError::new(
            &format!("Update of field '{}' has no target type", name),
            ErrorKind::MigrationError,
        )
    })?;

    let current = fields.shift_remove_full(name);
    let value = match current {
        Some((index, _, value)) if !value.is_null() => {
            let converted = coerce(value, &target)?;
            fields.shift_insert(index, name.to_string(), converted);
            return Ok(fields);
        }
        Some((index, _, _)) => Some(index),
        None => None,
    };

    if change.is_required() {
        let default = change.default_value()?.ok_or_else(|| {
            MeshError::new(
                &format!("Field '{}' became required but has no value", name),
                ErrorKind::MigrationError,
            )
        })?;
        let default = coerce(default, &target)?;
        match value {
            Some(index) => fields.shift_insert(index, name.to_string(), default),
            None => fields.insert(name.to_string(), default),
        };
    } else if let Some(index) = value {
        fields.shift_insert(index, name.to_string(), FieldValue::Null);
    }
    Ok(fields)
}

fn update_container(_change: &Change, fields: FieldMap) -> MeshResult<FieldMap> {
    Ok(fields)
}

fn field_name(change: &Change) -> MeshResult<&str> {
    change.field_name().ok_or_else(|| {
        MeshError::new(
            &format!("{} change {} has no field property", change.operation(), change.uuid()),
            ErrorKind::MigrationError,
        )
    })
}

/// Converts a value to `target`.
///
/// Scalars convert through their textual form where that is lossless,
/// numbers and dates through epoch milliseconds, numbers and booleans
/// through 0 and 1. A scalar becomes a single element list; a list becomes
/// its first element.
pub fn coerce(value: FieldValue, target: &FieldType) -> MeshResult<FieldValue> {
    if value.is_null() || target.accepts(&value) {
        return Ok(value);
    }

    match (value, target) {
        (FieldValue::List(items), FieldType::List(item)) => items
            .into_iter()
            .map(|v| coerce(v, item))
            .collect::<MeshResult<Vec<_>>>()
            .map(FieldValue::List),
        (value, FieldType::List(item)) => Ok(FieldValue::List(vec![coerce(value, item)?])),
        (FieldValue::List(items), target) => match items.into_iter().next() {
            Some(first) => coerce(first, target),
            None => Ok(FieldValue::Null),
        },

        (FieldValue::String(s) | FieldValue::Html(s), FieldType::String) => Ok(FieldValue::String(s)),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Html) => Ok(FieldValue::Html(s)),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Number) => s
            .trim()
            .parse::<f64>()
            .map(FieldValue::Number)
            .map_err(|_| conversion_error(&s, target)),
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Boolean) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(FieldValue::Boolean(true)),
                "false" => Ok(FieldValue::Boolean(false)),
                _ => Err(conversion_error(&s, target)),
            }
        }
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Date) => {
            DateTime::parse_from_rfc3339(s.trim())
                .map(|d| FieldValue::Date(d.with_timezone(&Utc)))
                .map_err(|_| conversion_error(&s, target))
        }
        (FieldValue::String(s) | FieldValue::Html(s), FieldType::Node) => Uuid::parse_str(s.trim())
            .map(FieldValue::Node)
            .map_err(|_| conversion_error(&s, target)),

        (value @ (FieldValue::Number(_) | FieldValue::Boolean(_) | FieldValue::Node(_)), FieldType::String) => {
            Ok(FieldValue::String(value.to_string()))
        }
        (value @ (FieldValue::Number(_) | FieldValue::Boolean(_) | FieldValue::Node(_)), FieldType::Html) => {
            Ok(FieldValue::Html(value.to_string()))
        }
        (FieldValue::Date(d), FieldType::String) => Ok(FieldValue::String(d.to_rfc3339())),
        (FieldValue::Date(d), FieldType::Html) => Ok(FieldValue::Html(d.to_rfc3339())),

        (FieldValue::Number(n), FieldType::Boolean) if n == 0.0 => Ok(FieldValue::Boolean(false)),
        (FieldValue::Number(n), FieldType::Boolean) if n == 1.0 => Ok(FieldValue::Boolean(true)),
        (FieldValue::Boolean(b), FieldType::Number) => Ok(FieldValue::Number(if b { 1.0 } else { 0.0 })),
        (FieldValue::Number(n), FieldType::Date) => Utc
            .timestamp_millis_opt(n as i64)
            .single()
            .map(FieldValue::Date)
            .ok_or_else(|| conversion_error(&n.to_string(), target)),
        (FieldValue::Date(d), FieldType::Number) => Ok(FieldValue::Number(d.timestamp_millis() as f64)),

        (value, target) => Err(MeshError::new(
            &format!("Cannot convert a {} value to {}", value.kind_name(), target),
            ErrorKind::TypeConversionError,
        )),
    }
}

fn conversion_error(value: &str, target: &FieldType) -> MeshError {
    MeshError::new(
        &format!("Cannot convert '{}' to {}", value, target),
        ErrorKind::TypeConversionError,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::schema::{FieldSchema, MigrationScript};

    #[test]
    fn test_empty_change_list_is_identity() {
        let source = fields! { "title" => "a", "views" => 2 };
        let migrated = migrate_fields(Vec::<&Change>::new(), source.clone()).unwrap();
        assert_eq!(migrated, source);
    }

    #[test]
    fn test_add_field_injects_default() {
        let change = Change::add_field(
            &FieldSchema::new("published", FieldType::Boolean).default_value(false),
            Some("title"),
        );
        let migrated = run_change(&change, fields! { "title" => "a" }).unwrap();
        assert_eq!(migrated.get("published"), Some(&FieldValue::Boolean(false)));
    }

    #[test]
    fn test_add_required_field_without_default_fails() {
        let change = Change::add_field(&FieldSchema::new("slug", FieldType::String).required(true), None);
        let err = run_change(&change, fields! {}).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::MigrationError);
    }

    #[test]
    fn test_remove_field_keeps_order() {
        let change = Change::remove_field("b");
        let migrated = run_change(&change, fields! { "a" => 1, "b" => 2, "c" => 3 }).unwrap();
        assert_eq!(migrated.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_update_field_coerces_in_place() {
        let change = Change::update_field(
            &FieldSchema::new("views", FieldType::String),
            &FieldSchema::new("views", FieldType::Number),
        );
        let migrated = run_change(&change, fields! { "a" => 1, "views" => "42", "z" => 0 }).unwrap();
        assert_eq!(migrated.get("views"), Some(&FieldValue::Number(42.0)));
        assert_eq!(migrated.get_index_of("views"), Some(1));
    }

    #[test]
    fn test_update_field_conversion_failure() {
        let change = Change::update_field(
            &FieldSchema::new("views", FieldType::String),
            &FieldSchema::new("views", FieldType::Number),
        );
        let err = run_change(&change, fields! { "views" => "many" }).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TypeConversionError);
    }

    #[test]
    fn test_update_field_newly_required() {
        let change = Change::update_field(
            &FieldSchema::new("slug", FieldType::String),
            &FieldSchema::new("slug", FieldType::String).required(true),
        );
        assert!(run_change(&change, fields! {}).is_err());

        let with_default = Change::update_field(
            &FieldSchema::new("slug", FieldType::String),
            &FieldSchema::new("slug", FieldType::String).required(true).default_value("none"),
        );
        let migrated = run_change(&with_default, fields! {}).unwrap();
        assert_eq!(migrated.get("slug"), Some(&FieldValue::from("none")));
    }

    #[test]
    fn test_custom_script_overrides_builtin() {
        let change = Change::remove_field("title").with_script(MigrationScript::new("archive", |_, mut fields| {
            if let Some(title) = fields.shift_remove("title") {
                fields.insert("archivedTitle".to_string(), title);
            }
            Ok(fields)
        }));
        let migrated = run_change(&change, fields! { "title" => "x" }).unwrap();
        assert_eq!(migrated.get("archivedTitle"), Some(&FieldValue::from("x")));
    }

    #[test]
    fn test_script_error_is_migration_error() {
        let change = Change::remove_field("title").with_script(MigrationScript::new("broken", |_, _| {
            Err(MeshError::new("boom", ErrorKind::InternalError))
        }));
        let err = run_change(&change, fields! {}).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::MigrationError);
        assert_eq!(err.cause().map(|c| c.message()), Some("boom"));
    }

    #[test]
    fn test_changes_apply_in_order() {
        let add = Change::add_field(&FieldSchema::new("count", FieldType::String).default_value("7"), None);
        let update = Change::update_field(
            &FieldSchema::new("count", FieldType::String),
            &FieldSchema::new("count", FieldType::Number),
        );
        let migrated = migrate_fields([&add, &update], fields! {}).unwrap();
        assert_eq!(migrated.get("count"), Some(&FieldValue::Number(7.0)));
    }

    #[test]
    fn test_coerce_table() {
        assert_eq!(coerce(FieldValue::from(3), &FieldType::String).unwrap(), FieldValue::from("3"));
        assert_eq!(coerce(FieldValue::from("TRUE"), &FieldType::Boolean).unwrap(), FieldValue::from(true));
        assert_eq!(coerce(FieldValue::from(true), &FieldType::Number).unwrap(), FieldValue::from(1));
        assert_eq!(coerce(FieldValue::from(0), &FieldType::Boolean).unwrap(), FieldValue::from(false));
        assert!(coerce(FieldValue::from(2), &FieldType::Boolean).is_err());
        assert_eq!(
            coerce(FieldValue::from("a"), &FieldType::list_of(FieldType::String)).unwrap(),
            FieldValue::from(vec!["a"])
        );
        assert_eq!(
            coerce(FieldValue::from(vec!["1", "2"]), &FieldType::list_of(FieldType::Number)).unwrap(),
            FieldValue::from(vec![1, 2])
        );
        assert_eq!(coerce(FieldValue::from(vec!["x", "y"]), &FieldType::String).unwrap(), FieldValue::from("x"));
        assert_eq!(coerce(FieldValue::List(vec![]), &FieldType::Number).unwrap(), FieldValue::Null);
        assert_eq!(
            coerce(FieldValue::from("<b>x</b>"), &FieldType::Html).unwrap(),
            FieldValue::Html("<b>x</b>".to_string())
        );
        assert!(coerce(FieldValue::Binary("sha".into()), &FieldType::String).is_err());
    }

    #[test]
    fn test_coerce_dates() {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let as_number = coerce(FieldValue::Date(date), &FieldType::Number).unwrap();
        assert_eq!(coerce(as_number, &FieldType::Date).unwrap(), FieldValue::Date(date));
        assert_eq!(
            coerce(FieldValue::from("2024-01-02T03:04:05Z"), &FieldType::Date).unwrap(),
            FieldValue::Date(date)
        );
    }

    #[test]
    fn test_builtin_table_covers_every_operation() {
        let fields = fields! { "a" => 1 };
        let change = Change::update_container(Default::default());
        let result = builtin_transform(ChangeOperation::UpdateContainer)(&change, fields.clone()).unwrap();
        assert_eq!(result, fields);
    }
}
