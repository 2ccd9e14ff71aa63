use crate::content::{FieldContainer, Project, Release};
use crate::schema::{FieldType, SchemaDefinition, SchemaVersion};
use serde_json::{json, Map, Value};

/// Turns field containers into search documents and schema definitions into
/// search mappings.
#[derive(Debug, Clone)]
pub struct DocumentTransformer {
    document_type: String,
}

impl DocumentTransformer {
    pub fn new(document_type: &str) -> Self {
        DocumentTransformer {
            document_type: document_type.to_string(),
        }
    }

    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    /// Builds the search document of `container`.
    pub fn document(
        &self,
        project: &Project,
        release: &Release,
        version: &SchemaVersion,
        container: &FieldContainer,
    ) -> Value {
        let definition = version.definition();
        let mut fields = Map::new();
        for (name, value) in container.fields() {
            // binary fields are stored by reference only and never searched
            if matches!(definition.field(name).map(|f| &f.field_type), Some(FieldType::Binary)) {
                continue;
            }
            fields.insert(name.clone(), value.to_json());
        }

        let display_value = definition
            .display_field
            .as_ref()
            .and_then(|name| container.fields().get(name))
            .map(|value| value.to_json())
            .unwrap_or(Value::Null);

        json!({
            "uuid": container.node_uuid().to_string(),
            "language": container.language(),
            "project": {
                "uuid": project.uuid().to_string(),
                "name": project.name(),
            },
            "release": release.uuid().to_string(),
            "schema": {
                "name": definition.name,
                "uuid": version.container_uuid().to_string(),
                "version": version.version(),
            },
            "displayField": display_value,
            "fields": Value::Object(fields),
        })
    }

    /// Builds the search mapping of documents of `definition`.
    pub fn mapping(&self, definition: &SchemaDefinition) -> Value {
        let mut fields = Map::new();
        for field in &definition.fields {
            fields.insert(field.name.clone(), field_mapping(&field.field_type));
        }

        let mut root = Map::new();
        root.insert(
            self.document_type.clone(),
            json!({
                "properties": {
                    "uuid": { "type": "keyword" },
                    "language": { "type": "keyword" },
                    "project": {
                        "properties": {
                            "uuid": { "type": "keyword" },
                            "name": { "type": "keyword" },
                        }
                    },
                    "release": { "type": "keyword" },
                    "schema": {
                        "properties": {
                            "name": { "type": "keyword" },
                            "uuid": { "type": "keyword" },
                            "version": { "type": "long" },
                        }
                    },
                    "displayField": { "type": "text" },
                    "fields": { "properties": Value::Object(fields) },
                }
            }),
        );
        Value::Object(root)
    }
}

fn field_mapping(field_type: &FieldType) -> Value {
    match field_type {
        FieldType::String | FieldType::Html => json!({ "type": "text" }),
        FieldType::Number => json!({ "type": "double" }),
        FieldType::Boolean => json!({ "type": "boolean" }),
        FieldType::Date => json!({ "type": "date" }),
        FieldType::Node => json!({ "type": "keyword" }),
        FieldType::Binary => json!({ "type": "keyword", "index": false }),
        FieldType::List(item) => field_mapping(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContainerType;
    use crate::fields;
    use crate::schema::{FieldSchema, SchemaDefinition};
    use crate::store::MeshStore;
    use chrono::{TimeZone, Utc};

    fn definition() -> SchemaDefinition {
        SchemaDefinition::new("page")
            .with_field(FieldSchema::new("title", FieldType::String))
            .with_field(FieldSchema::new("views", FieldType::Number))
            .with_field(FieldSchema::new("online", FieldType::Boolean))
            .with_field(FieldSchema::new("date", FieldType::Date))
            .with_field(FieldSchema::new("image", FieldType::Binary))
            .with_field(FieldSchema::new("tags", FieldType::list_of(FieldType::String)))
            .with_field(FieldSchema::new("parent", FieldType::Node))
            .display_field("title")
    }

    #[test]
    fn test_mapping_per_field_type() {
        let transformer = DocumentTransformer::new("node");
        let mapping = transformer.mapping(&definition());
        let fields = &mapping["node"]["properties"]["fields"]["properties"];
        assert_eq!(fields["title"]["type"], "text");
        assert_eq!(fields["views"]["type"], "double");
        assert_eq!(fields["online"]["type"], "boolean");
        assert_eq!(fields["date"]["type"], "date");
        assert_eq!(fields["parent"]["type"], "keyword");
        assert_eq!(fields["tags"]["type"], "text");
        assert_eq!(fields["image"]["index"], false);
    }

    #[test]
    fn test_mapping_uses_document_type() {
        let transformer = DocumentTransformer::new("content");
        let mapping = transformer.mapping(&definition());
        assert!(mapping.get("content").is_some());
        assert!(mapping.get("node").is_none());
    }

    #[test]
    fn test_document_shape() {
        let store = MeshStore::new();
        let (project, release) = store.create_project("demo", &["en"]).unwrap();
        let schema = store.create_schema(definition()).unwrap();
        store.assign_schema(&release.uuid(), &schema.uuid(), None).unwrap();
        let parent = uuid::Uuid::new_v4();
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (node, _) = store
            .create_node(
                &project.uuid(),
                &release.uuid(),
                &schema.uuid(),
                "en",
                fields! {
                    "title" => "Hello",
                    "views" => 3,
                    "date" => date,
                    "image" => crate::common::FieldValue::Binary("sha".into()),
                    "parent" => parent,
                },
            )
            .unwrap();

        let document = store.read(|s| {
            let key = crate::content::SlotKey::new(release.uuid(), "en", ContainerType::Draft);
            let container = s.slot_container(&node.uuid(), &key).unwrap();
            let version = s.schema_version(&container.schema_version()).unwrap();
            DocumentTransformer::new("node").document(&project, &release, version, container)
        });

        assert_eq!(document["uuid"], node.uuid().to_string());
        assert_eq!(document["language"], "en");
        assert_eq!(document["project"]["name"], "demo");
        assert_eq!(document["release"], release.uuid().to_string());
        assert_eq!(document["schema"]["name"], "page");
        assert_eq!(document["schema"]["uuid"], schema.uuid().to_string());
        assert_eq!(document["schema"]["version"], 1);
        assert_eq!(document["displayField"], "Hello");
        assert_eq!(document["fields"]["views"], 3.0);
        assert_eq!(document["fields"]["date"], "2024-05-01T12:00:00.000Z");
        assert_eq!(document["fields"]["parent"], parent.to_string());
        assert!(document["fields"].get("image").is_none());
    }
}
