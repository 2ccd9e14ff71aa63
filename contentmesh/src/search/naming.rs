use crate::common::{DOCUMENT_ID_SEPARATOR, INDEX_NAME_PREFIX, INDEX_NAME_SEPARATOR};
use crate::content::ContainerType;
use uuid::Uuid;

/// Composes the name of the index holding the documents of one
/// project/release/schema version/container type partition.
///
/// ```rust
/// use contentmesh::content::ContainerType;
/// use contentmesh::search::compose_index_name;
/// use uuid::Uuid;
///
/// let name = compose_index_name(&Uuid::nil(), &Uuid::nil(), &Uuid::nil(), ContainerType::Draft);
/// assert!(name.starts_with("node-"));
/// assert!(name.ends_with("-draft"));
/// ```
pub fn compose_index_name(
    project: &Uuid,
    release: &Uuid,
    schema_version: &Uuid,
    container_type: ContainerType,
) -> String {
    [
        INDEX_NAME_PREFIX.to_string(),
        project.to_string(),
        release.to_string(),
        schema_version.to_string(),
        container_type.code().to_string(),
    ]
    .join(INDEX_NAME_SEPARATOR)
}

/// Composes the id of the document of `element` in `language`.
pub fn compose_document_id(element: &Uuid, language: &str) -> String {
    format!("{}{}{}", element, DOCUMENT_ID_SEPARATOR, language)
}
