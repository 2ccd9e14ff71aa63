// search document constants
pub const DEFAULT_DOCUMENT_TYPE: &str = "node";
pub const INDEX_NAME_PREFIX: &str = "node";
pub const INDEX_NAME_SEPARATOR: &str = "-";
pub const DOCUMENT_ID_SEPARATOR: &str = "-";

// change property keys
pub const PROP_FIELD: &str = "field";
pub const PROP_TYPE: &str = "type";
pub const PROP_OLD_TYPE: &str = "oldType";
pub const PROP_NEW_TYPE: &str = "newType";
pub const PROP_LABEL: &str = "label";
pub const PROP_REQUIRED: &str = "required";
pub const PROP_DEFAULT: &str = "default";
pub const PROP_AFTER: &str = "after";
pub const PROP_NAME: &str = "name";
pub const PROP_DISPLAY_FIELD: &str = "displayField";
pub const PROP_SEGMENT_FIELD: &str = "segmentField";
pub const PROP_CONTAINER: &str = "container";
pub const PROP_ORDER: &str = "order";

// event constants
pub const MUTATION_EVENT: &str = "mesh_mutation_event";

// schema constants
pub const INITIAL_SCHEMA_VERSION: u32 = 1;
pub const FIELD_NAME_PATTERN: &str = "^[A-Za-z][A-Za-z0-9_]*$";

// migration defaults
pub const MIGRATION_COMMIT_ATTEMPTS: u32 = 5;

// sync queue defaults
pub const DEFAULT_SYNC_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SYNC_BACKOFF_BASE_MS: u64 = 100;
pub const DEFAULT_SYNC_BACKOFF_MAX_MS: u64 = 10_000;
pub const DEFAULT_SYNC_ATTEMPT_TIMEOUT_MS: u64 = 5_000;
