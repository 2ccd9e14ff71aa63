use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A project groups releases, nodes and the languages content may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    uuid: Uuid,
    name: String,
    languages: Vec<String>,
    releases: Vec<Uuid>,
}

impl Project {
    pub(crate) fn new(name: &str, languages: &[&str]) -> Self {
        Project {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            languages: languages.iter().map(|l| l.to_string()).collect(),
            releases: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn has_language(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l == language)
    }

    /// Releases in creation order.
    pub fn releases(&self) -> &[Uuid] {
        &self.releases
    }

    pub fn latest_release(&self) -> Option<Uuid> {
        self.releases.last().copied()
    }

    pub(crate) fn add_release(&mut self, release: Uuid) {
        self.releases.push(release);
    }
}

/// A named content branch. Pins every schema container it uses to one
/// schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    uuid: Uuid,
    project_uuid: Uuid,
    name: String,
    created: DateTime<Utc>,
    schema_versions: BTreeMap<Uuid, Uuid>,
}

impl Release {
    pub(crate) fn new(project_uuid: Uuid, name: &str) -> Self {
        Release {
            uuid: Uuid::new_v4(),
            project_uuid,
            name: name.to_string(),
            created: Utc::now(),
            schema_versions: BTreeMap::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn project_uuid(&self) -> Uuid {
        self.project_uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Version assigned to the given schema container, if any.
    pub fn schema_version(&self, container: &Uuid) -> Option<Uuid> {
        self.schema_versions.get(container).copied()
    }

    /// Assignments as (schema container, schema version), ordered by container.
    pub fn schema_versions(&self) -> &BTreeMap<Uuid, Uuid> {
        &self.schema_versions
    }

    pub fn references_version(&self, version: &Uuid) -> bool {
        self.schema_versions.values().any(|v| v == version)
    }

    pub(crate) fn assign(&mut self, container: Uuid, version: Uuid) -> Option<Uuid> {
        self.schema_versions.insert(container, version)
    }

    pub(crate) fn inherit_assignments(&mut self, other: &Release) {
        self.schema_versions = other.schema_versions.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_languages_and_releases() {
        let mut project = Project::new("demo", &["en", "de"]);
        assert!(project.has_language("de"));
        assert!(!project.has_language("fr"));
        assert!(project.latest_release().is_none());

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        project.add_release(first);
        project.add_release(second);
        assert_eq!(project.releases(), &[first, second]);
        assert_eq!(project.latest_release(), Some(second));
    }

    #[test]
    fn test_release_assignment() {
        let mut release = Release::new(Uuid::new_v4(), "main");
        let container = Uuid::new_v4();
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();

        assert_eq!(release.assign(container, v1), None);
        assert_eq!(release.assign(container, v2), Some(v1));
        assert_eq!(release.schema_version(&container), Some(v2));
        assert!(release.references_version(&v2));
        assert!(!release.references_version(&v1));

        let mut next = Release::new(release.project_uuid(), "next");
        next.inherit_assignments(&release);
        assert_eq!(next.schema_version(&container), Some(v2));
    }
}
