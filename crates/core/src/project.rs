//! Project and Feature records.
//!
//! A Project is a directory on disk managed by the server; it owns an
//! ordered list of Features. Features reference their project by id only
//! (never a back-pointer) and carry the per-phase artifact payloads keyed by
//! phase, in submission order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Onboarding,
    Active,
    Archived,
    Error,
    ReadOnly,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            ProjectStatus::Onboarding => "ONBOARDING",
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::Archived => "ARCHIVED",
            ProjectStatus::Error => "ERROR",
            ProjectStatus::ReadOnly => "READ_ONLY",
        };
        f.write_str(token)
    }
}

/// Lifecycle status of a feature, mirroring its workflow phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Defining,
    Decomposing,
    Designing,
    Implementing,
    Testing,
    Reviewing,
    Completed,
    Failed,
}

impl FeatureStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeatureStatus::Completed | FeatureStatus::Failed)
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            FeatureStatus::Defining => "DEFINING",
            FeatureStatus::Decomposing => "DECOMPOSING",
            FeatureStatus::Designing => "DESIGNING",
            FeatureStatus::Implementing => "IMPLEMENTING",
            FeatureStatus::Testing => "TESTING",
            FeatureStatus::Reviewing => "REVIEWING",
            FeatureStatus::Completed => "COMPLETED",
            FeatureStatus::Failed => "FAILED",
        };
        f.write_str(token)
    }
}

/// A multi-phase unit of work within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub project_id: String,
    /// The originating user prompt.
    pub prompt: String,
    pub status: FeatureStatus,
    /// Key of the phase currently awaiting submission.
    pub current_phase: String,
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Phase key -> submitted payload, in submission order.
    pub artifacts: serde_json::Map<String, serde_json::Value>,
}

impl Feature {
    /// Create a feature at the start of its workflow.
    pub fn new(
        project_id: impl Into<String>,
        prompt: impl Into<String>,
        workflow_type: impl Into<String>,
        first_phase: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            prompt: prompt.into(),
            status: FeatureStatus::Defining,
            current_phase: first_phase.into(),
            workflow_type: workflow_type.into(),
            created_at: now,
            updated_at: now,
            artifacts: serde_json::Map::new(),
        }
    }
}

/// A directory on disk managed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable id, generated once at registration.
    pub id: String,
    pub name: String,
    /// Absolute path to the project directory.
    pub path: PathBuf,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Features, in creation order.
    pub features: Vec<Feature>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Project {
    /// Register a new ACTIVE project at an absolute path.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
            status: ProjectStatus::Active,
            created_at: now,
            updated_at: now,
            features: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Find a feature by id.
    pub fn feature(&self, feature_id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == feature_id)
    }

    /// Find a feature by id, mutably.
    pub fn feature_mut(&mut self, feature_id: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.id == feature_id)
    }

    /// A project recovered from an unreadable state file: status ERROR plus
    /// whatever fields the loader could salvage.
    pub fn recovered(path: &Path, salvaged: Option<serde_json::Value>) -> Self {
        let now = Utc::now();
        let salvage_str = |key: &str| -> Option<String> {
            salvaged
                .as_ref()
                .and_then(|v| v.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        Self {
            id: salvage_str("id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: salvage_str("name").unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unknown".to_string())
            }),
            path: path.to_path_buf(),
            status: ProjectStatus::Error,
            created_at: now,
            updated_at: now,
            features: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_tokens() {
        assert_eq!(
            serde_json::to_string(&ProjectStatus::ReadOnly).unwrap(),
            "\"READ_ONLY\""
        );
        assert_eq!(
            serde_json::to_string(&FeatureStatus::Decomposing).unwrap(),
            "\"DECOMPOSING\""
        );
        assert_eq!(format!("{}", ProjectStatus::ReadOnly), "READ_ONLY");
    }

    #[test]
    fn test_feature_terminal_statuses() {
        assert!(FeatureStatus::Completed.is_terminal());
        assert!(FeatureStatus::Failed.is_terminal());
        assert!(!FeatureStatus::Reviewing.is_terminal());
    }

    #[test]
    fn test_new_project_is_active_with_fresh_id() {
        let a = Project::new("demo", "/tmp/demo");
        let b = Project::new("demo", "/tmp/demo");
        assert_eq!(a.status, ProjectStatus::Active);
        assert_ne!(a.id, b.id);
        assert!(a.features.is_empty());
    }

    #[test]
    fn test_feature_lookup() {
        let mut project = Project::new("demo", "/tmp/demo");
        let feature = Feature::new(&project.id, "add auth", "feature_development", "define");
        let feature_id = feature.id.clone();
        project.features.push(feature);

        assert!(project.feature(&feature_id).is_some());
        assert!(project.feature("missing").is_none());
        project.feature_mut(&feature_id).unwrap().prompt = "changed".into();
        assert_eq!(project.feature(&feature_id).unwrap().prompt, "changed");
    }

    #[test]
    fn test_serialization_shape() {
        let mut project = Project::new("demo", "/tmp/demo");
        project
            .features
            .push(Feature::new(&project.id, "add auth", "feature_development", "define"));

        let json = serde_json::to_value(&project).unwrap();
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["features"][0]["current_phase"], "define");
        assert_eq!(json["features"][0]["status"], "DEFINING");
        // RFC 3339 timestamps.
        assert!(json["created_at"].as_str().unwrap().contains('T'));

        let roundtrip: Project = serde_json::from_value(json).unwrap();
        assert_eq!(roundtrip.id, project.id);
        assert_eq!(roundtrip.features.len(), 1);
    }

    #[test]
    fn test_recovered_salvages_fields() {
        let salvaged = serde_json::json!({"id": "p-1", "name": "demo"});
        let project = Project::recovered(Path::new("/tmp/demo"), Some(salvaged));
        assert_eq!(project.id, "p-1");
        assert_eq!(project.name, "demo");
        assert_eq!(project.status, ProjectStatus::Error);
    }

    #[test]
    fn test_recovered_without_salvage_uses_directory_name() {
        let project = Project::recovered(Path::new("/tmp/demo"), None);
        assert_eq!(project.name, "demo");
        assert_eq!(project.status, ProjectStatus::Error);
    }
}
