//! The feature workflow engine.
//!
//! A workflow is an ordered list of phases; each phase names the artifact
//! keys (and value shapes) a submission must carry and the feature status
//! the phase maps to. The engine drives features through their workflow:
//! `start_feature` creates a feature at the first phase, `submit_phase`
//! validates and stores the phase artifacts and advances to the next phase,
//! completing the feature at the terminal phase. All transitions are
//! serialized per project through the state store's per-project lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::project::{Feature, FeatureStatus};
use crate::state_store::ProjectStore;

/// Name of the built-in full feature workflow.
pub const FEATURE_WORKFLOW: &str = "feature_development";

/// Permitted shape of an artifact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    String,
    Array,
    Object,
    Bool,
    Number,
    Any,
}

impl ValueShape {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ValueShape::String => value.is_string(),
            ValueShape::Array => value.is_array(),
            ValueShape::Object => value.is_object(),
            ValueShape::Bool => value.is_boolean(),
            ValueShape::Number => value.is_number(),
            ValueShape::Any => true,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ValueShape::String => "a string",
            ValueShape::Array => "an array",
            ValueShape::Object => "an object",
            ValueShape::Bool => "a boolean",
            ValueShape::Number => "a number",
            ValueShape::Any => "any value",
        }
    }
}

/// One phase of a workflow.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    /// Phase key (also the artifact map key).
    pub key: &'static str,
    /// Required artifact keys and their permitted shapes.
    pub required: &'static [(&'static str, ValueShape)],
    /// Feature status while this phase is current. `None` preserves the
    /// feature's previous status.
    pub status: Option<FeatureStatus>,
    /// Prompt template; `{prompt}` is replaced with the originating prompt.
    pub prompt_template: &'static str,
}

/// An ordered list of phases; the last phase is terminal.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

impl WorkflowDefinition {
    /// The built-in six-phase feature workflow.
    pub fn feature_development() -> Self {
        Self {
            name: FEATURE_WORKFLOW.to_string(),
            phases: vec![
                PhaseSpec {
                    key: "define",
                    required: &[("specification", ValueShape::String)],
                    status: Some(FeatureStatus::Defining),
                    prompt_template: "Write a precise specification for this feature request: {prompt}",
                },
                PhaseSpec {
                    key: "decompose",
                    required: &[("tasks", ValueShape::Array)],
                    status: Some(FeatureStatus::Decomposing),
                    prompt_template: "Break the specified feature into ordered implementation tasks: {prompt}",
                },
                PhaseSpec {
                    key: "design",
                    required: &[("architecture", ValueShape::String)],
                    status: Some(FeatureStatus::Designing),
                    prompt_template: "Design the architecture for: {prompt}",
                },
                PhaseSpec {
                    key: "implement",
                    required: &[
                        ("files_changed", ValueShape::Array),
                        ("summary", ValueShape::String),
                    ],
                    status: Some(FeatureStatus::Implementing),
                    prompt_template: "Implement the designed feature: {prompt}",
                },
                PhaseSpec {
                    key: "test",
                    required: &[("test_results", ValueShape::Object)],
                    status: Some(FeatureStatus::Testing),
                    prompt_template: "Write and run tests for the implemented feature: {prompt}",
                },
                PhaseSpec {
                    key: "review",
                    required: &[("approved", ValueShape::Bool)],
                    status: Some(FeatureStatus::Reviewing),
                    prompt_template: "Review the implementation and tests for: {prompt}",
                },
            ],
        }
    }

    /// First phase of the workflow.
    pub fn first_phase(&self) -> &PhaseSpec {
        &self.phases[0]
    }

    /// Look up a phase by key.
    pub fn phase(&self, key: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.key == key)
    }

    /// The phase after `key`, or `None` when `key` is terminal.
    pub fn next_phase(&self, key: &str) -> Option<&PhaseSpec> {
        let position = self.phases.iter().position(|p| p.key == key)?;
        self.phases.get(position + 1)
    }

    /// Ordered phase keys.
    pub fn phase_keys(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.key).collect()
    }
}

/// Named workflows available to `start_feature`.
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowDefinition>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        let mut workflows = HashMap::new();
        let feature = WorkflowDefinition::feature_development();
        workflows.insert(feature.name.clone(), feature);
        Self { workflows }
    }
}

impl WorkflowRegistry {
    /// Registry with the built-in workflows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a workflow definition.
    pub fn insert(&mut self, workflow: WorkflowDefinition) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }

    /// Look up a workflow by name.
    pub fn get(&self, name: &str) -> Result<&WorkflowDefinition> {
        self.workflows
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unknown workflow '{name}'")))
    }
}

/// Result of starting a feature.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartedFeature {
    pub feature_id: String,
    pub phase: String,
    pub rendered_prompt: String,
}

/// Result of submitting phase artifacts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PhaseAdvance {
    /// `success` when the feature advanced, `completed` at the terminal phase.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_prompt: Option<String>,
}

/// Drives features through their workflow phases.
pub struct WorkflowEngine {
    store: Arc<ProjectStore>,
    registry: WorkflowRegistry,
}

impl WorkflowEngine {
    /// Create an engine over the given store with the built-in workflows.
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
        }
    }

    /// Create an engine with a custom workflow registry.
    pub fn with_registry(store: Arc<ProjectStore>, registry: WorkflowRegistry) -> Self {
        Self { store, registry }
    }

    /// Start a feature on an ACTIVE project.
    pub async fn start_feature(
        &self,
        project_path: &Path,
        prompt: &str,
        workflow_type: Option<&str>,
    ) -> Result<StartedFeature> {
        let workflow = self.registry.get(workflow_type.unwrap_or(FEATURE_WORKFLOW))?;
        let first = workflow.first_phase();
        let workflow_name = workflow.name.clone();
        let first_key = first.key;
        let first_status = first.status;
        let rendered_prompt = render(first.prompt_template, prompt);

        let feature_id = self
            .store
            .update(project_path, |project| {
                if project.status != crate::project::ProjectStatus::Active {
                    return Err(Error::InvalidProjectState(format!(
                        "project '{}' is {}, features require ACTIVE",
                        project.id, project.status
                    )));
                }
                let mut feature = Feature::new(&project.id, prompt, &workflow_name, first_key);
                if let Some(status) = first_status {
                    feature.status = status;
                }
                let id = feature.id.clone();
                project.features.push(feature);
                Ok(id)
            })
            .await?;

        info!(feature_id = %feature_id, phase = first_key, "feature started");
        Ok(StartedFeature {
            feature_id,
            phase: first_key.to_string(),
            rendered_prompt,
        })
    }

    /// Submit artifacts for a feature's current phase.
    ///
    /// Validates the phase (mismatch ⇒ [`Error::PhaseMismatch`]), the
    /// artifact shapes (⇒ [`Error::ArtifactValidation`]), and terminal state
    /// (⇒ [`Error::TerminalState`]); on success the artifacts are appended
    /// under the phase key and the feature advances, completing when the
    /// submitted phase was terminal.
    pub async fn submit_phase(
        &self,
        project_path: &Path,
        feature_id: &str,
        phase_key: &str,
        artifacts: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PhaseAdvance> {
        let registry = &self.registry;
        let advance = self
            .store
            .update(project_path, |project| {
                let feature = project
                    .feature_mut(feature_id)
                    .ok_or_else(|| Error::NotFound(format!("feature '{feature_id}'")))?;

                if feature.status.is_terminal() {
                    return Err(Error::TerminalState(format!(
                        "feature '{feature_id}' is already {}",
                        feature.status
                    )));
                }
                if feature.current_phase != phase_key {
                    return Err(Error::PhaseMismatch {
                        submitted: phase_key.to_string(),
                        current: feature.current_phase.clone(),
                    });
                }

                let workflow = registry.get(&feature.workflow_type)?;
                let phase = workflow.phase(phase_key).ok_or_else(|| {
                    Error::Validation(format!(
                        "phase '{phase_key}' is not part of workflow '{}'",
                        workflow.name
                    ))
                })?;
                validate_artifacts(phase, &artifacts)?;

                feature
                    .artifacts
                    .insert(phase_key.to_string(), serde_json::Value::Object(artifacts));
                feature.updated_at = chrono::Utc::now();

                match workflow.next_phase(phase_key) {
                    Some(next) => {
                        feature.current_phase = next.key.to_string();
                        // A phase with no status mapping preserves the
                        // feature's previous status.
                        if let Some(status) = next.status {
                            feature.status = status;
                        }
                        Ok(PhaseAdvance {
                            status: "success".to_string(),
                            next_phase: Some(next.key.to_string()),
                            rendered_prompt: Some(render(next.prompt_template, &feature.prompt)),
                        })
                    }
                    None => {
                        feature.status = FeatureStatus::Completed;
                        Ok(PhaseAdvance {
                            status: "completed".to_string(),
                            next_phase: None,
                            rendered_prompt: None,
                        })
                    }
                }
            })
            .await?;

        info!(
            feature_id,
            phase = phase_key,
            outcome = %advance.status,
            "phase submitted"
        );
        Ok(advance)
    }
}

fn render(template: &str, prompt: &str) -> String {
    template.replace("{prompt}", prompt)
}

fn validate_artifacts(
    phase: &PhaseSpec,
    artifacts: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    for (key, shape) in phase.required {
        match artifacts.get(*key) {
            None => {
                return Err(Error::ArtifactValidation(format!(
                    "phase '{}' requires artifact key '{key}'",
                    phase.key
                )));
            }
            Some(value) if !shape.matches(value) => {
                return Err(Error::ArtifactValidation(format!(
                    "artifact '{key}' for phase '{}' must be {}",
                    phase.key,
                    shape.describe()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectStatus;
    use pretty_assertions::assert_eq;

    async fn engine_with_project() -> (tempfile::TempDir, WorkflowEngine, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        let store = Arc::new(
            ProjectStore::open(dir.path().join("registry"))
                .await
                .unwrap(),
        );
        store
            .register(Some("proj".into()), &project_dir)
            .await
            .unwrap();
        let engine = WorkflowEngine::new(Arc::clone(&store));
        (dir, engine, project_dir)
    }

    fn artifacts(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_canonical_workflow_order() {
        let workflow = WorkflowDefinition::feature_development();
        assert_eq!(
            workflow.phase_keys(),
            vec!["define", "decompose", "design", "implement", "test", "review"]
        );
        assert!(workflow.next_phase("review").is_none());
        assert_eq!(workflow.next_phase("define").unwrap().key, "decompose");
    }

    #[tokio::test]
    async fn test_start_feature_at_first_phase() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine
            .start_feature(&path, "add auth", None)
            .await
            .unwrap();
        assert_eq!(started.phase, "define");
        assert!(started.rendered_prompt.contains("add auth"));
    }

    #[tokio::test]
    async fn test_start_feature_requires_active_project() {
        let (_dir, engine, path) = engine_with_project().await;
        engine
            .store
            .update(&path, |project| {
                project.status = ProjectStatus::Archived;
                Ok(())
            })
            .await
            .unwrap();

        let err = engine
            .start_feature(&path, "add auth", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidProjectState");
    }

    #[tokio::test]
    async fn test_start_feature_unknown_workflow() {
        let (_dir, engine, path) = engine_with_project().await;
        let err = engine
            .start_feature(&path, "add auth", Some("not_a_workflow"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[tokio::test]
    async fn test_submit_advances_through_phases() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine.start_feature(&path, "add auth", None).await.unwrap();
        let id = started.feature_id;

        let advance = engine
            .submit_phase(&path, &id, "define", artifacts(&[("specification", serde_json::json!("X"))]))
            .await
            .unwrap();
        assert_eq!(advance.status, "success");
        assert_eq!(advance.next_phase.as_deref(), Some("decompose"));
        assert!(advance.rendered_prompt.unwrap().contains("add auth"));

        let advance = engine
            .submit_phase(&path, &id, "decompose", artifacts(&[("tasks", serde_json::json!(["t1"]))]))
            .await
            .unwrap();
        assert_eq!(advance.next_phase.as_deref(), Some("design"));
    }

    #[tokio::test]
    async fn test_full_run_completes_feature() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine.start_feature(&path, "add auth", None).await.unwrap();
        let id = started.feature_id;

        let submissions: Vec<(&str, serde_json::Map<String, serde_json::Value>)> = vec![
            ("define", artifacts(&[("specification", serde_json::json!("spec"))])),
            ("decompose", artifacts(&[("tasks", serde_json::json!(["a", "b"]))])),
            ("design", artifacts(&[("architecture", serde_json::json!("hexagonal"))])),
            (
                "implement",
                artifacts(&[
                    ("files_changed", serde_json::json!(["src/auth.rs"])),
                    ("summary", serde_json::json!("added auth")),
                ]),
            ),
            ("test", artifacts(&[("test_results", serde_json::json!({"passed": 12}))])),
            ("review", artifacts(&[("approved", serde_json::json!(true))])),
        ];

        let mut last = None;
        for (phase, payload) in submissions {
            last = Some(engine.submit_phase(&path, &id, phase, payload).await.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.status, "completed");
        assert!(last.next_phase.is_none());

        let project = engine.store.get_by_path(&path).await.unwrap();
        let feature = project.feature(&id).unwrap();
        assert_eq!(feature.status, FeatureStatus::Completed);
        // Artifact keys are a prefix of (here: exactly) the phase order.
        let keys: Vec<&str> = feature.artifacts.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["define", "decompose", "design", "implement", "test", "review"]);
    }

    #[tokio::test]
    async fn test_resubmission_after_commit_is_phase_mismatch() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine.start_feature(&path, "add auth", None).await.unwrap();
        let id = started.feature_id;
        let payload = artifacts(&[("specification", serde_json::json!("X"))]);

        engine
            .submit_phase(&path, &id, "define", payload.clone())
            .await
            .unwrap();
        let err = engine
            .submit_phase(&path, &id, "define", payload)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PhaseMismatch");

        // State unchanged by the rejected resubmission.
        let project = engine.store.get_by_path(&path).await.unwrap();
        let feature = project.feature(&id).unwrap();
        assert_eq!(feature.current_phase, "decompose");
        assert_eq!(feature.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_key_rejected() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine.start_feature(&path, "add auth", None).await.unwrap();

        let err = engine
            .submit_phase(&path, &started.feature_id, "define", artifacts(&[]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ArtifactValidation");
    }

    #[tokio::test]
    async fn test_wrong_shape_rejected() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine.start_feature(&path, "add auth", None).await.unwrap();

        let err = engine
            .submit_phase(
                &path,
                &started.feature_id,
                "define",
                artifacts(&[("specification", serde_json::json!(42))]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ArtifactValidation");
    }

    #[tokio::test]
    async fn test_submit_to_completed_feature_is_terminal_state() {
        let (_dir, engine, path) = engine_with_project().await;
        let started = engine.start_feature(&path, "quick", Some(FEATURE_WORKFLOW)).await.unwrap();
        let id = started.feature_id;

        for (phase, payload) in [
            ("define", artifacts(&[("specification", serde_json::json!("s"))])),
            ("decompose", artifacts(&[("tasks", serde_json::json!([]))])),
            ("design", artifacts(&[("architecture", serde_json::json!("a"))])),
            (
                "implement",
                artifacts(&[
                    ("files_changed", serde_json::json!([])),
                    ("summary", serde_json::json!("s")),
                ]),
            ),
            ("test", artifacts(&[("test_results", serde_json::json!({}))])),
            ("review", artifacts(&[("approved", serde_json::json!(true))])),
        ] {
            engine.submit_phase(&path, &id, phase, payload).await.unwrap();
        }

        let err = engine
            .submit_phase(&path, &id, "review", artifacts(&[("approved", serde_json::json!(true))]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TerminalState");
    }

    #[tokio::test]
    async fn test_unknown_feature_not_found() {
        let (_dir, engine, path) = engine_with_project().await;
        let err = engine
            .submit_phase(&path, "missing", "define", artifacts(&[]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_shorter_custom_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        let store = Arc::new(ProjectStore::open(dir.path().join("registry")).await.unwrap());
        store.register(None, &project_dir).await.unwrap();

        let mut registry = WorkflowRegistry::new();
        registry.insert(WorkflowDefinition {
            name: "hotfix".to_string(),
            phases: vec![
                PhaseSpec {
                    key: "implement",
                    required: &[("summary", ValueShape::String)],
                    status: Some(FeatureStatus::Implementing),
                    prompt_template: "Fix: {prompt}",
                },
                PhaseSpec {
                    key: "review",
                    required: &[("approved", ValueShape::Bool)],
                    status: None, // preserves IMPLEMENTING
                    prompt_template: "Review the fix: {prompt}",
                },
            ],
        });
        let engine = WorkflowEngine::with_registry(store, registry);

        let started = engine
            .start_feature(&project_dir, "crash on start", Some("hotfix"))
            .await
            .unwrap();
        let advance = engine
            .submit_phase(
                &project_dir,
                &started.feature_id,
                "implement",
                artifacts(&[("summary", serde_json::json!("fixed"))]),
            )
            .await
            .unwrap();
        assert_eq!(advance.next_phase.as_deref(), Some("review"));

        // The review phase has no status mapping: status stays IMPLEMENTING.
        let project = engine.store.get_by_path(&project_dir).await.unwrap();
        let feature = project.feature(&started.feature_id).unwrap();
        assert_eq!(feature.status, FeatureStatus::Implementing);

        let done = engine
            .submit_phase(
                &project_dir,
                &started.feature_id,
                "review",
                artifacts(&[("approved", serde_json::json!(true))]),
            )
            .await
            .unwrap();
        assert_eq!(done.status, "completed");
    }
}
