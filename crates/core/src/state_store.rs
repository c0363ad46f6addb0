//! Per-project state persistence.
//!
//! One JSON state file per project at `<project_path>/.state/state.json`,
//! plus an index file at `<root>/index.json` mapping absolute project path
//! to project id. Saves write a temp file in the same directory and rename
//! over the target; an I/O failure flips the in-memory project to READ_ONLY
//! (reads keep working, mutation is refused) and surfaces the error. A
//! malformed state file loads as an ERROR project with whatever fields the
//! loader could salvage, and is never written back to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::project::{Project, ProjectStatus};

/// Directory under the project path holding orchestrator state.
pub const STATE_DIR: &str = ".state";
/// State file name.
pub const STATE_FILE: &str = "state.json";
/// Index file name under the store root.
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PathIndex {
    /// Absolute project path -> project id.
    projects: HashMap<PathBuf, String>,
}

/// Store owning Projects (and their Features) on disk.
pub struct ProjectStore {
    root: PathBuf,
    index: Mutex<PathIndex>,
    cache: Mutex<HashMap<String, Project>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectStore {
    /// Open a store rooted at `root` (created on first save), loading the
    /// path index if present. A malformed index is logged and rebuilt empty;
    /// project state files remain untouched and re-indexable.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let index_path = root.join(INDEX_FILE);
        let index = match tokio::fs::read(&index_path).await {
            Ok(bytes) => match serde_json::from_slice::<PathIndex>(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    warn!(path = %index_path.display(), error = %e, "project index malformed; rebuilding");
                    PathIndex::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PathIndex::default(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Register a project (idempotent by path).
    ///
    /// Re-registering a known path returns the existing record. The path
    /// must be absolute and exist on disk.
    pub async fn register(&self, name: Option<String>, path: impl Into<PathBuf>) -> Result<Project> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(Error::Validation(format!(
                "project path must be absolute, got '{}'",
                path.display()
            )));
        }
        if !path.is_dir() {
            return Err(Error::Validation(format!(
                "project path '{}' is not a directory",
                path.display()
            )));
        }

        if let Ok(existing) = self.get_by_path(&path).await {
            return Ok(existing);
        }

        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        });
        let project = Project::new(name, &path);
        info!(project_id = %project.id, path = %path.display(), "registering project");
        self.save(project.clone()).await?;
        Ok(project)
    }

    /// Look up a project by its directory path.
    ///
    /// Falls back to adopting an existing state file that is not yet in the
    /// index (e.g. after an index rebuild).
    pub async fn get_by_path(&self, path: impl AsRef<Path>) -> Result<Project> {
        let path = path.as_ref();
        let indexed_id = self.index.lock().await.projects.get(path).cloned();
        if let Some(id) = indexed_id {
            return self.get_by_id(&id).await;
        }

        let state_path = state_file_path(path);
        if !state_path.exists() {
            return Err(Error::NotFound(format!(
                "no project registered at '{}'",
                path.display()
            )));
        }
        let project = self.load_from_disk(path).await;
        self.adopt(&project).await?;
        Ok(project)
    }

    /// Look up a project by id.
    pub async fn get_by_id(&self, id: &str) -> Result<Project> {
        if let Some(project) = self.cache.lock().await.get(id) {
            return Ok(project.clone());
        }

        let path = {
            let index = self.index.lock().await;
            index
                .projects
                .iter()
                .find(|(_, indexed_id)| indexed_id.as_str() == id)
                .map(|(path, _)| path.clone())
        };
        let Some(path) = path else {
            return Err(Error::NotFound(format!("project '{id}'")));
        };

        let project = self.load_from_disk(&path).await;
        self.cache
            .lock()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(project)
    }

    /// All known projects.
    pub async fn list_all(&self) -> Vec<Project> {
        let paths: Vec<PathBuf> = {
            let index = self.index.lock().await;
            index.projects.keys().cloned().collect()
        };
        let mut projects = Vec::with_capacity(paths.len());
        for path in paths {
            if let Ok(project) = self.get_by_path(&path).await {
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        projects
    }

    /// Persist a project.
    ///
    /// Last-writer-wins per project file; the write is temp-file plus atomic
    /// rename. On I/O failure the in-memory view degrades to READ_ONLY and
    /// the error is surfaced.
    pub async fn save(&self, mut project: Project) -> Result<()> {
        let lock = self.project_lock(&project.id).await;
        let _guard = lock.lock().await;

        project.updated_at = Utc::now();
        match self.write_state_file(&project).await {
            Ok(()) => {
                self.adopt(&project).await?;
                Ok(())
            }
            Err(e) => {
                warn!(
                    project_id = %project.id,
                    error = %e,
                    "state persistence failed; degrading project to read-only"
                );
                project.status = ProjectStatus::ReadOnly;
                self.cache
                    .lock()
                    .await
                    .insert(project.id.clone(), project);
                Err(Error::Persistence(e.to_string()))
            }
        }
    }

    /// Load, mutate, and save a project atomically with respect to other
    /// in-process writers.
    ///
    /// The mutator runs under the per-project lock; a READ_ONLY project
    /// refuses mutation before the mutator is invoked.
    pub async fn update<T>(
        &self,
        path: impl AsRef<Path>,
        mutate: impl FnOnce(&mut Project) -> Result<T>,
    ) -> Result<T> {
        let project_id = self.get_by_path(path.as_ref()).await?.id;
        let lock = self.project_lock(&project_id).await;
        let _guard = lock.lock().await;

        // Reload under the lock so concurrent in-process writers serialize
        // on a consistent view instead of overwriting each other.
        let mut project = self.get_by_id(&project_id).await?;
        if project.status == ProjectStatus::ReadOnly {
            return Err(Error::ReadOnly(format!(
                "project '{}' is read-only after a persistence failure",
                project.id
            )));
        }

        let value = mutate(&mut project)?;
        project.updated_at = Utc::now();
        match self.write_state_file(&project).await {
            Ok(()) => {
                self.adopt(&project).await?;
                Ok(value)
            }
            Err(e) => {
                project.status = ProjectStatus::ReadOnly;
                self.cache
                    .lock()
                    .await
                    .insert(project.id.clone(), project);
                Err(Error::Persistence(e.to_string()))
            }
        }
    }

    /// Delete a project's state file and index entry.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let project = self.get_by_id(id).await?;
        let state_path = state_file_path(&project.path);
        match tokio::fs::remove_file(&state_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        {
            let mut index = self.index.lock().await;
            index.projects.retain(|_, indexed_id| indexed_id != id);
            self.write_index(&index).await?;
        }
        self.cache.lock().await.remove(id);
        info!(project_id = %id, "deleted project state");
        Ok(())
    }

    async fn load_from_disk(&self, path: &Path) -> Project {
        let state_path = state_file_path(path);
        match tokio::fs::read(&state_path).await {
            Ok(bytes) => match serde_json::from_slice::<Project>(&bytes) {
                Ok(project) => project,
                Err(e) => {
                    warn!(
                        path = %state_path.display(),
                        error = %e,
                        "state file malformed; surfacing project as ERROR"
                    );
                    let salvaged = serde_json::from_slice::<serde_json::Value>(&bytes).ok();
                    Project::recovered(path, salvaged)
                }
            },
            Err(e) => {
                warn!(path = %state_path.display(), error = %e, "state file unreadable");
                Project::recovered(path, None)
            }
        }
    }

    /// Record the project in the cache and (persistently) in the index.
    async fn adopt(&self, project: &Project) -> Result<()> {
        self.cache
            .lock()
            .await
            .insert(project.id.clone(), project.clone());
        let mut index = self.index.lock().await;
        let current = index.projects.get(&project.path);
        if current.map(String::as_str) != Some(project.id.as_str()) {
            index
                .projects
                .insert(project.path.clone(), project.id.clone());
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn write_state_file(&self, project: &Project) -> std::io::Result<()> {
        let state_dir = project.path.join(STATE_DIR);
        tokio::fs::create_dir_all(&state_dir).await?;
        let target = state_dir.join(STATE_FILE);
        let tmp = state_dir.join(format!("{STATE_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(project)
            .map_err(|e| std::io::Error::other(format!("serialize project state: {e}")))?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn write_index(&self, index: &PathIndex) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let target = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(index)?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn project_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

fn state_file_path(project_path: &Path) -> PathBuf {
    project_path.join(STATE_DIR).join(STATE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Feature, FeatureStatus};
    use pretty_assertions::assert_eq;

    async fn store_with_project() -> (tempfile::TempDir, ProjectStore, Project) {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        let store = ProjectStore::open(dir.path().join("registry")).await.unwrap();
        let project = store
            .register(Some("proj".into()), &project_dir)
            .await
            .unwrap();
        (dir, store, project)
    }

    #[tokio::test]
    async fn test_register_creates_state_file() {
        let (_dir, _store, project) = store_with_project().await;
        let state_path = state_file_path(&project.path);
        assert!(state_path.exists());
        assert_eq!(project.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (_dir, store, project) = store_with_project().await;
        let again = store
            .register(Some("renamed".into()), &project.path)
            .await
            .unwrap();
        assert_eq!(again.id, project.id);
        assert_eq!(again.name, "proj");
    }

    #[tokio::test]
    async fn test_register_rejects_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        let err = store
            .register(None, "relative/path")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[tokio::test]
    async fn test_register_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        let err = store
            .register(None, dir.path().join("does-not-exist"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (_dir, store, mut project) = store_with_project().await;
        let feature = Feature::new(&project.id, "add auth", "feature_development", "define");
        let feature_id = feature.id.clone();
        project.features.push(feature);
        let mut metadata = serde_json::Map::new();
        metadata.insert("language".into(), serde_json::json!("rust"));
        project.metadata = metadata;
        store.save(project.clone()).await.unwrap();

        // A fresh store sees only what the disk holds.
        let reopened = ProjectStore::open(store.root.clone()).await.unwrap();
        let loaded = reopened.get_by_path(&project.path).await.unwrap();
        assert_eq!(loaded.id, project.id);
        assert_eq!(loaded.features.len(), 1);
        assert_eq!(loaded.feature(&feature_id).unwrap().prompt, "add auth");
        assert_eq!(loaded.metadata["language"], "rust");
        assert_eq!(loaded.feature(&feature_id).unwrap().status, FeatureStatus::Defining);
    }

    #[tokio::test]
    async fn test_get_by_id_and_list_all() {
        let (_dir, store, project) = store_with_project().await;
        let by_id = store.get_by_id(&project.id).await.unwrap();
        assert_eq!(by_id.path, project.path);

        let all = store.list_all().await;
        assert_eq!(all.len(), 1);

        let err = store.get_by_id("missing").await.unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_get_by_path_unregistered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        let err = store.get_by_path(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_malformed_state_surfaces_error_project() {
        let (_dir, store, project) = store_with_project().await;
        let state_path = state_file_path(&project.path);
        std::fs::write(&state_path, br#"{"id": "p-99", "name": "broken", "#).unwrap();

        let reopened = ProjectStore::open(store.root.clone()).await.unwrap();
        let loaded = reopened.get_by_path(&project.path).await.unwrap();
        assert_eq!(loaded.status, ProjectStatus::Error);
        // The loader recovered nothing structurally but did not write back.
        let on_disk = std::fs::read(&state_path).unwrap();
        assert!(on_disk.starts_with(br#"{"id": "p-99""#));
    }

    #[tokio::test]
    async fn test_update_runs_under_lock_and_persists() {
        let (_dir, store, project) = store_with_project().await;
        let feature_id = store
            .update(&project.path, |p| {
                let feature = Feature::new(&p.id, "add auth", "feature_development", "define");
                let id = feature.id.clone();
                p.features.push(feature);
                Ok(id)
            })
            .await
            .unwrap();

        let loaded = store.get_by_path(&project.path).await.unwrap();
        assert!(loaded.feature(&feature_id).is_some());
    }

    #[tokio::test]
    async fn test_read_only_refuses_mutation_but_permits_reads() {
        let (_dir, store, mut project) = store_with_project().await;
        project.status = ProjectStatus::ReadOnly;
        store.save(project.clone()).await.unwrap();

        let err = store
            .update(&project.path, |_p| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ReadOnly");

        let loaded = store.get_by_path(&project.path).await.unwrap();
        assert_eq!(loaded.status, ProjectStatus::ReadOnly);
    }

    #[tokio::test]
    async fn test_delete_removes_state_and_index() {
        let (_dir, store, project) = store_with_project().await;
        store.delete(&project.id).await.unwrap();

        assert!(!state_file_path(&project.path).exists());
        let err = store.get_by_path(&project.path).await.unwrap_err();
        assert_eq!(err.code(), "NotFound");
        assert!(store.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_index_is_rebuilt_and_projects_adopted() {
        let (_dir, store, project) = store_with_project().await;
        std::fs::write(store.root.join(INDEX_FILE), b"garbage").unwrap();

        let reopened = ProjectStore::open(store.root.clone()).await.unwrap();
        // The index is empty, but the state file on disk is re-adopted.
        let loaded = reopened.get_by_path(&project.path).await.unwrap();
        assert_eq!(loaded.id, project.id);
    }
}
