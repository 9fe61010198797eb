use std::path::{Path, PathBuf};

use canopy_optimizer::Model;
use canopy_types::{CanopyResult, StorageError};
use serde_json::Value;
use tracing::{debug, info, warn};

/// File name used when the store is given a directory.
pub const RESULTS_FILE: &str = "results.json";

/// JSON checkpoint store for a collection of models.
///
/// Each save writes the whole collection as a JSON array of
/// [`Model::to_json`] records, after rotating up to `keep_previous` older
/// checkpoints to `results_1.json`, `results_2.json`, and so on.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    path: PathBuf,
    keep_previous: usize,
}

impl JsonStorage {
    /// A directory resolves to `<dir>/results.json`; for a file path the
    /// parent directory must already exist.
    pub fn new<P: AsRef<Path>>(path: P, keep_previous: usize) -> CanopyResult<Self> {
        let mut path = path.as_ref().to_path_buf();
        if path.is_dir() {
            path = path.join(RESULTS_FILE);
        }

        let parent_exists = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
            _ => true,
        };
        if !parent_exists {
            return Err(StorageError::InvalidPath {
                path: path.display().to_string(),
            }
            .into());
        }

        Ok(Self {
            path,
            keep_previous,
        })
    }

    /// `<data dir>/canopy`, falling back to the working directory.
    pub fn default_location() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("canopy")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep_previous(&self) -> usize {
        self.keep_previous
    }

    /// Path of the `n`th most recent previous checkpoint (1-based).
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.path.extension() {
            Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{n}"),
        };
        self.path.with_file_name(name)
    }

    pub async fn save(&self, models: &[Model]) -> CanopyResult<()> {
        let records = models
            .iter()
            .map(Model::to_json)
            .collect::<CanopyResult<Vec<_>>>()?;
        self.save_records(records).await
    }

    /// Write already serialized model records.
    pub async fn save_records(&self, records: Vec<Value>) -> CanopyResult<()> {
        let body = serde_json::to_vec(&Value::Array(records))?;
        self.rotate().await?;
        tokio::fs::write(&self.path, body).await?;
        info!("Saved checkpoint to {}", self.path.display());
        Ok(())
    }

    async fn rotate(&self) -> CanopyResult<()> {
        if self.keep_previous == 0 || !tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }

        for n in (1..self.keep_previous).rev() {
            let from = self.backup_path(n);
            if tokio::fs::try_exists(&from).await? {
                tokio::fs::rename(&from, self.backup_path(n + 1)).await?;
            }
        }
        tokio::fs::rename(&self.path, self.backup_path(1)).await?;
        debug!("Rotated checkpoints for {}", self.path.display());
        Ok(())
    }

    /// Load the most recent checkpoint that can be read, trying the current
    /// file first and then each previous checkpoint in turn.
    pub async fn load(&self) -> CanopyResult<Vec<Model>> {
        let candidates = std::iter::once(self.path.clone())
            .chain((1..=self.keep_previous).map(|n| self.backup_path(n)));

        for candidate in candidates {
            if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                continue;
            }
            match Self::read_models(&candidate).await {
                Ok(models) => {
                    info!("Loaded {} models from {}", models.len(), candidate.display());
                    return Ok(models);
                }
                Err(e) => {
                    warn!("Skipping unreadable checkpoint {}: {}", candidate.display(), e);
                }
            }
        }

        Err(StorageError::NothingToLoad {
            path: self.path.display().to_string(),
        }
        .into())
    }

    async fn read_models(path: &Path) -> CanopyResult<Vec<Model>> {
        let body = tokio::fs::read_to_string(path).await?;
        let records: Vec<Value> = serde_json::from_str(&body)?;
        records.iter().map(Model::from_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_optimizer::Scope;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_models() -> Vec<Model> {
        let scope = Scope::new()
            .exclusive(true)
            .with_child("a", json!(1))
            .unwrap()
            .with_child("b", json!(2))
            .unwrap();
        let mut models = scope.split();
        let (id, _) = models[0].generate().unwrap();
        models[0].register_result(&id, Some(0.5), None).unwrap();
        models
    }

    #[test]
    fn directory_resolves_to_results_file() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path(), 1).unwrap();
        assert_eq!(storage.path(), dir.path().join("results.json"));
        assert_eq!(storage.backup_path(2), dir.path().join("results_2.json"));
    }

    #[test]
    fn missing_parent_is_invalid() {
        let dir = TempDir::new().unwrap();
        let err = JsonStorage::new(dir.path().join("nope").join("x.json"), 1).unwrap_err();
        assert!(err.to_string().contains("Invalid save path"));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path(), 1).unwrap();
        let models = sample_models();

        storage.save(&models).await.unwrap();
        let loaded = storage.load().await.unwrap();

        assert_eq!(loaded.len(), models.len());
        for (a, b) in loaded.iter().zip(&models) {
            assert_eq!(a, b);
            assert_eq!(a.id(), b.id());
            assert_eq!(a.results().len(), b.results().len());
        }
    }

    #[tokio::test]
    async fn rotation_keeps_bounded_history() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path(), 2).unwrap();
        let models = sample_models();

        for _ in 0..4 {
            storage.save(&models).await.unwrap();
        }
        assert!(storage.path().exists());
        assert!(storage.backup_path(1).exists());
        assert!(storage.backup_path(2).exists());
        assert!(!storage.backup_path(3).exists());
    }

    #[tokio::test]
    async fn no_backups_when_keep_previous_is_zero() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path(), 0).unwrap();
        let models = sample_models();
        storage.save(&models).await.unwrap();
        storage.save(&models).await.unwrap();
        assert!(!storage.backup_path(1).exists());
    }

    #[tokio::test]
    async fn load_falls_back_to_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path(), 1).unwrap();

        let first = sample_models();
        storage.save(&first[..1]).await.unwrap();
        storage.save(&first).await.unwrap();
        tokio::fs::write(storage.path(), b"not json").await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), first[0].id());
    }

    #[tokio::test]
    async fn load_with_nothing_saved_fails() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new(dir.path().join("empty.json"), 3).unwrap();
        let err = storage.load().await.unwrap_err();
        assert!(err.to_string().contains("Could not load"));
    }

    #[test]
    fn default_location_ends_in_canopy() {
        assert!(JsonStorage::default_location().ends_with("canopy"));
    }
}
