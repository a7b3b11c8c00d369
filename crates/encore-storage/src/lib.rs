//! Persisted run state + raw scrape artifact archive for Encore.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use encore_core::{Listing, PersistedState, RawListing};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "encore-storage";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Single-file JSON store for the previous run's deals.
///
/// Runs are serialized externally (one cron invocation at a time), so there
/// is exactly one reader and one writer and no file locking.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the previous run's state. A missing or corrupt file degrades to
    /// `None` (first-run semantics) rather than failing the run.
    pub async fn load(&self) -> Option<PersistedState> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "could not read state file, treating as first run");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "state file is corrupt, treating as first run");
                None
            }
        }
    }

    /// Overwrite the state file with this run's deals. Written to a temp
    /// file in the same directory and renamed into place so a crash never
    /// leaves a partial state file behind.
    pub async fn save(&self, deals: &[Listing]) -> Result<(), StateError> {
        let state = PersistedState {
            last_run: Utc::now(),
            deals: deals.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|source| StateError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4()));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io { path, source }
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StateError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-hash-addressed archive of raw extractor batches, kept for
/// diagnosing selector drift after the fact.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn batch_relative_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    /// Archive one run's raw listing batch. Identical batches land on the
    /// same hash path and are not rewritten.
    pub async fn store_raw_batch(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        batch: &[RawListing],
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(batch).context("serializing raw batch")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = Self::batch_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
