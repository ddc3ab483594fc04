//! Crash-safe registry persistence.
//!
//! The live file is only ever replaced by an atomic rename of a fully
//! written and synced temp file, and the previous live file is kept as a
//! backup.  Loading validates the checksum and falls back to the backup,
//! restoring it as the live file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::descriptor::{sha256_hex, CapabilityDescriptor};

pub const FORMAT_VERSION: &str = "relay-registry/1";

const LIVE_FILE: &str = "tool_registry_state.json";
const BACKUP_FILE: &str = "tool_registry_state.backup.json";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("snapshot is invalid: {0}")]
    Invalid(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What a snapshot carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryState {
    pub generation: u64,
    pub tools: Vec<CapabilityDescriptor>,
    pub embeddings: BTreeMap<String, Vec<f32>>,
}

impl RegistryState {
    /// SHA-256 over the sorted operation ids.
    pub fn checksum(&self) -> String {
        let mut ids: Vec<&str> = self.tools.iter().map(|t| t.operation_id.as_str()).collect();
        ids.sort_unstable();
        sha256_hex(serde_json::to_string(&ids).unwrap_or_default().as_bytes())
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: String,
    generation: u64,
    timestamp: DateTime<Utc>,
    checksum: String,
    tools: Vec<CapabilityDescriptor>,
    embeddings: BTreeMap<String, Vec<f32>>,
}

fn validate(file: SnapshotFile) -> Result<RegistryState, SnapshotError> {
    if file.version != FORMAT_VERSION {
        return Err(SnapshotError::Invalid(format!(
            "unsupported version {}",
            file.version
        )));
    }
    let mut seen = HashSet::new();
    for t in &file.tools {
        if !seen.insert(t.operation_id.as_str()) {
            return Err(SnapshotError::Invalid(format!(
                "duplicate operation id {}",
                t.operation_id
            )));
        }
    }
    let state = RegistryState {
        generation: file.generation,
        tools: file.tools,
        embeddings: file.embeddings,
    };
    if state.checksum() != file.checksum {
        return Err(SnapshotError::Invalid("checksum mismatch".to_string()));
    }
    Ok(state)
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Live + backup snapshot files in one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    live: PathBuf,
    backup: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            live: dir.join(LIVE_FILE),
            backup: dir.join(BACKUP_FILE),
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.live.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Atomically replace the live snapshot.
    ///
    /// Returns `Ok(false)` without touching disk when the state has no
    /// descriptors or no vectors.
    pub async fn persist(&self, state: &RegistryState) -> Result<bool, SnapshotError> {
        if state.tools.is_empty() || state.embeddings.is_empty() {
            warn!(
                tools = state.tools.len(),
                embeddings = state.embeddings.len(),
                "refusing to persist an empty registry snapshot"
            );
            return Ok(false);
        }

        let file = SnapshotFile {
            version: FORMAT_VERSION.to_string(),
            generation: state.generation,
            timestamp: Utc::now(),
            checksum: state.checksum(),
            tools: state.tools.clone(),
            embeddings: state.embeddings.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let tmp = self.tmp_path();
        if let Err(e) = self.write_and_swap(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        info!(
            tools = state.tools.len(),
            embeddings = state.embeddings.len(),
            generation = state.generation,
            "registry snapshot saved"
        );
        Ok(true)
    }

    async fn write_and_swap(&self, tmp: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
        if let Some(dir) = self.live.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
        }

        let mut f = tokio::fs::File::create(tmp).await.map_err(io_err(tmp))?;
        f.write_all(bytes).await.map_err(io_err(tmp))?;
        f.flush().await.map_err(io_err(tmp))?;
        f.sync_all().await.map_err(io_err(tmp))?;
        drop(f);

        if tokio::fs::try_exists(&self.live).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::copy(&self.live, &self.backup).await {
                warn!(error = %e, "failed to refresh snapshot backup");
            }
        }

        tokio::fs::rename(tmp, &self.live)
            .await
            .map_err(io_err(&self.live))?;
        Ok(())
    }

    /// Load the live snapshot, falling back to the backup.
    pub async fn load(&self) -> Option<RegistryState> {
        match read_file(&self.live).await {
            Ok(Some(state)) => return Some(state),
            Ok(None) => {}
            Err(e) => warn!(path = %self.live.display(), error = %e, "live snapshot unusable"),
        }

        match read_file(&self.backup).await {
            Ok(Some(state)) => {
                match tokio::fs::copy(&self.backup, &self.live).await {
                    Ok(_) => info!("restored live snapshot from backup"),
                    Err(e) => warn!(error = %e, "failed to restore live snapshot from backup"),
                }
                Some(state)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %self.backup.display(), error = %e, "backup snapshot unusable");
                None
            }
        }
    }
}

/// `Ok(None)` when the file does not exist.
async fn read_file(path: &Path) -> Result<Option<RegistryState>, SnapshotError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    let file: SnapshotFile = serde_json::from_slice(&bytes)?;
    validate(file).map(Some)
}
