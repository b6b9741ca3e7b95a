use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// A message waiting for the server to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub client_temp_id: String,
    pub conversation_id: Uuid,
    pub text: String,
    /// Unix milliseconds at enqueue time.
    pub created_at: i64,
}

#[derive(Serialize, Deserialize, Default)]
struct QueueFile {
    version: u32,
    pending: Vec<QueuedMessage>,
}

/// JSON file backing the offline queue.
///
/// Every save writes a sibling temp file and renames it over the old one, so
/// a crash mid-write leaves the previous backlog intact.
#[derive(Debug, Clone)]
pub struct QueueStore {
    file: PathBuf,
}

impl QueueStore {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Read the persisted backlog. A missing file is an empty backlog.
    pub async fn load(&self) -> Result<Vec<QueuedMessage>> {
        let bytes = match fs::read(&self.file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.file.display())),
        };
        let parsed: QueueFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt queue file {}", self.file.display()))?;
        Ok(parsed.pending)
    }

    pub async fn save(&self, pending: &[QueuedMessage]) -> Result<()> {
        if let Some(dir) = self.file.parent() {
            fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec_pretty(&QueueFile {
            version: 1,
            pending: pending.to_vec(),
        })?;
        let tmp = self.file.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.file).await?;
        Ok(())
    }
}
