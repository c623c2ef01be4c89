use async_trait::async_trait;
use log::{ info, warn };
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{ Path, PathBuf };
use tokio::fs::{ self, OpenOptions };
use tokio::io::{ AsyncReadExt, AsyncSeekExt, AsyncWriteExt };
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ conversation_id, HistoryStore };
use crate::error::{ ChatError, Result };
use crate::models::chat::{ ChatMessage, Conversation };

/// Newline-delimited JSON log: one line per conversation, each line a JSON
/// array of `{role, content}` objects.
pub struct JsonlHistoryStore {
    path: PathBuf,
    // Serializes appends against rewrites within this process.
    lock: Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every line must parse, blank ones included. Only the empty segment
    /// after a final `\n` is not a line.
    async fn read_records(&self) -> Result<Vec<Conversation>> {
        let content = match fs::read(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e.into());
            }
        };

        if content.is_empty() {
            return Ok(Vec::new());
        }
        let body = content.strip_suffix(b"\n").unwrap_or(&content[..]);

        let mut records = Vec::new();
        for (line_no, raw) in body.split(|b| *b == b'\n').enumerate() {
            let line = raw.strip_suffix(b"\r").unwrap_or(raw);
            let messages: Vec<ChatMessage> = serde_json
                ::from_slice(line)
                .map_err(|source| ChatError::CorruptStore { line: line_no + 1, source })?;
            let id = conversation_id(&messages)?;
            records.push(Conversation {
                index: records.len(),
                id,
                messages,
            });
        }
        Ok(records)
    }

    /// True when the file exists, is non-empty and its last byte is not `\n`.
    async fn needs_leading_newline(&self) -> Result<bool> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(false);
            }
            Err(e) => {
                return Err(e.into());
            }
        };
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(len - 1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        Ok(last[0] != b'\n')
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Rewrites the store keeping only records for which `keep` holds.
    ///
    /// The survivors go to a sibling temp file which is synced and then renamed
    /// over the store, so a failure at any point leaves the old file intact.
    /// When nothing would be removed the file is not touched.
    async fn rewrite_retaining<F>(&self, keep: F) -> Result<usize>
        where F: Fn(&Conversation) -> bool + Send
    {
        let _guard = self.lock.lock().await;
        let records = self.read_records().await?;
        let total = records.len();
        let survivors: Vec<Conversation> = records.into_iter().filter(|c| keep(c)).collect();
        let removed = total - survivors.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut buf = String::new();
        for conv in &survivors {
            buf.push_str(&serde_json::to_string(&conv.messages)?);
            buf.push('\n');
        }

        let tmp_path = self.temp_path();
        if let Err(e) = write_synced(&tmp_path, buf.as_bytes()).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            warn!("Failed to replace {}: {}", self.path.display(), e);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        info!(
            "Removed {} conversation(s) from {}, {} remain",
            removed,
            self.path.display(),
            survivors.len()
        );
        Ok(removed)
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "conversations".to_string());
        self.path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, messages: &[ChatMessage]) -> Result<String> {
        let id = conversation_id(messages)?;
        let mut line = serde_json::to_string(messages)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        self.ensure_parent_dir().await?;
        if self.needs_leading_newline().await? {
            line.insert(0, '\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        // Single write so a record is never split by another writer's append.
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        info!("Saved conversation {} ({} messages) to {}", id, messages.len(), self.path.display());
        Ok(id)
    }

    async fn list_all(&self) -> Result<Vec<Conversation>> {
        let _guard = self.lock.lock().await;
        self.read_records().await
    }

    async fn delete_by_indices(&self, indices: &BTreeSet<usize>) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }
        self.rewrite_retaining(|c| !indices.contains(&c.index)).await
    }

    async fn delete_by_ids(&self, ids: &BTreeSet<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.rewrite_retaining(|c| !ids.contains(&c.id)).await
    }
}
