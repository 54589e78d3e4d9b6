// Persistent Log Store (§4.A): one append-only JSONL file per session under
// `<data_dir>/sessions/<id>/messages.jsonl`. Every envelope that ever reaches
// a client is durable here first, so a reconnecting client can always catch
// up by paging through history instead of relying on the broadcast channel.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::envelope::MessageEnvelope;
use crate::error::CoreError;

/// A page of history plus enough bookkeeping for the client to ask for more.
pub struct Page {
    pub envelopes: Vec<MessageEnvelope>,
    pub total: usize,
    pub has_more: bool,
}

/// Serializes writes to a single session's log file so concurrent turns
/// (normal output interleaved with a late tool result) never corrupt a line.
struct SessionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

pub struct LogStore {
    data_dir: PathBuf,
    logs: Mutex<HashMap<String, Arc<SessionLog>>>,
}

impl LogStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id)
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("messages.jsonl")
    }

    async fn log_for(&self, session_id: &str) -> Result<Arc<SessionLog>, CoreError> {
        let mut logs = self.logs.lock().await;
        if let Some(l) = logs.get(session_id) {
            return Ok(l.clone());
        }
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;
        let log = Arc::new(SessionLog {
            path: self.log_path(session_id),
            write_lock: Mutex::new(()),
        });
        logs.insert(session_id.to_string(), log.clone());
        Ok(log)
    }

    /// Appends one envelope as a single JSON line. Held under the
    /// per-session write lock for the duration of the write.
    pub async fn append(&self, envelope: &MessageEnvelope) -> Result<(), CoreError> {
        let log = self.log_for(&envelope.session_id).await?;
        let _guard = log.write_lock.lock().await;
        let line = serde_json::to_string(envelope)
            .map_err(|e| CoreError::AgentStreamFailure(format!("serializing envelope: {e}")))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Reads a page of history, most recent last (chronological order),
    /// skipping `offset` envelopes from the start and returning at most
    /// `limit`. Lines that fail to parse are skipped rather than failing the
    /// whole page — the log is append-only and a single bad line must never
    /// block access to the rest of a session's history.
    pub async fn read_page(
        &self,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page, CoreError> {
        let path = self.log_path(session_id);
        if !path.is_file() {
            return Ok(Page {
                envelopes: Vec::new(),
                total: 0,
                has_more: false,
            });
        }
        let file = std::fs::File::open(&path)?;
        let reader = std::io::BufReader::new(file);

        let mut all = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MessageEnvelope>(&line) {
                Ok(env) => all.push(env),
                Err(e) => warn!(session_id, error = %e, "skipping corrupt log line"),
            }
        }

        let total = all.len();
        let page: Vec<MessageEnvelope> = all.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + page.len() < total;
        Ok(Page {
            envelopes: page,
            total,
            has_more,
        })
    }

    /// Deletes a session's on-disk log directory. Retries a handful of times
    /// since a just-closed subprocess may hold the directory open for a
    /// moment on some platforms.
    pub async fn delete(&self, session_id: &str) -> Result<(), CoreError> {
        self.logs.lock().await.remove(session_id);
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(());
        }
        let mut last_err = None;
        for attempt in 0..5 {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(50 * (attempt + 1))).await;
                }
            }
        }
        Err(CoreError::Io(last_err.expect("loop always sets last_err before exhausting")))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageEnvelope;

    #[tokio::test]
    async fn append_then_read_page_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        for i in 0..5 {
            store
                .append(&MessageEnvelope::system("s1", format!("line {i}")))
                .await
                .unwrap();
        }
        let page = store.read_page("s1", 0, 3).await.unwrap();
        assert_eq!(page.envelopes.len(), 3);
        assert_eq!(page.total, 5);
        assert!(page.has_more);

        let rest = store.read_page("s1", 3, 10).await.unwrap();
        assert_eq!(rest.envelopes.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn read_page_for_unknown_session_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let page = store.read_page("missing", 0, 10).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        store
            .append(&MessageEnvelope::system("s1", "x"))
            .await
            .unwrap();
        assert!(store.session_dir("s1").exists());
        store.delete("s1").await.unwrap();
        assert!(!store.session_dir("s1").exists());
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        store
            .append(&MessageEnvelope::system("s1", "good"))
            .await
            .unwrap();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(store.log_path("s1"))
                .unwrap();
            writeln!(file, "not json").unwrap();
        }
        store
            .append(&MessageEnvelope::system("s1", "good again"))
            .await
            .unwrap();
        let page = store.read_page("s1", 0, 10).await.unwrap();
        assert_eq!(page.total, 2);
    }
}
