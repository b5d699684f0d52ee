//! Human-in-the-loop review queue.
//!
//! Process-wide rather than per-tenant, matching the original system's
//! `review_queue.json` as a single flat file; this is a known isolation gap
//! rather than an oversight. Kept process-wide here to match the external
//! interface exactly, with the promotion-to-per-tenant option recorded as an
//! Open Question in DESIGN.md instead of silently changing the contract.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub prompt: String,
    pub risk_score: i32,
    pub reason: String,
    pub status: String,
    pub timestamp_ms: u64,
}

pub struct ReviewQueue {
    path: PathBuf,
    entries: Mutex<Vec<ReviewEntry>>,
}

impl ReviewQueue {
    pub fn new(path: &Path) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    pub async fn append(&self, prompt: &str, risk_score: i32, reason: &str) {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let entry = ReviewEntry {
            prompt: prompt.to_string(),
            risk_score,
            reason: reason.to_string(),
            status: "pending".to_string(),
            timestamp_ms,
        };

        let mut entries = self.entries.lock().await;
        entries.push(entry);
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&*entries) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.path, body) {
                    tracing::error!("failed to persist review queue: {e}");
                }
            }
            Err(e) => tracing::error!("failed to serialize review queue: {e}"),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("review_queue.json");
        let queue = ReviewQueue::new(&path);
        queue.append("ambiguous prompt", 55, "AMBIGUOUS: test").await;
        assert_eq!(queue.len().await, 1);

        let reloaded = ReviewQueue::new(&path);
        assert_eq!(reloaded.len().await, 1);
    }
}
