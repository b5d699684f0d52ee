//! Audit Ledger (component F): an append-only, hash-chained per-tenant
//! decision log. Grounded on `original_source/src/core/blockchain.py` for
//! the algorithm and `audit.rs`'s module shape, with real SHA-256 in place
//! of a `DefaultHasher` placeholder; see DESIGN.md.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp_ms: u64,
    pub data: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
}

/// `hash = SHA-256(canonical-json({index,timestamp,data,previous_hash}))`.
/// `serde_json::Value::Object` is backed by a `BTreeMap` (this crate does
/// not enable serde_json's `preserve_order` feature), so serializing it
/// already yields keys in sorted order — the Rust equivalent of Python's
/// `json.dumps(..., sort_keys=True)`.
fn compute_hash(index: u64, timestamp_ms: u64, data: &serde_json::Value, previous_hash: &str) -> String {
    let payload = serde_json::json!({
        "index": index,
        "timestamp": timestamp_ms,
        "data": data,
        "previous_hash": previous_hash,
    });
    let canonical = serde_json::to_string(&payload).expect("json values always serialize");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Block {
    fn genesis(data: serde_json::Value) -> Self {
        let timestamp_ms = now_ms();
        let hash = compute_hash(0, timestamp_ms, &data, "0");
        Self {
            index: 0,
            timestamp_ms,
            data,
            previous_hash: "0".to_string(),
            hash,
        }
    }

    fn recompute_hash(&self) -> String {
        compute_hash(self.index, self.timestamp_ms, &self.data, &self.previous_hash)
    }
}

pub struct Ledger {
    path: PathBuf,
    chain: Mutex<Vec<Block>>,
}

impl Ledger {
    pub fn new(tenant_dir: &Path) -> Self {
        Self::with_genesis_data(tenant_dir, serde_json::json!({"event": "Genesis"}))
    }

    /// Like `new`, but stamps a fresh chain's genesis block with `data`
    /// (e.g. a model fingerprint) instead of the bare Genesis marker. Has no
    /// effect when a chain already exists on disk — an existing genesis
    /// block is never rewritten.
    pub fn with_genesis_data(tenant_dir: &Path, data: serde_json::Value) -> Self {
        let path = tenant_dir.join("audit_chain.json");
        let chain = Self::load(&path).unwrap_or_else(|| vec![Block::genesis(data)]);
        let ledger = Self {
            path,
            chain: Mutex::new(chain),
        };
        ledger.persist_sync();
        ledger
    }

    /// Tolerates a stored `hash` that does not recompute: the source of
    /// truth for what's "on chain" is what was persisted, not a replay of
    /// the hash function, which may evolve.
    fn load(path: &Path) -> Option<Vec<Block>> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// `new` runs outside an async context and before anything else can
    /// see this ledger, so the mutex is always uncontended here.
    fn persist_sync(&self) {
        let chain = self.chain.try_lock().expect("ledger mutex uncontended at construction");
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(body) = serde_json::to_vec_pretty(&*chain) {
            let _ = std::fs::write(&self.path, body);
        }
    }

    /// Appends a block: `index = latest.index + 1`, `previous_hash =
    /// latest.hash`, persists the whole chain.
    pub async fn add_block(&self, data: serde_json::Value) -> Block {
        let mut chain = self.chain.lock().await;
        let latest = chain.last().expect("chain always has a genesis block");
        let index = latest.index + 1;
        let timestamp_ms = now_ms();
        let previous_hash = latest.hash.clone();
        let hash = compute_hash(index, timestamp_ms, &data, &previous_hash);
        let block = Block {
            index,
            timestamp_ms,
            data,
            previous_hash,
            hash,
        };
        chain.push(block.clone());

        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("failed to create tenant dir {}: {e}", parent.display());
            }
        }
        match serde_json::to_vec_pretty(&*chain) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.path, body) {
                    tracing::error!("failed to persist ledger: {e}");
                }
            }
            Err(e) => tracing::error!("failed to serialize ledger: {e}"),
        }

        block
    }

    /// Walks the chain recomputing hashes and checking links; returns the
    /// index of the first failure, or `Ok(())`.
    pub async fn validate(&self) -> Result<(), LedgerError> {
        let chain = self.chain.lock().await;
        for i in 1..chain.len() {
            let current = &chain[i];
            let previous = &chain[i - 1];
            if current.hash != current.recompute_hash() {
                return Err(LedgerError::HashMismatch(current.index));
            }
            if current.previous_hash != previous.hash {
                return Err(LedgerError::BrokenLink(current.index, previous.index));
            }
        }
        Ok(())
    }

    pub async fn height(&self) -> usize {
        self.chain.lock().await.len()
    }

    #[cfg(test)]
    pub async fn tamper(&self, index: u64, new_data: serde_json::Value) {
        let mut chain = self.chain.lock().await;
        if let Some(block) = chain.iter_mut().find(|b| b.index == index) {
            block.data = new_data;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fresh_ledger_has_only_genesis() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        assert_eq!(ledger.height().await, 1);
        ledger.validate().await.unwrap();
    }

    #[tokio::test]
    async fn append_chains_hashes_correctly() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        ledger.add_block(serde_json::json!({"event_type": "PROMPT_PROCESSED"})).await;
        ledger.add_block(serde_json::json!({"event_type": "PROMPT_PROCESSED"})).await;
        assert_eq!(ledger.height().await, 3);
        ledger.validate().await.unwrap();
    }

    #[tokio::test]
    async fn tampering_is_detected_at_the_right_index() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        ledger.add_block(serde_json::json!({"a": 1})).await;
        ledger.add_block(serde_json::json!({"a": 2})).await;
        ledger.tamper(1, serde_json::json!({"a": "TAMPERED"})).await;

        let err = ledger.validate().await.unwrap_err();
        assert!(matches!(err, LedgerError::HashMismatch(1)));
    }

    #[tokio::test]
    async fn reload_from_disk_preserves_chain() {
        let dir = tempdir().unwrap();
        {
            let ledger = Ledger::new(dir.path());
            ledger.add_block(serde_json::json!({"a": 1})).await;
        }
        let reloaded = Ledger::new(dir.path());
        assert_eq!(reloaded.height().await, 2);
        reloaded.validate().await.unwrap();
    }
}
