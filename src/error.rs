//! Error taxonomy for the defense core.
//!
//! Request-path errors never abort a decision: engine, ledger and
//! persistence failures are absorbed and logged by the callers of these
//! types. `GatewayError` exists for the handful of conditions that are
//! genuinely fatal — tenant bootstrap failing to construct an engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response was not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing API key for provider {0}")]
    MissingApiKey(&'static str),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("block {0} hash mismatch, data may be tampered")]
    HashMismatch(u64),
    #[error("block {0} previous_hash does not match block {1}'s hash")]
    BrokenLink(u64, u64),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bootstrap tenant {0}: {1}")]
    TenantInit(String, #[source] PersistenceError),
}
