//! Process-wide configuration.
//!
//! Mirrors `original_source/src/config.py`: thresholds, provider selection,
//! and the tenant-directory layout. Secrets are read from the environment,
//! never hardcoded.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LlmProvider {
    /// Deterministic local embedder; chat_json/chat_text are unsupported.
    LocalCpu,
    /// OpenAI-compatible chat + embeddings endpoint.
    OpenAi,
    /// Anthropic-compatible messages endpoint (embeddings proxied elsewhere).
    Anthropic,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmProvider::LocalCpu => "local_cpu",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Scores strictly greater than this block at L2.
    pub risk_threshold_block: i32,
    /// Lower bound (inclusive) of the HITL ambiguous band.
    pub risk_threshold_ambiguous: i32,
    /// L1 semantic-match and prune threshold.
    pub similarity_threshold: f32,
    /// Above this L1 similarity to a safe anchor, L2 is skipped.
    pub safe_anchor_confidence: f32,
    /// Chat history cap, in turns (user+assistant pairs).
    pub max_history_turns: usize,
    /// Whether L2 runs concurrently with L1.
    pub parallel_layers: bool,
    /// Whether ambiguous decisions are appended to the HITL review queue.
    pub hitl_enabled: bool,
    /// Selected LLM provider.
    pub llm_provider: LlmProvider,
    /// Route `embed` to the local CPU engine while chat stays remote.
    pub use_hybrid_embeddings: bool,
    /// Root directory under which per-tenant state lives.
    pub base_memory_dir: PathBuf,
    /// Path to the process-wide HITL review queue file.
    pub review_queue_path: PathBuf,
    /// Base URL for the remote chat/embeddings provider.
    pub llm_base_url: String,
    /// Model name for inference (chat_json / chat_text).
    pub model_inference: String,
    /// Model name for embeddings.
    pub model_embedding: String,
}

impl Config {
    pub fn tenant_dir(&self, client_id: &str) -> PathBuf {
        self.base_memory_dir.join("clients").join(client_id)
    }

    /// SHA-256 over the model identity this config resolves to, so an audit
    /// ledger's genesis block can be tied to the configuration that produced
    /// every decision recorded after it.
    pub fn model_fingerprint(&self) -> String {
        let payload = serde_json::json!({
            "provider": self.llm_provider.to_string(),
            "base_url": self.llm_base_url,
            "model_inference": self.model_inference,
            "model_embedding": self.model_embedding,
        });
        let canonical = serde_json::to_string(&payload).expect("json values always serialize");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Default for Config {
    fn default() -> Self {
        let llm_provider = LlmProvider::LocalCpu;
        Self {
            risk_threshold_block: 70,
            risk_threshold_ambiguous: 40,
            similarity_threshold: 0.75,
            safe_anchor_confidence: 0.70,
            max_history_turns: 10,
            parallel_layers: llm_provider != LlmProvider::LocalCpu,
            hitl_enabled: true,
            llm_provider,
            use_hybrid_embeddings: false,
            base_memory_dir: PathBuf::from("./memory"),
            review_queue_path: PathBuf::from("./review_queue.json"),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            model_inference: "gpt-4o-mini".to_string(),
            model_embedding: "text-embedding-3-small".to_string(),
        }
    }
}

/// Reads a provider API key from the environment, matching
/// `config.py`'s `os.getenv('OPENAI_API_KEY', '')` convention.
pub fn api_key_for(provider: LlmProvider) -> Option<String> {
    let var = match provider {
        LlmProvider::OpenAi => "OPENAI_API_KEY",
        LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
        LlmProvider::LocalCpu => return None,
    };
    std::env::var(var).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let cfg = Config::default();
        assert_eq!(cfg.risk_threshold_block, 70);
        assert_eq!(cfg.risk_threshold_ambiguous, 40);
        assert_eq!(cfg.similarity_threshold, 0.75);
        assert_eq!(cfg.safe_anchor_confidence, 0.70);
        assert_eq!(cfg.max_history_turns, 10);
    }

    #[test]
    fn tenant_dir_is_keyed_by_client_id() {
        let cfg = Config::default();
        let a = cfg.tenant_dir("alice");
        let b = cfg.tenant_dir("bob");
        assert_ne!(a, b);
        assert!(a.ends_with("clients/alice"));
    }
}
