//! LLM Engine abstraction (component A).
//!
//! Uniform `embed` / `chat_json` / `chat_text` over a local deterministic
//! embedder and remote chat providers. Grounded on
//! `original_source/src/llm_engine.py`'s `LLMEngine` ABC and its
//! `OllamaEngine` / `OpenAIEngine` / `AnthropicEngine` implementations,
//! reshaped around `reqwest` in the manner `llm.rs` talks to its local
//! inference server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::{api_key_for, Config, LlmProvider};
use crate::error::EngineError;

/// One turn of chat history, user or assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Parsed judge output. Defaults to fail-open on any decode problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResponse {
    #[serde(default)]
    pub risk_score: i32,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "parse error".to_string()
}

impl Default for JudgeResponse {
    fn default() -> Self {
        Self {
            risk_score: 0,
            reason: default_reason(),
        }
    }
}

#[async_trait]
pub trait LlmEngine: Send + Sync {
    /// Returns a vector embedding for `text`. Degrades to an all-zero vector
    /// of this engine's default dimension on any failure.
    async fn embed(&self, text: &str) -> Vec<f32>;

    /// Requests JSON-only output. `Ok(JudgeResponse::default())` (parse
    /// error, risk 0) on malformed output per component A's own contract;
    /// `Err` only on a transport-level call failure, which callers (L2) are
    /// expected to fail open on with their own reason text.
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeResponse, EngineError>;

    /// Requests free-text output, optionally continuing `history`.
    /// `Err` on a transport-level call failure.
    async fn chat_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, EngineError>;

    /// Default embedding dimension for this engine, used for the zero
    /// vector returned on embed failure.
    fn embedding_dim(&self) -> usize;
}

/// Strips common wrapper artifacts (```json fences, a bare `json` prefix)
/// that chat models add around otherwise-valid JSON output.
pub fn strip_json_wrapper(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

fn parse_judge_response(raw: &str) -> JudgeResponse {
    let cleaned = strip_json_wrapper(raw);
    serde_json::from_str(cleaned).unwrap_or_default()
}

/// Deterministic, dependency-free embedder. Stands in for the original's
/// local `SentenceTransformer` / `all-MiniLM-L6-v2`: a bag-of-words hash
/// projection into a fixed-size vector, L2-normalized. Not semantically
/// rich, but stable (same text always yields the same vector) which is all
/// the membrane's cosine-similarity check requires.
pub struct LocalCpuEngine {
    dim: usize,
}

impl LocalCpuEngine {
    pub const DEFAULT_DIM: usize = 384;

    pub fn new() -> Self {
        Self {
            dim: Self::DEFAULT_DIM,
        }
    }

    fn hash_token(token: &str, dim: usize) -> (usize, f32) {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h as usize) % dim;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }

    fn embed_local(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in text.to_lowercase().split_whitespace() {
            let (idx, sign) = Self::hash_token(token, self.dim);
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for LocalCpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmEngine for LocalCpuEngine {
    async fn embed(&self, text: &str) -> Vec<f32> {
        self.embed_local(text)
    }

    async fn chat_json(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<JudgeResponse, EngineError> {
        Ok(JudgeResponse::default())
    }

    async fn chat_text(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _history: &[ChatTurn],
    ) -> Result<String, EngineError> {
        Ok(String::new())
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible chat + embeddings provider.
pub struct OpenAiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model_inference: String,
    model_embedding: String,
    embedding_dim: usize,
}

impl OpenAiEngine {
    pub fn new(cfg: &Config, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: cfg.llm_base_url.clone(),
            api_key,
            model_inference: cfg.model_inference.clone(),
            model_embedding: cfg.model_embedding.clone(),
            embedding_dim: 1536,
        }
    }
}

#[async_trait]
impl LlmEngine for OpenAiEngine {
    async fn embed(&self, text: &str) -> Vec<f32> {
        let req = OpenAiEmbeddingRequest {
            model: &self.model_embedding,
            input: text,
        };
        let result: Result<OpenAiEmbeddingResponse, reqwest::Error> = async {
            self.client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await?
                .json::<OpenAiEmbeddingResponse>()
                .await
        }
        .await;

        match result {
            Ok(resp) => resp
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .unwrap_or_else(|| vec![0.0; self.embedding_dim]),
            Err(e) => {
                warn!("OpenAI embedding failed: {e}");
                vec![0.0; self.embedding_dim]
            }
        }
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeResponse, EngineError> {
        let req = OpenAiChatRequest {
            model: &self.model_inference,
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: 0.1,
            response_format: Some(OpenAiResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        let resp: OpenAiChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?
            .json()
            .await?;

        Ok(resp
            .choices
            .first()
            .map(|c| parse_judge_response(&c.message.content))
            .unwrap_or_default())
    }

    async fn chat_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, EngineError> {
        let mut messages = vec![OpenAiMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        }];
        messages.extend(history.iter().map(|t| OpenAiMessage {
            role: t.role.clone(),
            content: t.content.clone(),
        }));
        messages.push(OpenAiMessage {
            role: "user".to_string(),
            content: user_prompt.to_string(),
        });

        let req = OpenAiChatRequest {
            model: &self.model_inference,
            messages,
            temperature: 0.3,
            response_format: None,
        };

        let resp: OpenAiChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?
            .json()
            .await?;

        Ok(resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<OpenAiMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    text: String,
}

/// Anthropic-compatible messages provider. Anthropic has no embeddings
/// endpoint (`original_source/src/llm_engine.py::AnthropicEngine` proxies to
/// OpenAI for this); rather than requiring a second provider key, `embed`
/// here falls back to the same deterministic local embedding as
/// `LocalCpuEngine` — documented as an Open Question resolution in
/// DESIGN.md.
pub struct AnthropicEngine {
    client: reqwest::Client,
    api_key: String,
    model: String,
    local_embedder: LocalCpuEngine,
}

impl AnthropicEngine {
    pub fn new(cfg: &Config, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            api_key,
            model: cfg.model_inference.clone(),
            local_embedder: LocalCpuEngine::new(),
        }
    }
}

#[async_trait]
impl LlmEngine for AnthropicEngine {
    async fn embed(&self, text: &str) -> Vec<f32> {
        self.local_embedder.embed(text).await
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeResponse, EngineError> {
        let req = AnthropicRequest {
            model: &self.model,
            max_tokens: 500,
            temperature: 0.1,
            system: system_prompt,
            messages: vec![OpenAiMessage {
                role: "user".to_string(),
                content: user_prompt.to_string(),
            }],
        };

        let resp: AnthropicResponse = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&req)
            .send()
            .await?
            .json()
            .await?;

        Ok(resp
            .content
            .first()
            .map(|b| parse_judge_response(&b.text))
            .unwrap_or_default())
    }

    async fn chat_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, EngineError> {
        let mut messages: Vec<OpenAiMessage> = history
            .iter()
            .map(|t| OpenAiMessage {
                role: t.role.clone(),
                content: t.content.clone(),
            })
            .collect();
        messages.push(OpenAiMessage {
            role: "user".to_string(),
            content: user_prompt.to_string(),
        });

        let req = AnthropicRequest {
            model: &self.model,
            max_tokens: 1000,
            temperature: 0.3,
            system: system_prompt,
            messages,
        };

        let resp: AnthropicResponse = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&req)
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.content.into_iter().next().map(|b| b.text).unwrap_or_default())
    }

    fn embedding_dim(&self) -> usize {
        self.local_embedder.embedding_dim()
    }
}

/// Hybrid wrapper: routes `embed` to a local CPU engine while `chat_*`
/// stays on the configured remote engine, matching
/// `config.py::USE_HYBRID_EMBEDDINGS`.
pub struct HybridEngine {
    local: LocalCpuEngine,
    remote: Box<dyn LlmEngine>,
}

impl HybridEngine {
    pub fn new(remote: Box<dyn LlmEngine>) -> Self {
        Self {
            local: LocalCpuEngine::new(),
            remote,
        }
    }
}

#[async_trait]
impl LlmEngine for HybridEngine {
    async fn embed(&self, text: &str) -> Vec<f32> {
        self.local.embed(text).await
    }

    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeResponse, EngineError> {
        self.remote.chat_json(system_prompt, user_prompt).await
    }

    async fn chat_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, EngineError> {
        self.remote.chat_text(system_prompt, user_prompt, history).await
    }

    fn embedding_dim(&self) -> usize {
        self.local.embedding_dim()
    }
}

/// Factory: builds the configured engine. Replaces the original's
/// `get_engine()` process-wide singleton (see DESIGN.md, §9 "Global
/// singletons") with an explicit value constructed once per tenant
/// pipeline at bootstrap and shared by reference.
pub fn build_engine(cfg: &Config) -> anyhow::Result<Box<dyn LlmEngine>> {
    let remote: Box<dyn LlmEngine> = match cfg.llm_provider {
        LlmProvider::LocalCpu => Box::new(LocalCpuEngine::new()),
        LlmProvider::OpenAi => {
            let key = api_key_for(LlmProvider::OpenAi)
                .ok_or(crate::error::EngineError::MissingApiKey("OPENAI_API_KEY"))?;
            Box::new(OpenAiEngine::new(cfg, key))
        }
        LlmProvider::Anthropic => {
            let key = api_key_for(LlmProvider::Anthropic).ok_or(
                crate::error::EngineError::MissingApiKey("ANTHROPIC_API_KEY"),
            )?;
            Box::new(AnthropicEngine::new(cfg, key))
        }
    };

    if cfg.use_hybrid_embeddings && cfg.llm_provider != LlmProvider::LocalCpu {
        Ok(Box::new(HybridEngine::new(remote)))
    } else {
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_json_wrapper("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_wrapper("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_wrapper("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn parse_judge_response_fails_open() {
        let r = parse_judge_response("not json at all");
        assert_eq!(r.risk_score, 0);
        assert_eq!(r.reason, "parse error");
    }

    #[test]
    fn parse_judge_response_accepts_fenced_json() {
        let r = parse_judge_response("```json\n{\"risk_score\": 80, \"reason\": \"bad\"}\n```");
        assert_eq!(r.risk_score, 80);
        assert_eq!(r.reason, "bad");
    }

    #[tokio::test]
    async fn local_engine_embedding_is_deterministic() {
        let engine = LocalCpuEngine::new();
        let a = engine.embed("hello world").await;
        let b = engine.embed("hello world").await;
        assert_eq!(a, b);
        assert_eq!(a.len(), LocalCpuEngine::DEFAULT_DIM);
    }

    #[tokio::test]
    async fn local_engine_chat_is_unsupported() {
        let engine = LocalCpuEngine::new();
        let r = engine.chat_json("sys", "user").await.unwrap();
        assert_eq!(r.risk_score, 0);
        assert_eq!(engine.chat_text("sys", "user", &[]).await.unwrap(), "");
    }
}
