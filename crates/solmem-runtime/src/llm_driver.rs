//! [`LlmDriver`] – OpenAI-compatible text generation and embeddings.
//!
//! Talks to any server exposing `/v1/chat/completions` and `/v1/embeddings`
//! (OpenAI itself, or a local model server such as
//! [Ollama](https://ollama.com) at `http://localhost:11434`). The bearer token
//! is optional so local servers work without one.
//!
//! # Example
//!
//! ```rust,no_run
//! use solmem_runtime::llm_driver::LlmDriver;
//!
//! let driver = LlmDriver::new("http://localhost:11434", "llama3")
//!     .with_embedding_model("nomic-embed-text");
//!
//! // Requires a running model server – skipped in unit tests.
//! // let vector = driver.embedding("red dust").await.unwrap();
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solmem_types::CollaboratorError;
use thiserror::Error;

use crate::collaborators::{Embedder, TextGenerator, http_error};

pub const DEFAULT_TEXT_MODEL: &str = "gpt-4";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl LlmError {
    fn into_collaborator(self, service: &str) -> CollaboratorError {
        match self {
            LlmError::Http(e) => http_error(service, e),
            LlmError::BadResponse(msg) => CollaboratorError::permanent(service, msg),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// Prompts go out as `system`; replies come back as `assistant`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Role {
    System,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub(crate) role: Role,
    pub(crate) content: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for OpenAI-compatible chat and embedding endpoints.
///
/// Construct once per process and share it between stages.
pub struct LlmDriver {
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmDriver {
    /// Create a driver pointing at `base_url` (e.g. `"https://api.openai.com"`)
    /// and generating text with `model`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// Send `Authorization: Bearer <key>` on every request. Empty keys are
    /// ignored.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send `messages` to the model and return the assistant's reply text,
    /// trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Http`] if the request fails, or
    /// [`LlmError::BadResponse`] if the response shape is unexpected.
    pub(crate) async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };
        let response: ChatResponse = self
            .post("/v1/chat/completions")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    /// Embed `text` with the configured embedding model.
    pub async fn embedding(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = EmbeddingRequest {
            model: &self.embedding_model,
            input: [text],
        };
        let response: EmbeddingResponse = self
            .post("/v1/embeddings")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LlmError::BadResponse("no embedding in response".into()))
    }
}

#[async_trait]
impl TextGenerator for LlmDriver {
    /// The prompt is sent as a single system message.
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let messages = [ChatMessage {
            role: Role::System,
            content: prompt.to_string(),
        }];
        self.complete(&messages)
            .await
            .map_err(|e| e.into_collaborator("text_generator"))
    }
}

#[async_trait]
impl Embedder for LlmDriver {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        self.embedding(text)
            .await
            .map_err(|e| e.into_collaborator("embedder"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn chat_roles_serialize_lowercase() {
        let roles = [
            (Role::System, "system"),
            (Role::Assistant, "assistant"),
        ];
        for (role, expected) in roles {
            let msg = ChatMessage {
                role,
                content: String::new(),
            };
            let json = serde_json::to_string(&msg).unwrap();
            assert!(json.contains(expected));
        }
    }

    #[tokio::test]
    async fn generate_sends_prompt_as_system_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "system", "content": "Write the memory entry."}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"  Memory Entry:\n- Date: 2024-01-08  "}}]}"#,
            )
            .create_async()
            .await;

        let driver = LlmDriver::new(server.url(), "gpt-4").with_api_key(Some("sk-test".into()));
        let text = driver.generate("Write the memory entry.").await.unwrap();

        mock.assert_async().await;
        assert_eq!(text, "Memory Entry:\n- Date: 2024-01-08");
    }

    #[tokio::test]
    async fn empty_choices_is_permanent_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let driver = LlmDriver::new(server.url(), "gpt-4");
        let err = driver.generate("hi").await.unwrap_err();
        assert_eq!(err.service, "text_generator");
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn rate_limited_generation_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .create_async()
            .await;

        let driver = LlmDriver::new(server.url(), "gpt-4");
        assert!(driver.generate("hi").await.unwrap_err().transient);
    }

    #[tokio::test]
    async fn embed_uses_embedding_model() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "text-embedding-3-small",
                "input": ["red dust"]
            })))
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[0.25,-0.5,1.0],"index":0}]}"#)
            .create_async()
            .await;

        let driver = LlmDriver::new(server.url(), "gpt-4");
        let vector = driver.embed("red dust").await.unwrap();

        mock.assert_async().await;
        assert_eq!(vector, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn blank_api_key_is_ignored() {
        let driver = LlmDriver::new("http://localhost:11434/", "llama3").with_api_key(Some("  ".into()));
        assert!(driver.api_key.is_none());
        assert_eq!(driver.base_url, "http://localhost:11434");
    }
}
