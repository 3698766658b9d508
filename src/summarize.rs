//! Summarization and embedding collaborator.
//!
//! Defines the [`Summarizer`] trait and concrete implementations:
//! - **[`DisabledSummarizer`]**: `summarize` fails, `embed` yields `None`.
//! - **[`OpenAiSummarizer`]**: chat completions plus the embeddings API.
//! - **[`OllamaSummarizer`]**: `/api/generate` and `/api/embed` on a local Ollama.
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Callers bound every call with [`with_deadline`], which turns a slow
//! provider into [`EngineError::Timeout`] for that unit only.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

use crate::config::SummarizerConfig;
use crate::error::EngineError;

/// What a piece of context describes; selects the instruction sent along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    Commit,
    File,
    Folder,
    Codebase,
    Branch,
    BranchStory,
    Worklog,
}

impl SummaryKind {
    fn instruction(&self) -> &'static str {
        match self {
            SummaryKind::Commit => "Summarize this commit in one or two sentences: what changed and why.",
            SummaryKind::File => "Describe what this source file does. Start with a one-sentence purpose.",
            SummaryKind::Folder => "Describe the role of this folder in the project from its contents. Start with a one-sentence purpose.",
            SummaryKind::Codebase => "Write a short overview of this codebase from the folder descriptions below.",
            SummaryKind::Branch => "Summarize the work done on this branch from its commit summaries.",
            SummaryKind::BranchStory => "Tell the story of this branch as a short narrative: the goal, the steps taken, and where it ended up.",
            SummaryKind::Worklog => "Write a concise work log entry from the activity below. Group related changes.",
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    /// False for a summarizer that never produces text. Callers skip the
    /// call and treat the unit as done rather than failed.
    fn supports_summaries(&self) -> bool {
        true
    }

    /// Whether [`embed`](Summarizer::embed) can return vectors.
    fn supports_embeddings(&self) -> bool {
        false
    }

    async fn summarize(&self, kind: SummaryKind, context: &str) -> Result<String>;

    /// Embed `text`, or `Ok(None)` when embeddings are not supported.
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}

/// Run one collaborator call under a deadline.
///
/// The error carries `key` (commit hash, file path or scope) so failures can
/// be traced back to the unit of work.
pub async fn with_deadline<T, F>(key: &str, after: Duration, call: F) -> crate::error::Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(EngineError::Summarizer {
            key: key.to_string(),
            source,
        }),
        Err(_) => Err(EngineError::Timeout {
            key: key.to_string(),
            after,
        }),
    }
}

/// Build the summarizer named by `config.provider`.
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Box<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSummarizer)),
        "openai" => Ok(Box::new(OpenAiSummarizer::new(config)?)),
        "ollama" => Ok(Box::new(OllamaSummarizer::new(config)?)),
        other => bail!("Unknown summarizer provider: {}", other),
    }
}

// ============ Disabled ============

/// Used when `summarizer.provider = "disabled"`.
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    fn name(&self) -> &str {
        "disabled"
    }

    fn supports_summaries(&self) -> bool {
        false
    }

    async fn summarize(&self, _kind: SummaryKind, _context: &str) -> Result<String> {
        bail!("Summarizer is disabled")
    }
}

// ============ Shared HTTP plumbing ============

struct HttpEndpoint {
    client: reqwest::Client,
    max_retries: u32,
    label: &'static str,
}

impl HttpEndpoint {
    fn new(config: &SummarizerConfig, label: &'static str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
            label,
        })
    }

    /// POST `body` to `url`, retrying 429/5xx and network errors.
    async fn post_json(&self, url: &str, bearer: Option<&str>, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(provider = self.label, attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "{} API error {}: {}",
                            self.label,
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("{} API error {}: {}", self.label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("{} connection error: {}", self.label, e));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", self.label)))
    }
}

fn prompt(kind: SummaryKind, context: &str) -> String {
    format!("{}\n\n{}", kind.instruction(), context)
}

fn floats(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ OpenAI ============

pub struct OpenAiSummarizer {
    http: HttpEndpoint,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: Option<String>,
}

impl OpenAiSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("summarizer.model required for OpenAI provider"))?;

        Ok(Self {
            http: HttpEndpoint::new(config, "OpenAI")?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model,
            embedding_model: config.embedding_model.clone(),
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn name(&self) -> &str {
        &self.model
    }

    fn supports_embeddings(&self) -> bool {
        self.embedding_model.is_some()
    }

    async fn summarize(&self, kind: SummaryKind, context: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt(kind, context) }],
        });
        let url = format!("{}/chat/completions", self.base_url);
        let response = self.http.post_json(&url, Some(&self.api_key), &body).await?;
        parse_openai_completion(&response)
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let Some(model) = &self.embedding_model else {
            return Ok(None);
        };
        let body = json!({ "model": model, "input": [text] });
        let url = format!("{}/embeddings", self.base_url);
        let response = self.http.post_json(&url, Some(&self.api_key), &body).await?;
        parse_openai_embedding(&response).map(Some)
    }
}

fn parse_openai_completion(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
}

fn parse_openai_embedding(json: &Value) -> Result<Vec<f32>> {
    let embedding = json
        .pointer("/data/0/embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
    Ok(floats(embedding))
}

// ============ Ollama ============

pub struct OllamaSummarizer {
    http: HttpEndpoint,
    url: String,
    model: String,
    embedding_model: Option<String>,
}

impl OllamaSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("summarizer.model required for Ollama provider"))?;
        Ok(Self {
            http: HttpEndpoint::new(config, "Ollama")?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
            embedding_model: config.embedding_model.clone(),
        })
    }
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    fn name(&self) -> &str {
        &self.model
    }

    fn supports_embeddings(&self) -> bool {
        self.embedding_model.is_some()
    }

    async fn summarize(&self, kind: SummaryKind, context: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "prompt": prompt(kind, context),
            "stream": false,
        });
        let response = self
            .http
            .post_json(&format!("{}/api/generate", self.url), None, &body)
            .await?;
        response
            .get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response text"))
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let Some(model) = &self.embedding_model else {
            return Ok(None);
        };
        let body = json!({ "model": model, "input": [text] });
        let response = self
            .http
            .post_json(&format!("{}/api/embed", self.url), None, &body)
            .await?;
        let embedding = response
            .pointer("/embeddings/0")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;
        Ok(Some(floats(embedding)))
    }
}
