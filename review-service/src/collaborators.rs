//! Minimal default implementations of the external collaborator traits
//! the orchestrator depends on. Their wire-level details (repository-
//! hosting API auth, LLM provider protocol, webhook signature transport)
//! are out of scope; these exist only to give the service something real
//! to run against until a deployment wires in its own client.

use async_trait::async_trait;
use review_llm::{LlmClient, LlmError};
use review_orchestrator::{CommentPublisher, DiffFetcher, DiffFetchError, EventContext};
use review_precheck::DiffFile;
use std::time::Duration;

pub struct HttpDiffFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDiffFetcher {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with a fixed timeout"),
            base_url,
        }
    }
}

#[async_trait]
impl DiffFetcher for HttpDiffFetcher {
    async fn fetch_diff(&self, ctx: &EventContext) -> Result<Vec<DiffFile>, DiffFetchError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/files",
            self.base_url, ctx.owner, ctx.repo, ctx.pr_number
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DiffFetchError::Failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DiffFetchError::Failed(format!("status {}", response.status())));
        }
        let files: Vec<DiffFile> = response
            .json::<Vec<RawDiffFile>>()
            .await
            .map_err(|e| DiffFetchError::Failed(e.to_string()))?
            .into_iter()
            .map(|f| DiffFile { path: f.filename, content: f.patch.unwrap_or_default() })
            .collect();
        Ok(files)
    }
}

#[derive(serde::Deserialize)]
struct RawDiffFile {
    filename: String,
    patch: Option<String>,
}

pub struct HttpCommentPublisher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCommentPublisher {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with a fixed timeout"),
            base_url,
        }
    }
}

#[async_trait]
impl CommentPublisher for HttpCommentPublisher {
    async fn publish(&self, ctx: &EventContext, body: &str) -> Result<(), String> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.base_url, ctx.owner, ctx.repo, ctx.pr_number
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status()))
        }
    }
}

/// Deterministic-fallback-only client: never reaches a real model
/// provider, so every review is produced by `review_llm`'s fallback path.
/// A deployment replaces this with a real HTTP-backed `LlmClient`.
pub struct UnconfiguredLlmClient;

#[async_trait]
impl LlmClient for UnconfiguredLlmClient {
    async fn call(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::ParseFailure("no LLM provider configured".into()))
    }
}
