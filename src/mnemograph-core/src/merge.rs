use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::MergeConfig;

/// Merge capability: fold a new text into an existing summary. Callers
/// decide what a failure means; the tree index falls back to concatenation.
#[async_trait::async_trait]
pub trait MergeProvider: Send + Sync {
    async fn merge(&self, existing: &str, incoming: &str, context: &str) -> Result<String>;
}

const MERGE_SYSTEM_PROMPT: &str = "You merge two descriptions into one concise summary. \
Keep every distinct fact from both inputs, drop repetitions, and answer with \
the merged text only.";

/// OpenAI-compatible chat client (works with llama.cpp /v1/chat/completions)
/// used for summary merging.
pub struct HttpMergeClient {
    client: Client,
    config: MergeConfig,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl HttpMergeClient {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl MergeProvider for HttpMergeClient {
    async fn merge(&self, existing: &str, incoming: &str, context: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: format!("{}\nContext: {}", MERGE_SYSTEM_PROMPT, context),
                },
                ChatMessage {
                    role: "user",
                    content: format!("Existing: {}\nNew: {}", existing, incoming),
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to call merge service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Merge service returned status {}: {}", status, body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse merge response")?;

        let merged = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if merged.trim().is_empty() {
            anyhow::bail!("Merge service returned an empty completion");
        }

        Ok(merged.trim().to_string())
    }
}
