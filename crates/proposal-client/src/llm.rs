use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProposalError, ProposalResult};

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.deepseek.com/v1`; `/chat/completions` is appended
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.deepseek.com/v1".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            temperature: 0.5,
            max_tokens: 4000,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
    /// Emitted separately by reasoning models
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> ProposalResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(ProposalError::MissingApiKey);
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'))
    }

    /// One chat round trip. Retries are the caller's business.
    pub async fn chat(&self, system_prompt: &str, user_prompt: &str) -> ProposalResult<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProposalError::Timeout
                } else {
                    ProposalError::RequestFailed(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProposalError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        extract_content(&body)
    }
}

/// Pull the reply text out of a chat-completions body. Reasoning output, when
/// present, is prepended so the rationale survives even if `content` only
/// holds the JSON array.
fn extract_content(body: &str) -> ProposalResult<String> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ProposalError::InvalidResponse(format!("{e}: {}", truncate(body, 200))))?;

    let Some(choice) = parsed.choices.into_iter().next() else {
        return Err(ProposalError::InvalidResponse("reply has no choices".to_string()));
    };

    let content = choice.message.content.unwrap_or_default();
    let reasoning = choice.message.reasoning_content.unwrap_or_default();

    let merged = match (reasoning.trim().is_empty(), content.trim().is_empty()) {
        (true, true) => return Err(ProposalError::EmptyResponse),
        (true, false) => content,
        (false, true) => reasoning,
        (false, false) => format!("{}\n\n{}", reasoning.trim(), content.trim()),
    };
    Ok(merged)
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
