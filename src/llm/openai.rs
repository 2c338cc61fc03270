//! OpenAI-compatible chat completions client with SSE streaming.

use crate::config::LlmConfig;
use crate::conversation::{Message, Role};
use crate::error::{Error, LlmError, Result};
use crate::llm::{FragmentStream, LanguageModel, Prompt};

use anyhow::Context as _;
use futures::StreamExt as _;

/// Streams completions from any `/v1/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleModel {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

/// One parsed server-sent-events line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseLine {
    /// A chunk of the reply. `finished` is set once the provider reports a finish reason.
    Delta {
        content: Option<String>,
        finished: bool,
    },
    Done,
    Error(String),
    Ignore,
}

impl OpenAiCompatibleModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: Prompt) -> Result<FragmentStream> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::MissingApiKey.into());
        };

        let body = request_body(&self.model, &prompt);
        tracing::debug!(
            model = %self.model,
            messages = prompt.messages.len(),
            "requesting completion stream"
        );

        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderRequest(format!(
                "API error ({status}): {}",
                truncate_body(&text)
            ))
            .into());
        }

        Ok(completion_stream(response.bytes_stream()))
    }
}

/// Decode an SSE byte stream into reply fragments.
///
/// The stream only ends cleanly once the provider signals completion with
/// `[DONE]` or a finish reason. A connection that closes earlier yields
/// `GenerationFailed` so the partial reply is never taken as whole.
fn completion_stream<S, B, E>(bytes: S) -> FragmentStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut pending: Vec<u8> = Vec::new();
        let mut finished = false;

        loop {
            let at_end = match bytes.next().await {
                Some(Ok(chunk)) => {
                    pending.extend_from_slice(chunk.as_ref());
                    false
                }
                Some(Err(error)) => {
                    yield Err(Error::from(LlmError::GenerationFailed(error.to_string())));
                    return;
                }
                None => {
                    // The last event may arrive without its trailing newline.
                    pending.push(b'\n');
                    true
                }
            };

            // Only decode whole lines so multibyte characters split across chunks survive.
            while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                match parse_sse_line(String::from_utf8_lossy(&line).trim()) {
                    SseLine::Delta { content, finished: last } => {
                        finished |= last;
                        if let Some(text) = content {
                            yield Ok(text);
                        }
                    }
                    SseLine::Done => return,
                    SseLine::Error(message) => {
                        yield Err(Error::from(LlmError::GenerationFailed(message)));
                        return;
                    }
                    SseLine::Ignore => {}
                }
            }

            if at_end {
                break;
            }
        }

        if !finished {
            tracing::warn!("completion stream closed before the provider finished");
            yield Err(Error::from(LlmError::GenerationFailed(
                "stream ended before completion".into(),
            )));
        }
    })
}

fn role_name(role: Role) -> Option<&'static str> {
    match role {
        Role::User => Some("user"),
        Role::Assistant => Some("assistant"),
        Role::System => Some("system"),
        // Stored tool turns carry no call id, which the API requires.
        Role::Tool => None,
    }
}

fn request_body(model: &str, prompt: &Prompt) -> serde_json::Value {
    let mut messages = Vec::with_capacity(prompt.messages.len() + 1);

    if let Some(system) = &prompt.system {
        messages.push(serde_json::json!({
            "role": "system",
            "content": system,
        }));
    }

    messages.extend(prompt.messages.iter().filter_map(|message: &Message| {
        role_name(message.role()).map(|role| {
            serde_json::json!({
                "role": role,
                "content": message.text(),
            })
        })
    }));

    serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
    })
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseLine::Ignore;
    };

    if let Some(message) = event["error"]["message"].as_str() {
        return SseLine::Error(message.to_string());
    }

    let choice = &event["choices"][0];
    let content = choice["delta"]["content"]
        .as_str()
        .filter(|content| !content.is_empty())
        .map(str::to_string);
    let finished = choice["finish_reason"].as_str().is_some();

    if content.is_none() && !finished {
        return SseLine::Ignore;
    }
    SseLine::Delta { content, finished }
}

fn truncate_body(body: &str) -> &str {
    let limit = 500;
    match body.char_indices().nth(limit) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}
