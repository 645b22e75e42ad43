//! MiniMax chat-completions client (OpenAI-compatible wire format).
//!
//! MiniMax models emit their reasoning inline as `<think>...</think>`; both
//! modes strip it before text reaches the caller.

use super::sanitize;
use super::sse::{self, LineBuffer};
use super::{Provider, ProviderError, StreamCallbacks};
use crate::filter::{ThinkFilter, strip_thinking};
use crate::types::*;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const MINIMAX_API_URL: &str = "https://api.minimax.io/v1/chat/completions";
pub const MODEL: &str = "MiniMax-M2.1";

pub struct MiniMaxProvider {
    config: ProviderConfig,
    url: String,
    client: Client,
}

impl MiniMaxProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            url: MINIMAX_API_URL.to_string(),
            client: Client::new(),
        }
    }

    /// Send requests to another base URL, e.g. a proxy or a local mock.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        self.url = if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        };
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stream a completion into `callbacks`.
    pub async fn chat_stream<C: StreamCallbacks>(&self, request: &ChatRequest, callbacks: C) {
        super::chat_stream(self, request, callbacks).await
    }

    fn build_messages(&self, messages: &[Message]) -> Vec<Message> {
        match &self.config.system_prompt {
            Some(prompt) if messages.first().map(|m| m.role) != Some(Role::System) => {
                let mut out = Vec::with_capacity(messages.len() + 1);
                out.push(Message::system(prompt.clone()));
                out.extend_from_slice(messages);
                out
            }
            _ => messages.to_vec(),
        }
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: MODEL.to_string(),
            messages: self.build_messages(&request.messages),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            stream,
        }
    }

    fn post(&self, body: &CompletionRequest) -> reqwest::RequestBuilder {
        tracing::debug!(
            url = %self.url,
            model = %body.model,
            messages = body.messages.len(),
            stream = body.stream,
            "sending chat completion request"
        );
        self.client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
    }
}

// ---- Request/response types (wire format) ----

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u64,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<DeltaContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaContent {
    content: Option<String>,
}

/// Turns SSE body bytes into filtered text, one stream's worth of state.
#[derive(Default)]
struct DeltaDecoder {
    lines: LineBuffer,
    filter: ThinkFilter,
    full_text: String,
    finish_reason: Option<String>,
}

impl DeltaDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.lines.push(chunk);
    }

    /// Next piece of visible text from the complete lines buffered so far.
    fn next_token(&mut self) -> Result<Option<String>, ProviderError> {
        while let Some(line) = self.lines.next_line() {
            let line = line.map_err(decode_error)?;
            if let Some(text) = self.process_line(&line) {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    /// Handle the unterminated last line and release the filter. Returns the
    /// trailing visible text, possibly empty.
    fn finish(&mut self) -> Result<String, ProviderError> {
        let mut tail = String::new();
        if let Some(line) = self.lines.finish() {
            let line = line.map_err(decode_error)?;
            if let Some(text) = self.process_line(&line) {
                tail.push_str(&text);
            }
        }
        let flushed = self.filter.flush();
        self.full_text.push_str(&flushed);
        tail.push_str(&flushed);
        Ok(tail)
    }

    fn into_response(self) -> ChatResponse {
        ChatResponse {
            content: self.full_text,
            finish_reason: self.finish_reason,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        let data = sse::parse_data_line(line)?;
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("skipping malformed stream chunk: {}", e);
                return None;
            }
        };
        let choice = chunk.choices?.into_iter().next()?;
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
        let content = choice.delta?.content.filter(|c| !c.is_empty())?;
        let visible = self.filter.feed(&content);
        if visible.is_empty() {
            return None;
        }
        self.full_text.push_str(&visible);
        Some(visible)
    }
}

fn decode_error(e: std::string::FromUtf8Error) -> ProviderError {
    ProviderError::Transport(format!("Invalid UTF-8 in response stream: {}", e))
}

async fn failed_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let err = sanitize::error_from_response(status, &body);
    tracing::warn!(status, kind = ?err.kind(), "chat completion request failed: {}", err);
    err
}

#[async_trait]
impl Provider for MiniMaxProvider {
    fn stream(&self, request: &ChatRequest) -> BoxStream<'static, Result<StreamEvent, ProviderError>> {
        let req = self.post(&self.build_body(request, true));

        let s = async_stream::stream! {
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => { yield Err(ProviderError::from(e)); return; }
            };
            if !resp.status().is_success() {
                yield Err(failed_response(resp).await);
                return;
            }

            let mut decoder = DeltaDecoder::default();
            let mut byte_stream = resp.bytes_stream();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk_bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(ProviderError::Transport(format!("Stream read failed: {}", e)));
                        return;
                    }
                };
                decoder.push(&chunk_bytes);
                loop {
                    match decoder.next_token() {
                        Ok(Some(text)) => yield Ok(StreamEvent::Token(text)),
                        Ok(None) => break,
                        Err(e) => { yield Err(e); return; }
                    }
                }
            }

            match decoder.finish() {
                Ok(tail) => {
                    if !tail.is_empty() {
                        yield Ok(StreamEvent::Token(tail));
                    }
                }
                Err(e) => { yield Err(e); return; }
            }
            let response = decoder.into_response();
            tracing::debug!(chars = response.content.len(), "chat completion stream finished");
            yield Ok(StreamEvent::Done(response));
        };
        Box::pin(s)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let resp = self.post(&self.build_body(request, false)).send().await?;
        if !resp.status().is_success() {
            return Err(failed_response(resp).await);
        }

        let body = resp.text().await?;
        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Transport(format!("Malformed response: {}", e)))?;

        let (raw, finish_reason) = match parsed.choices.into_iter().next() {
            Some(choice) => (
                choice.message.and_then(|m| m.content).unwrap_or_default(),
                choice.finish_reason,
            ),
            None => (String::new(), None),
        };
        Ok(ChatResponse {
            content: strip_thinking(&raw),
            finish_reason,
        })
    }
}
