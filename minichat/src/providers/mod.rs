pub mod minimax;
pub mod sanitize;
pub mod sse;

use crate::types::{ChatRequest, ChatResponse, StreamEvent};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

/// Classification of a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Server,
    Transport,
    Generic,
}

/// Errors from provider operations. Every failed call produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 401: the API key was rejected.
    #[error("{0}")]
    Auth(String),

    /// HTTP 429. Never retried here.
    #[error("{0}")]
    RateLimit(String),

    #[error("{message}")]
    Server { status: u16, message: String },

    /// No response body, a broken connection, or a body that could not be decoded.
    #[error("{0}")]
    Transport(String),

    #[error("{message}")]
    Generic { status: Option<u16>, message: String },
}

impl ProviderError {
    pub fn generic(message: impl Into<String>) -> Self {
        ProviderError::Generic { status: None, message: message.into() }
    }

    /// Map a non-2xx status and its (already extracted) message to an error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => ProviderError::Auth(message),
            429 => ProviderError::RateLimit(message),
            s if s >= 500 => ProviderError::Server { status: s, message },
            s => ProviderError::Generic { status: Some(s), message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::RateLimit(_) => ErrorKind::RateLimit,
            ProviderError::Server { .. } => ErrorKind::Server,
            ProviderError::Transport(_) => ErrorKind::Transport,
            ProviderError::Generic { .. } => ErrorKind::Generic,
        }
    }

    /// Short human-readable heading for presenting the error.
    pub fn title(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Auth => "Invalid API Key",
            ErrorKind::RateLimit => "Rate Limit Exceeded",
            ErrorKind::Server => "Server Error",
            ErrorKind::Transport => "Connection Error",
            ErrorKind::Generic => "Request Failed",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Auth(_) => Some(401),
            ProviderError::RateLimit(_) => Some(429),
            ProviderError::Server { status, .. } => Some(*status),
            ProviderError::Generic { status, .. } => *status,
            ProviderError::Transport(_) => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // A request that could not be built (bad header value, bad URL) never
        // reached the network.
        if e.is_builder() {
            return ProviderError::generic(format!("Invalid request: {}", e));
        }
        ProviderError::Transport(format!("Network error: {}", e))
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stream a chat completion as filtered tokens followed by one terminal item.
    fn stream(&self, request: &ChatRequest) -> BoxStream<'static, Result<StreamEvent, ProviderError>>;

    /// Execute a chat completion (non-streaming).
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Receiver for a streamed completion.
///
/// `on_token` may run any number of times; then exactly one of `on_complete`
/// or `on_error` runs. Both take `self` so neither can run twice.
pub trait StreamCallbacks: Send {
    fn on_token(&mut self, token: &str);
    fn on_complete(self, full_text: String);
    fn on_error(self, error: ProviderError);
}

/// Drive `stream` to its end, forwarding events to `callbacks`.
pub async fn deliver<C: StreamCallbacks>(
    mut stream: BoxStream<'static, Result<StreamEvent, ProviderError>>,
    mut callbacks: C,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamEvent::Token(token)) => callbacks.on_token(&token),
            Ok(StreamEvent::Done(response)) => {
                callbacks.on_complete(response.content);
                return;
            }
            Err(e) => {
                callbacks.on_error(e);
                return;
            }
        }
    }
    callbacks.on_error(ProviderError::Transport("Stream ended unexpectedly".into()));
}

/// Stream a completion from `provider` into `callbacks`.
pub async fn chat_stream<C: StreamCallbacks>(provider: &dyn Provider, request: &ChatRequest, callbacks: C) {
    deliver(provider.stream(request), callbacks).await
}
