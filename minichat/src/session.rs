//! Single-flight chat session: one generation at a time, advisory cancellation.

use crate::config::PreferenceSource;
use crate::providers::minimax::MiniMaxProvider;
use crate::providers::{self, Provider, ProviderError, StreamCallbacks};
use crate::types::{ChatRequest, Message, ProviderConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};

/// Builds the provider for one call from that call's configuration.
pub type ProviderFactory = Arc<dyn Fn(ProviderConfig) -> Arc<dyn Provider> + Send + Sync>;

/// Presents terminal errors to the user.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &ProviderError);
}

/// Reports errors through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &ProviderError) {
        tracing::error!(kind = ?error.kind(), "{}: {}", error.title(), error);
    }
}

#[derive(Debug, Default)]
struct SessionState {
    generating: bool,
    cancelled: bool,
    /// Bumped by every accepted `send_message`; callbacks from older calls
    /// must not touch the state.
    generation: u64,
    streaming_content: String,
}

impl SessionState {
    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.generating && !self.cancelled
    }
}

struct Shared {
    state: Mutex<SessionState>,
    content: watch::Sender<String>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_content(&self, state: &mut SessionState, content: String) {
        state.streaming_content = content;
        self.content.send_replace(state.streaming_content.clone());
    }

    /// Claim the session for a new generation, or `None` if one is running.
    fn begin(&self) -> Option<u64> {
        let mut state = self.lock();
        if state.generating {
            return None;
        }
        state.generating = true;
        state.cancelled = false;
        state.generation += 1;
        self.set_content(&mut state, String::new());
        Some(state.generation)
    }

    fn push_token(&self, generation: u64, token: &str) {
        let mut state = self.lock();
        if !state.is_live(generation) {
            return;
        }
        let mut content = std::mem::take(&mut state.streaming_content);
        content.push_str(token);
        self.set_content(&mut state, content);
    }

    /// Return to idle if `generation` still owns the session. True if the
    /// generation ran to the end without being cancelled.
    fn finish(&self, generation: u64) -> bool {
        let mut state = self.lock();
        let live = state.is_live(generation);
        if state.generation == generation {
            state.generating = false;
            self.set_content(&mut state, String::new());
        }
        live
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        state.generating = false;
        self.set_content(&mut state, String::new());
    }

    /// Return to idle if `generation` still owns a running session.
    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.generating {
            state.generating = false;
            self.set_content(&mut state, String::new());
        }
    }
}

/// Releases the session when a `send_message` future is dropped before it
/// finished, e.g. by a timeout.
struct GenerationGuard {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.shared.release(self.generation);
    }
}

/// Front end for one conversation.
///
/// At most one generation runs at a time; `send_message` while one is in
/// flight returns `None` without side effects. [`ChatSession::stop_generation`]
/// takes effect immediately for observers, but the underlying response is
/// still read to its end and its output discarded.
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<Shared>,
    source: Arc<dyn PreferenceSource>,
    reporter: Arc<dyn ErrorReporter>,
    factory: ProviderFactory,
}

impl ChatSession {
    pub fn new(source: Arc<dyn PreferenceSource>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self::with_provider_factory(
            source,
            reporter,
            Arc::new(|config| Arc::new(MiniMaxProvider::new(config)) as Arc<dyn Provider>),
        )
    }

    pub fn with_provider_factory(
        source: Arc<dyn PreferenceSource>,
        reporter: Arc<dyn ErrorReporter>,
        factory: ProviderFactory,
    ) -> Self {
        let (content, _) = watch::channel(String::new());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::default()),
                content,
            }),
            source,
            reporter,
            factory,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.shared.lock().generating
    }

    /// Text streamed so far by the running generation; empty when idle.
    pub fn streaming_content(&self) -> String {
        self.shared.lock().streaming_content.clone()
    }

    /// Watch the streaming content as it changes.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.shared.content.subscribe()
    }

    /// Generate the assistant's reply to `history`.
    ///
    /// Returns `None` if a generation is already running, if the call was
    /// cancelled, or if it failed (the error goes to the reporter).
    pub async fn send_message(&self, history: Vec<Message>) -> Option<Message> {
        let Some(generation) = self.shared.begin() else {
            tracing::debug!("generation already in progress, ignoring message");
            return None;
        };
        let _guard = GenerationGuard {
            shared: Arc::clone(&self.shared),
            generation,
        };

        let prefs = match self.source.load() {
            Ok(p) => p,
            Err(e) => return self.fail(generation, e.into()),
        };
        let config = match prefs.provider_config() {
            Ok(c) => c,
            Err(e) => return self.fail(generation, e.into()),
        };

        let provider = (self.factory)(config);
        let request = ChatRequest::new(history);
        tracing::debug!(generation, stream = prefs.stream_responses, "starting generation");

        if prefs.stream_responses {
            self.stream_reply(generation, provider.as_ref(), &request).await
        } else {
            self.complete_reply(generation, provider.as_ref(), &request).await
        }
    }

    /// Cancel the running generation, if any. The session is idle on return.
    pub fn stop_generation(&self) {
        tracing::debug!("generation stopped");
        self.shared.stop();
    }

    async fn complete_reply(
        &self,
        generation: u64,
        provider: &dyn Provider,
        request: &ChatRequest,
    ) -> Option<Message> {
        match provider.chat(request).await {
            Ok(response) => {
                if self.shared.finish(generation) {
                    Some(Message::assistant(response.content))
                } else {
                    None
                }
            }
            Err(e) => self.fail(generation, e),
        }
    }

    async fn stream_reply(
        &self,
        generation: u64,
        provider: &dyn Provider,
        request: &ChatRequest,
    ) -> Option<Message> {
        let (done, reply) = oneshot::channel();
        let sink = SessionSink {
            shared: Arc::clone(&self.shared),
            reporter: Arc::clone(&self.reporter),
            generation,
            done,
        };
        providers::chat_stream(provider, request, sink).await;
        reply.await.ok().flatten()
    }

    fn fail(&self, generation: u64, error: ProviderError) -> Option<Message> {
        if self.shared.finish(generation) {
            self.reporter.report(&error);
        }
        None
    }
}

/// Routes one stream's callbacks into the session state.
struct SessionSink {
    shared: Arc<Shared>,
    reporter: Arc<dyn ErrorReporter>,
    generation: u64,
    done: oneshot::Sender<Option<Message>>,
}

impl StreamCallbacks for SessionSink {
    fn on_token(&mut self, token: &str) {
        self.shared.push_token(self.generation, token);
    }

    fn on_complete(self, full_text: String) {
        let reply = self
            .shared
            .finish(self.generation)
            .then(|| Message::assistant(full_text));
        let _ = self.done.send(reply);
    }

    fn on_error(self, error: ProviderError) {
        if self.shared.finish(self.generation) {
            self.reporter.report(&error);
        }
        let _ = self.done.send(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Preferences, StaticPreferences};
    use crate::providers::ErrorKind;
    use crate::types::{ChatResponse, StreamEvent};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    type Event = Result<StreamEvent, ProviderError>;

    struct FakeProvider {
        events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
        reply: Mutex<Option<oneshot::Receiver<Result<ChatResponse, ProviderError>>>>,
    }

    struct FakeHandle {
        events: mpsc::UnboundedSender<Event>,
        reply: Option<oneshot::Sender<Result<ChatResponse, ProviderError>>>,
    }

    impl FakeHandle {
        fn token(&self, text: &str) {
            self.events.send(Ok(StreamEvent::Token(text.into()))).unwrap();
        }

        fn done(&self, text: &str) {
            let response = ChatResponse { content: text.into(), finish_reason: Some("stop".into()) };
            self.events.send(Ok(StreamEvent::Done(response))).unwrap();
        }

        fn fail(&self, error: ProviderError) {
            self.events.send(Err(error)).unwrap();
        }

        fn reply(&mut self, result: Result<ChatResponse, ProviderError>) {
            self.reply.take().unwrap().send(result).unwrap();
        }
    }

    fn fake() -> (Arc<FakeProvider>, FakeHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let provider = FakeProvider {
            events: Mutex::new(Some(events_rx)),
            reply: Mutex::new(Some(reply_rx)),
        };
        (Arc::new(provider), FakeHandle { events: events_tx, reply: Some(reply_tx) })
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn stream(&self, _request: &ChatRequest) -> BoxStream<'static, Event> {
            let mut rx = self.events.lock().unwrap().take().unwrap();
            Box::pin(async_stream::stream! {
                while let Some(event) = rx.recv().await {
                    yield event;
                }
            })
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let rx = self.reply.lock().unwrap().take().unwrap();
            rx.await.unwrap_or_else(|_| Err(ProviderError::Transport("closed".into())))
        }
    }

    #[derive(Default)]
    struct RecordingReporter(Mutex<Vec<ProviderError>>);

    impl ErrorReporter for RecordingReporter {
        fn report(&self, error: &ProviderError) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    impl RecordingReporter {
        fn kinds(&self) -> Vec<ErrorKind> {
            self.0.lock().unwrap().iter().map(|e| e.kind()).collect()
        }
    }

    struct Harness {
        session: ChatSession,
        reporter: Arc<RecordingReporter>,
        configs: Arc<Mutex<Vec<ProviderConfig>>>,
    }

    fn prefs(stream: bool) -> Preferences {
        Preferences {
            api_key: "test-key".into(),
            stream_responses: stream,
            ..Default::default()
        }
    }

    fn harness(prefs: Preferences, providers: Vec<Arc<FakeProvider>>) -> Harness {
        let queue = Arc::new(Mutex::new(VecDeque::from(providers)));
        let configs = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&configs);
        let factory: ProviderFactory = Arc::new(move |config| {
            seen.lock().unwrap().push(config);
            queue.lock().unwrap().pop_front().unwrap() as Arc<dyn Provider>
        });
        let reporter = Arc::new(RecordingReporter::default());
        let session = ChatSession::with_provider_factory(
            Arc::new(StaticPreferences(prefs)),
            reporter.clone(),
            factory,
        );
        Harness { session, reporter, configs }
    }

    fn hi() -> Vec<Message> {
        vec![Message::user("Hi")]
    }

    #[tokio::test]
    async fn streaming_reply_accumulates_tokens() {
        let (provider, handle) = fake();
        let h = harness(prefs(true), vec![provider]);

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        assert!(h.session.is_generating());

        handle.token("Hel");
        assert!(futures::poll!(&mut turn).is_pending());
        assert_eq!(h.session.streaming_content(), "Hel");
        assert_eq!(*h.session.subscribe().borrow(), "Hel");

        handle.token("lo");
        handle.done("Hello");
        assert_eq!(turn.await, Some(Message::assistant("Hello")));
        assert!(!h.session.is_generating());
        assert_eq!(h.session.streaming_content(), "");
        assert!(h.reporter.kinds().is_empty());
        assert_eq!(h.configs.lock().unwrap()[0].api_key, "test-key");
    }

    #[tokio::test]
    async fn second_send_while_generating_is_rejected() {
        let (provider, handle) = fake();
        let h = harness(prefs(true), vec![provider]);

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        handle.token("partial");
        assert!(futures::poll!(&mut turn).is_pending());

        assert_eq!(h.session.send_message(hi()).await, None);
        assert!(h.session.is_generating());
        assert_eq!(h.session.streaming_content(), "partial");
        assert_eq!(h.configs.lock().unwrap().len(), 1);

        handle.done("partial");
        assert_eq!(turn.await, Some(Message::assistant("partial")));
    }

    #[tokio::test]
    async fn stop_swallows_late_tokens_and_completion() {
        let (provider, handle) = fake();
        let h = harness(prefs(true), vec![provider]);

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        handle.token("Hel");
        assert!(futures::poll!(&mut turn).is_pending());

        h.session.stop_generation();
        assert!(!h.session.is_generating());
        assert_eq!(h.session.streaming_content(), "");

        handle.token("lo");
        assert!(futures::poll!(&mut turn).is_pending());
        assert_eq!(h.session.streaming_content(), "");

        handle.done("Hello");
        assert_eq!(turn.await, None);
        assert_eq!(h.session.streaming_content(), "");
        assert!(h.reporter.kinds().is_empty());
    }

    #[tokio::test]
    async fn stop_silences_late_error() {
        let (provider, handle) = fake();
        let h = harness(prefs(true), vec![provider]);

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        h.session.stop_generation();
        handle.fail(ProviderError::Transport("reset".into()));
        assert_eq!(turn.await, None);
        assert!(h.reporter.kinds().is_empty());
    }

    #[tokio::test]
    async fn cancelled_stream_does_not_disturb_next_generation() {
        let (first, first_handle) = fake();
        let (second, second_handle) = fake();
        let h = harness(prefs(true), vec![first, second]);

        let old = h.session.send_message(hi());
        tokio::pin!(old);
        assert!(futures::poll!(&mut old).is_pending());
        h.session.stop_generation();

        let new = h.session.send_message(hi());
        tokio::pin!(new);
        assert!(futures::poll!(&mut new).is_pending());
        assert!(h.session.is_generating());

        second_handle.token("fresh");
        assert!(futures::poll!(&mut new).is_pending());

        first_handle.token("stale");
        first_handle.done("stale");
        assert_eq!(old.await, None);
        assert!(h.session.is_generating());
        assert_eq!(h.session.streaming_content(), "fresh");

        second_handle.done("fresh");
        assert_eq!(new.await, Some(Message::assistant("fresh")));
        assert!(!h.session.is_generating());
    }

    #[tokio::test]
    async fn dropped_call_releases_session() {
        let (stalled, _stalled_handle) = fake();
        let (next, next_handle) = fake();
        let h = harness(prefs(true), vec![stalled, next]);

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), h.session.send_message(hi())).await;
        assert!(timed_out.is_err());
        assert!(!h.session.is_generating());
        assert_eq!(h.session.streaming_content(), "");

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        assert!(h.session.is_generating());
        next_handle.done("again");
        assert_eq!(turn.await, Some(Message::assistant("again")));
        assert!(h.reporter.kinds().is_empty());
    }

    #[tokio::test]
    async fn stream_error_is_reported_once() {
        let (provider, handle) = fake();
        let h = harness(prefs(true), vec![provider]);

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        handle.token("par");
        handle.fail(ProviderError::RateLimit("slow down".into()));
        assert_eq!(turn.await, None);
        assert_eq!(h.reporter.kinds(), vec![ErrorKind::RateLimit]);
        assert!(!h.session.is_generating());
        assert_eq!(h.session.streaming_content(), "");
    }

    #[tokio::test]
    async fn non_streaming_reply() {
        let (provider, mut handle) = fake();
        let h = harness(prefs(false), vec![provider]);

        handle.reply(Ok(ChatResponse { content: "Hello".into(), finish_reason: Some("stop".into()) }));
        assert_eq!(h.session.send_message(hi()).await, Some(Message::assistant("Hello")));
        assert!(!h.session.is_generating());
    }

    #[tokio::test]
    async fn non_streaming_error_is_reported() {
        let (provider, mut handle) = fake();
        let h = harness(prefs(false), vec![provider]);

        handle.reply(Err(ProviderError::Auth("bad key".into())));
        assert_eq!(h.session.send_message(hi()).await, None);
        assert_eq!(h.reporter.kinds(), vec![ErrorKind::Auth]);
        assert!(!h.session.is_generating());
    }

    #[tokio::test]
    async fn non_streaming_reply_after_stop_is_discarded() {
        let (provider, mut handle) = fake();
        let h = harness(prefs(false), vec![provider]);

        let turn = h.session.send_message(hi());
        tokio::pin!(turn);
        assert!(futures::poll!(&mut turn).is_pending());
        h.session.stop_generation();
        handle.reply(Ok(ChatResponse { content: "late".into(), finish_reason: None }));
        assert_eq!(turn.await, None);
        assert!(h.reporter.kinds().is_empty());
    }

    #[tokio::test]
    async fn missing_api_key_is_reported_without_a_request() {
        let h = harness(Preferences::default(), vec![]);
        assert_eq!(h.session.send_message(hi()).await, None);
        assert_eq!(h.reporter.kinds(), vec![ErrorKind::Auth]);
        assert!(h.configs.lock().unwrap().is_empty());
        assert!(!h.session.is_generating());
    }
}
