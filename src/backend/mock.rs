use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::{
    auth::Credential,
    backend::{
        reply_content, BackendError, ChatSession, GenerativeBackend, GenerativeClient,
        ResponseStream, Transcript,
    },
    models::{Content, GenerateContentResponse, GenerationConfig, Part},
};

/// Scripted outcome for the next turn of any mock session.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Whole reply; streamed word by word.
    Text(String),
    /// One response per entry, in order.
    Chunks(Vec<String>),
    /// Streams `chunks`, then fails mid-stream with `error`.
    ChunksThenError { chunks: Vec<String>, error: String },
    /// The call fails before any content is produced.
    Unavailable(String),
    /// The prompt is rejected by the safety filter.
    Blocked(String),
    /// Streams `tick` forever; only cancellation or a dropped consumer ends it.
    Endless(String),
}

#[derive(Debug, Default)]
struct MockState {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<Vec<Part>>>,
    open_clients: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    known_models: Option<Vec<String>>,
    chunk_delay: Duration,
    state: Arc<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            name: "mock-backend".to_owned(),
            known_models: None,
            chunk_delay: Duration::from_millis(5),
            state: Arc::new(MockState::default()),
        }
    }
}

impl MockBackend {
    pub fn with_reply(self, reply: MockReply) -> Self {
        self.state.replies.lock().push_back(reply);
        self
    }

    pub fn with_known_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Parts of every submitted turn, in submission order.
    pub fn recorded_requests(&self) -> Vec<Vec<Part>> {
        self.state.requests.lock().clone()
    }

    pub fn open_clients(&self) -> usize {
        self.state.open_clients.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn GenerativeClient>, BackendError> {
        if credential.is_empty() {
            return Err(BackendError::Unauthorized("missing credential".to_owned()));
        }

        self.state.open_clients.fetch_add(1, Ordering::SeqCst);
        debug!(backend = %self.name, credential = %credential, "mock client connected");
        Ok(Box::new(MockClient {
            known_models: self.known_models.clone(),
            chunk_delay: self.chunk_delay,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockClient {
    known_models: Option<Vec<String>>,
    chunk_delay: Duration,
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl GenerativeClient for MockClient {
    async fn start_chat(
        &self,
        model: &str,
        _generation: &GenerationConfig,
    ) -> Result<Box<dyn ChatSession>, BackendError> {
        if let Some(known) = &self.known_models {
            if !known.iter().any(|name| name == model) {
                return Err(BackendError::ModelNotFound(model.to_owned()));
            }
        }

        Ok(Box::new(MockSession {
            model: model.to_owned(),
            chunk_delay: self.chunk_delay,
            state: self.state.clone(),
            transcript: Transcript::default(),
        }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MockSession {
    model: String,
    chunk_delay: Duration,
    state: Arc<MockState>,
    transcript: Transcript,
}

impl MockSession {
    fn next_reply(&self, parts: &[Part]) -> MockReply {
        self.state.requests.lock().push(parts.to_vec());
        self.state
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockReply::Text(render_response(&self.model, parts)))
    }
}

#[async_trait]
impl ChatSession for MockSession {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &mut self,
        parts: Vec<Part>,
    ) -> Result<GenerateContentResponse, BackendError> {
        let response = match self.next_reply(&parts) {
            MockReply::Text(text) | MockReply::Endless(text) => {
                GenerateContentResponse::from_text(text)
            }
            MockReply::Chunks(chunks) => GenerateContentResponse::from_text(chunks.concat()),
            MockReply::ChunksThenError { error, .. } | MockReply::Unavailable(error) => {
                return Err(BackendError::Unavailable(error));
            }
            MockReply::Blocked(reason) => return Err(BackendError::Blocked(reason)),
        };

        self.transcript
            .record_turn(Content::user(parts), reply_content(&response));
        Ok(response)
    }

    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<ResponseStream, BackendError> {
        let (chunks, failure, endless) = match self.next_reply(&parts) {
            MockReply::Text(text) => (split_for_stream(&text), None, None),
            MockReply::Chunks(chunks) => (chunks, None, None),
            MockReply::ChunksThenError { chunks, error } => (chunks, Some(error), None),
            MockReply::Endless(tick) => (Vec::new(), None, Some(tick)),
            MockReply::Unavailable(error) => return Err(BackendError::Unavailable(error)),
            MockReply::Blocked(reason) => return Err(BackendError::Blocked(reason)),
        };
        let delay = self.chunk_delay;

        let upstream = async_stream::stream! {
            for chunk in chunks {
                sleep(delay).await;
                yield Ok(GenerateContentResponse::from_text(chunk));
            }
            if let Some(error) = failure {
                sleep(delay).await;
                yield Err(BackendError::Unavailable(error));
            }
            if let Some(tick) = endless {
                loop {
                    sleep(delay).await;
                    yield Ok(GenerateContentResponse::from_text(tick.clone()));
                }
            }
        };

        debug!(model = %self.model, "mock stream prepared");
        Ok(self
            .transcript
            .record_stream(Content::user(parts), upstream.boxed()))
    }

    fn history(&self) -> Vec<Content> {
        self.transcript.snapshot()
    }
}

fn render_response(model: &str, parts: &[Part]) -> String {
    let prompt = parts
        .iter()
        .filter_map(Part::as_text)
        .collect::<String>();
    let prompt = if prompt.trim().is_empty() {
        "hello".to_owned()
    } else {
        prompt
    };
    let images = parts.iter().filter(|part| part.as_text().is_none()).count();

    if images == 0 {
        format!("Mock response for model {model}: {prompt}")
    } else {
        format!("Mock response for model {model} with {images} image(s): {prompt}")
    }
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_spacing_between_tokens() {
        assert_eq!(
            split_for_stream("one two three"),
            vec!["one ".to_owned(), "two ".to_owned(), "three".to_owned()]
        );
    }

    #[tokio::test]
    async fn empty_credential_is_rejected() {
        let backend = MockBackend::default();
        let result = backend.connect(&Credential::new("")).await;
        assert!(matches!(result, Err(BackendError::Unauthorized(_))));
        assert_eq!(backend.open_clients(), 0);
    }

    #[tokio::test]
    async fn close_releases_client_once() {
        let backend = MockBackend::default();
        let client = backend
            .connect(&Credential::new("key"))
            .await
            .expect("mock connect");
        assert_eq!(backend.open_clients(), 1);

        client.close().await;
        client.close().await;
        assert_eq!(backend.open_clients(), 0);
    }

    #[tokio::test]
    async fn unknown_models_are_rejected() {
        let backend = MockBackend::default().with_known_models(["gemini-pro"]);
        let client = backend
            .connect(&Credential::new("key"))
            .await
            .expect("mock connect");

        let result = client
            .start_chat("gemini-ultra", &GenerationConfig::default())
            .await;
        assert!(matches!(result, Err(BackendError::ModelNotFound(model)) if model == "gemini-ultra"));
    }
}
