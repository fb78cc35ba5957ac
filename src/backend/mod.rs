pub mod gemini;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    auth::Credential,
    models::{Content, GenerateContentResponse, GenerationConfig, Part},
};

pub type ResponseStream = BoxStream<'static, Result<GenerateContentResponse, BackendError>>;

/// Entry point of an underlying generative client library.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn GenerativeClient>, BackendError>;
}

/// Authenticated client handle; released with [`GenerativeClient::close`].
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn start_chat(
        &self,
        model: &str,
        generation: &GenerationConfig,
    ) -> Result<Box<dyn ChatSession>, BackendError>;
    async fn close(&self);
}

/// A serial conversation. Implementations append a turn to the transcript
/// only once the model reply has fully arrived.
#[async_trait]
pub trait ChatSession: Send + Sync {
    fn model(&self) -> &str;
    async fn send_message(
        &mut self,
        parts: Vec<Part>,
    ) -> Result<GenerateContentResponse, BackendError>;
    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<ResponseStream, BackendError>;
    fn history(&self) -> Vec<Content>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("response blocked: {0}")]
    Blocked(String),
}

/// Append-only conversation log shared between a session and the streams it
/// hands out.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Arc<RwLock<Vec<Content>>>,
}

impl Transcript {
    pub fn snapshot(&self) -> Vec<Content> {
        self.turns.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }

    pub fn record_turn(&self, user: Content, reply: Content) {
        let mut turns = self.turns.write();
        turns.push(user);
        turns.push(reply);
    }

    /// Recorded turns followed by `pending`, as sent to the service.
    pub fn with_pending(&self, pending: &Content) -> Vec<Content> {
        let mut contents = self.snapshot();
        contents.push(pending.clone());
        contents
    }

    /// Passes `upstream` through and records the turn once it ends cleanly.
    /// A failed or abandoned stream leaves the transcript untouched.
    pub fn record_stream(&self, user: Content, upstream: ResponseStream) -> ResponseStream {
        let transcript = self.clone();
        let stream = async_stream::stream! {
            let mut upstream = upstream;
            let mut merged = Vec::new();
            while let Some(next) = upstream.next().await {
                match next {
                    Ok(response) => {
                        collect_first_candidate(&response, &mut merged);
                        yield Ok(response);
                    }
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }
            transcript.record_turn(user, Content::model(merge_text_parts(merged)));
        };
        stream.boxed()
    }
}

/// Model content of the first candidate, or an empty model turn.
pub fn reply_content(response: &GenerateContentResponse) -> Content {
    response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.clone())
        .map(|mut content| {
            content.role = crate::models::MODEL_ROLE.to_owned();
            content
        })
        .unwrap_or_else(|| Content::model(Vec::new()))
}

fn collect_first_candidate(response: &GenerateContentResponse, merged: &mut Vec<Part>) {
    if let Some(content) = response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
    {
        merged.extend(content.parts.iter().cloned());
    }
}

fn merge_text_parts(parts: Vec<Part>) -> Vec<Part> {
    let mut merged: Vec<Part> = Vec::with_capacity(parts.len());
    for part in parts {
        match (merged.last_mut(), part) {
            (Some(Part::Text(previous)), Part::Text(text)) => previous.push_str(&text),
            (_, part) => merged.push(part),
        }
    }
    merged
}
