use std::{mem, path::Path, sync::Arc};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::Credential,
    backend::{ChatSession, GenerativeBackend, GenerativeClient},
    decoder::decode_response,
    errors::ChatError,
    models::{GenerationConfig, HistoryEntry},
    parts::build_parts,
    stream::{failed_stream, spawn_stream_adapter, ChatStream, StreamHandle},
};

/// A single multi-turn conversation with a generative model.
///
/// The chat starts out stopped. [`Chat::start`] connects a client and opens a
/// session; [`Chat::stop`] releases both. Turns are serialized: a send waits
/// for the previous turn, including a streamed one, to finish first. A
/// streamed turn finishes once its [`ChatStream`] is drained or dropped, or
/// once the chat is stopped. A send that is still waiting when the chat stops
/// fails with [`ChatError::NotRunning`].
pub struct Chat {
    backend: Arc<dyn GenerativeBackend>,
    generation: GenerationConfig,
    // Held for a whole turn. `state` is only held for short sections and never
    // while waiting on a previous stream, so stop and history stay responsive.
    turn: Mutex<()>,
    state: Mutex<ChatState>,
}

enum ChatState {
    Stopped,
    Running(Box<RunningChat>),
}

impl ChatState {
    fn running_mut(&mut self) -> Result<&mut RunningChat, ChatError> {
        match self {
            ChatState::Running(running) => Ok(running),
            ChatState::Stopped => Err(ChatError::NotRunning),
        }
    }
}

struct RunningChat {
    session_id: String,
    client: Box<dyn GenerativeClient>,
    session: Box<dyn ChatSession>,
    active_stream: Option<StreamHandle>,
}

impl RunningChat {
    fn pending_stream(&self) -> Option<BoxFuture<'static, ()>> {
        let handle = self.active_stream.as_ref()?;
        debug!(session_id = %self.session_id, "waiting for previous streamed turn");
        Some(handle.finished())
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.active_stream.take() {
            handle.cancel_and_wait().await;
        }
        let RunningChat {
            session_id,
            client,
            session,
            ..
        } = self;
        drop(session);
        client.close().await;
        info!(session_id = %session_id, "chat stopped");
    }
}

impl Chat {
    pub fn new<B>(backend: Arc<B>) -> Self
    where
        B: GenerativeBackend + 'static,
    {
        let backend: Arc<dyn GenerativeBackend> = backend;
        Self::from_dyn(backend)
    }

    pub fn from_dyn(backend: Arc<dyn GenerativeBackend>) -> Self {
        Self {
            backend,
            generation: GenerationConfig::default(),
            turn: Mutex::new(()),
            state: Mutex::new(ChatState::Stopped),
        }
    }

    /// Sampling settings used by sessions opened after this call.
    pub fn with_generation_config(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Connects a client, resolves `model` and opens a fresh session.
    ///
    /// Starting a running chat first releases the current client and session.
    /// On failure the chat is left stopped.
    pub async fn start(&self, model: &str, credential: Credential) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        if let ChatState::Running(previous) = mem::replace(&mut *state, ChatState::Stopped) {
            info!(session_id = %previous.session_id, "restarting running chat");
            (*previous).shutdown().await;
        }

        let client = self.backend.connect(&credential).await.map_err(|error| {
            warn!(backend = self.backend.name(), error = %error, "client connect failed");
            ChatError::from(error)
        })?;
        let session = match client.start_chat(model, &self.generation).await {
            Ok(session) => session,
            Err(error) => {
                warn!(backend = self.backend.name(), model, error = %error, "chat session failed to open");
                client.close().await;
                return Err(error.into());
            }
        };

        let session_id = format!("chat_{}", Uuid::new_v4());
        info!(
            session_id = %session_id,
            backend = self.backend.name(),
            model = session.model(),
            "chat started"
        );
        *state = ChatState::Running(Box::new(RunningChat {
            session_id,
            client,
            session,
            active_stream: None,
        }));
        Ok(())
    }

    /// Cancels any in-flight stream, then releases the session and client.
    /// Stopping a stopped chat does nothing.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let ChatState::Running(running) = mem::replace(&mut *state, ChatState::Stopped) {
            (*running).shutdown().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ChatState::Running(_))
    }

    pub async fn model(&self) -> Option<String> {
        match &*self.state.lock().await {
            ChatState::Running(running) => Some(running.session.model().to_owned()),
            ChatState::Stopped => None,
        }
    }

    /// Sends one turn and waits for the whole reply.
    pub async fn send_message<P>(&self, text: &str, images: &[P]) -> Result<String, ChatError>
    where
        P: AsRef<Path>,
    {
        let _turn = self.turn.lock().await;
        let previous = self.previous_turn().await?;
        let parts = build_parts(text, images).await?;
        if let Some(previous) = previous {
            previous.await;
        }

        let mut state = self.state.lock().await;
        let running = state.running_mut()?;
        running.active_stream = None;
        debug!(session_id = %running.session_id, parts = parts.len(), "sending turn");
        let response = running.session.send_message(parts).await.map_err(|error| {
            warn!(session_id = %running.session_id, error = %error, "turn failed");
            ChatError::from(error)
        })?;
        Ok(decode_response(Some(&response)))
    }

    /// Sends one turn and returns its reply as a stream of chunks.
    ///
    /// Stopped chats and unreadable images fail here; failures of the remote
    /// call arrive as the stream's single error chunk.
    pub async fn send_message_stream<P>(
        &self,
        text: &str,
        images: &[P],
    ) -> Result<ChatStream, ChatError>
    where
        P: AsRef<Path>,
    {
        let _turn = self.turn.lock().await;
        let previous = self.previous_turn().await?;
        let parts = build_parts(text, images).await?;
        if let Some(previous) = previous {
            previous.await;
        }

        let mut state = self.state.lock().await;
        let running = state.running_mut()?;
        running.active_stream = None;
        debug!(session_id = %running.session_id, parts = parts.len(), "sending streamed turn");
        let upstream = match running.session.send_message_stream(parts).await {
            Ok(upstream) => upstream,
            Err(error) => {
                warn!(session_id = %running.session_id, error = %error, "stream failed to open");
                return Ok(failed_stream(error.into()));
            }
        };

        let (stream, handle) = spawn_stream_adapter(upstream, CancellationToken::new());
        running.active_stream = Some(handle);
        Ok(stream)
    }

    /// Snapshot of the completed turns, text only. Empty when stopped.
    pub async fn get_history(&self) -> Vec<HistoryEntry> {
        match &*self.state.lock().await {
            ChatState::Running(running) => running
                .session
                .history()
                .iter()
                .map(HistoryEntry::from)
                .collect(),
            ChatState::Stopped => Vec::new(),
        }
    }

    /// Checks the chat is running and returns the end of the previous
    /// streamed turn, if one is still open. The state lock is released before
    /// the caller waits on it.
    async fn previous_turn(&self) -> Result<Option<BoxFuture<'static, ()>>, ChatError> {
        let mut state = self.state.lock().await;
        Ok(state.running_mut()?.pending_stream())
    }

    /// Waits for the current streamed turn, if any, to end on its own.
    pub(crate) async fn wait_for_stream(&self) {
        let pending = match &*self.state.lock().await {
            ChatState::Running(running) => running.pending_stream(),
            ChatState::Stopped => None,
        };
        if let Some(pending) = pending {
            pending.await;
        }
    }
}

impl Drop for Chat {
    fn drop(&mut self) {
        if let ChatState::Running(running) = self.state.get_mut() {
            if let Some(handle) = &running.active_stream {
                handle.cancel();
            }
            debug!(session_id = %running.session_id, "chat dropped while running");
        }
    }
}
