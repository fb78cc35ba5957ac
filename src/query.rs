use std::{path::Path, sync::Arc};

use tracing::debug;

use crate::{
    auth::Credential, backend::GenerativeBackend, chat::Chat, errors::ChatError,
    stream::ChatStream,
};

/// Single-turn generation with a chat of its own. The client is released
/// on every exit path.
pub async fn query<P>(
    backend: Arc<dyn GenerativeBackend>,
    model: &str,
    credential: Credential,
    text: &str,
    images: &[P],
) -> Result<String, ChatError>
where
    P: AsRef<Path>,
{
    let chat = Chat::from_dyn(backend);
    chat.start(model, credential).await?;
    let result = chat.send_message(text, images).await;
    chat.stop().await;
    result
}

/// Streaming variant of [`query`]. The client stays alive until the returned
/// stream has ended (or been dropped) and is released right after.
pub async fn query_stream<P>(
    backend: Arc<dyn GenerativeBackend>,
    model: &str,
    credential: Credential,
    text: &str,
    images: &[P],
) -> Result<ChatStream, ChatError>
where
    P: AsRef<Path>,
{
    let chat = Chat::from_dyn(backend);
    chat.start(model, credential).await?;
    let stream = match chat.send_message_stream(text, images).await {
        Ok(stream) => stream,
        Err(error) => {
            chat.stop().await;
            return Err(error);
        }
    };

    tokio::spawn(async move {
        chat.wait_for_stream().await;
        chat.stop().await;
        debug!("one-shot stream released its client");
    });
    Ok(stream)
}
