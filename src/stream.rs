//! Bridges a pulled response stream into a pushed channel of [`StreamChunk`]s.
//!
//! A single background task owns the only sender. It stops, and thereby
//! closes the channel, on end of stream, on the first error (after delivering
//! it as one error chunk), on cancellation, or when the consumer goes away.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{future::BoxFuture, FutureExt, Stream, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backend::ResponseStream, decoder::decode_response, errors::ChatError, models::StreamChunk,
};

const CHANNEL_CAPACITY: usize = 1;

/// Receiving end of a streaming reply.
///
/// Yields answer chunks in backend order, at most one error chunk, then
/// `None`. Once the producing turn is cancelled nothing further is yielded,
/// even a chunk that was already buffered.
#[derive(Debug)]
pub struct ChatStream {
    inner: ReceiverStream<StreamChunk>,
    cancel: CancellationToken,
}

impl ChatStream {
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.next().await
    }

    /// Drains the stream into the full answer, or the error chunk's error.
    pub async fn collect_answer(mut self) -> Result<String, ChatError> {
        let mut answer = String::new();
        while let Some(chunk) = self.recv().await {
            answer.push_str(&chunk.into_result()?);
        }
        Ok(answer)
    }
}

impl Stream for ChatStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            self.inner.close();
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Producer side of one streaming turn.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    finished: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the producer has exited. Does not borrow the handle, so
    /// it can be awaited while the handle stays reachable for cancellation.
    pub fn finished(&self) -> BoxFuture<'static, ()> {
        let finished = self.finished.clone();
        async move { finished.cancelled().await }.boxed()
    }

    /// Waits for the producer to exit on its own.
    pub async fn wait(self) {
        if let Err(error) = self.task.await {
            warn!(error = %error, "stream task ended abnormally");
        }
    }

    /// Cancels the producer and waits until its channel is closed.
    pub async fn cancel_and_wait(self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

/// Spawns the producer task for `upstream`; `cancel` aborts the pending pull
/// or send and closes the channel.
pub fn spawn_stream_adapter(
    upstream: ResponseStream,
    cancel: CancellationToken,
) -> (ChatStream, StreamHandle) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let token = cancel.clone();
    let finished = CancellationToken::new();
    let finished_guard = finished.clone().drop_guard();

    let task = tokio::spawn(async move {
        let _finished = finished_guard;
        let mut upstream = upstream;
        let mut delivered = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(delivered, "stream cancelled");
                    break;
                }
                _ = tx.closed() => {
                    debug!(delivered, "stream consumer gone");
                    break;
                }
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(response)) => {
                    let chunk = StreamChunk::answer(decode_response(Some(&response)));
                    if !deliver(&tx, &token, chunk).await {
                        debug!(delivered, "stream consumer gone");
                        break;
                    }
                    delivered += 1;
                }
                Some(Err(error)) => {
                    warn!(error = %error, delivered, "stream ended with error");
                    deliver(&tx, &token, StreamChunk::error(ChatError::from_stream(error))).await;
                    break;
                }
                None => {
                    debug!(delivered, "stream completed");
                    break;
                }
            }
        }
    });

    (
        ChatStream {
            inner: ReceiverStream::new(rx),
            cancel: cancel.clone(),
        },
        StreamHandle {
            cancel,
            finished,
            task,
        },
    )
}

async fn deliver(
    tx: &mpsc::Sender<StreamChunk>,
    token: &CancellationToken,
    chunk: StreamChunk,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

/// A stream that yields a single error chunk and closes.
pub(crate) fn failed_stream(error: ChatError) -> ChatStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    // capacity 1 guarantees room for the only item
    let _ = tx.try_send(StreamChunk::error(error));
    ChatStream {
        inner: ReceiverStream::new(rx),
        cancel: CancellationToken::new(),
    }
}
