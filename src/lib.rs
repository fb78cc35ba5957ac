//! Multi-turn chat over a generative model, with text and image turns and
//! streamed replies.
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//!
//! use gemchat::{backend::gemini::GeminiBackend, Chat, Credential};
//!
//! # async fn run() -> Result<(), gemchat::ChatError> {
//! let chat = Chat::new(Arc::new(GeminiBackend::from_env()));
//! chat.start("gemini-1.5-flash", Credential::new("api-key")).await?;
//!
//! let answer = chat.send_message("Describe this", &[PathBuf::from("cat.png")]).await?;
//! println!("{answer}");
//!
//! let mut stream = chat.send_message_stream::<PathBuf>("And in one word?", &[]).await?;
//! while let Some(chunk) = stream.recv().await {
//!     print!("{}", chunk.into_result()?);
//! }
//!
//! chat.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backend;
pub mod chat;
pub mod decoder;
pub mod errors;
pub mod models;
pub mod parts;
pub mod query;
pub mod stream;

pub use auth::Credential;
pub use chat::Chat;
pub use errors::ChatError;
pub use models::{GenerationConfig, HistoryEntry, Part, StreamChunk};
pub use query::{query, query_stream};
pub use stream::ChatStream;
