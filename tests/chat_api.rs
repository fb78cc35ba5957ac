use std::{path::PathBuf, sync::Arc, time::Duration};

use gemchat::{
    backend::mock::{MockBackend, MockReply},
    Chat, ChatError, Credential, HistoryEntry, Part,
};
use tempfile::TempDir;
use tokio::time::timeout;

const NO_IMAGES: &[PathBuf] = &[];

async fn started_chat(backend: &MockBackend) -> Chat {
    let chat = Chat::new(Arc::new(backend.clone()));
    chat.start("M", Credential::new("K"))
        .await
        .expect("chat should start");
    chat
}

#[tokio::test]
async fn single_turn_reply_and_history() {
    let backend = MockBackend::default().with_reply(MockReply::Text("hello".to_owned()));
    let chat = started_chat(&backend).await;

    let answer = chat.send_message("hi", NO_IMAGES).await.expect("send");
    assert_eq!(answer, "hello");

    let history = chat.get_history().await;
    assert_eq!(
        history,
        vec![
            HistoryEntry {
                role: "user".to_owned(),
                answer: "hi".to_owned(),
            },
            HistoryEntry {
                role: "model".to_owned(),
                answer: "hello".to_owned(),
            },
        ]
    );
    assert_eq!(chat.get_history().await, history);
}

#[tokio::test]
async fn image_parts_use_lowercase_format_without_dot() {
    let dir = TempDir::new().expect("temp dir");
    let image = dir.path().join("a.PNG");
    std::fs::write(&image, b"\x89PNG").expect("fixture");

    let backend = MockBackend::default();
    let chat = started_chat(&backend).await;
    chat.send_message("desc", &[image]).await.expect("send");

    assert_eq!(
        backend.recorded_requests(),
        vec![vec![
            Part::text("desc"),
            Part::image("png", b"\x89PNG".to_vec()),
        ]]
    );

    let history = chat.get_history().await;
    assert_eq!(history[0].answer, "desc");
}

#[tokio::test]
async fn stream_delivers_chunks_then_closes() {
    let backend = MockBackend::default().with_reply(MockReply::Chunks(vec![
        "1".to_owned(),
        "2".to_owned(),
        "3".to_owned(),
    ]));
    let chat = started_chat(&backend).await;

    let mut stream = chat
        .send_message_stream("go", NO_IMAGES)
        .await
        .expect("stream");
    let mut answers = Vec::new();
    while let Some(chunk) = stream.recv().await {
        assert!(chunk.error.is_none());
        answers.push(chunk.answer);
    }

    assert_eq!(answers, vec!["1", "2", "3"]);
    let history = chat.get_history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].answer, "123");
}

#[tokio::test]
async fn stream_error_is_last_chunk() {
    let backend = MockBackend::default().with_reply(MockReply::ChunksThenError {
        chunks: vec!["1".to_owned()],
        error: "connection reset".to_owned(),
    });
    let chat = started_chat(&backend).await;

    let mut stream = chat
        .send_message_stream("go", NO_IMAGES)
        .await
        .expect("stream");

    let first = stream.recv().await.expect("first chunk");
    assert_eq!(first.answer, "1");
    assert!(first.error.is_none());

    let failure = stream.recv().await.expect("error chunk");
    assert!(matches!(failure.error, Some(ChatError::Stream(_))));
    assert!(stream.recv().await.is_none());

    assert!(chat.is_running().await);
    assert!(chat.get_history().await.is_empty());
    let answer = chat.send_message("again", NO_IMAGES).await.expect("send");
    assert_eq!(answer, "Mock response for model M: again");
}

#[tokio::test]
async fn stop_mid_stream_closes_channel() {
    let backend = MockBackend::default().with_reply(MockReply::Endless("tick".to_owned()));
    let chat = started_chat(&backend).await;

    let mut stream = chat
        .send_message_stream("go", NO_IMAGES)
        .await
        .expect("stream");
    let first = stream.recv().await.expect("first chunk");
    assert_eq!(first.answer, "tick");

    timeout(Duration::from_secs(1), chat.stop())
        .await
        .expect("stop should not hang");
    let after = timeout(Duration::from_secs(1), stream.recv())
        .await
        .expect("channel should close promptly");
    assert!(after.is_none());

    assert!(!chat.is_running().await);
    assert_eq!(backend.open_clients(), 0);
}

#[tokio::test]
async fn stopped_chat_reports_not_running() {
    let chat = Chat::new(Arc::new(MockBackend::default()));

    let error = chat
        .send_message("hi", NO_IMAGES)
        .await
        .expect_err("stopped chat should reject");
    assert_eq!(error.to_string(), "Please call the Start method first.");
    assert!(!chat.is_running().await);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let backend = MockBackend::default();
    let chat = started_chat(&backend).await;

    chat.stop().await;
    chat.stop().await;

    assert_eq!(backend.open_clients(), 0);
    assert!(chat.get_history().await.is_empty());
    assert!(chat.model().await.is_none());
}

#[tokio::test]
async fn turns_accumulate_in_order() {
    let backend = MockBackend::default();
    let chat = started_chat(&backend).await;

    chat.send_message("one", NO_IMAGES).await.expect("first turn");
    chat.send_message("two", NO_IMAGES).await.expect("second turn");

    let roles = chat
        .get_history()
        .await
        .into_iter()
        .map(|entry| entry.role)
        .collect::<Vec<_>>();
    assert_eq!(roles, vec!["user", "model", "user", "model"]);
}

#[tokio::test]
async fn one_shot_query_round_trip() {
    let backend = MockBackend::default().with_reply(MockReply::Text("forty-two".to_owned()));
    let answer = gemchat::query(
        Arc::new(backend.clone()),
        "M",
        Credential::new("K"),
        "meaning?",
        NO_IMAGES,
    )
    .await
    .expect("query");

    assert_eq!(answer, "forty-two");
    assert_eq!(backend.open_clients(), 0);
}
