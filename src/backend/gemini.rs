use std::{env, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    auth::Credential,
    backend::{
        reply_content, BackendError, ChatSession, GenerativeBackend, GenerativeClient,
        ResponseStream, Transcript,
    },
    models::{Content, GenerateContentResponse, GenerationConfig, Part},
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        let base_url = env::var("GEMINI_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let timeout_secs = env::var("GEMINI_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60);

        Self {
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Generative Language REST backend.
#[derive(Debug, Clone, Default)]
pub struct GeminiBackend {
    config: GeminiConfig,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(GeminiConfig::from_env())
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn GenerativeClient>, BackendError> {
        if credential.is_empty() {
            return Err(BackendError::Unauthorized("missing api key".to_owned()));
        }

        let http = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .build()
            .map_err(|error| {
                BackendError::Unavailable(format!("failed to build Gemini HTTP client: {error}"))
            })?;

        debug!(base_url = %self.config.base_url, credential = %credential, "gemini client created");
        Ok(Box::new(GeminiClient {
            api: GeminiApi {
                http,
                api_key: credential.expose().to_owned(),
                base_url: self.config.base_url.clone(),
            },
        }))
    }
}

#[derive(Clone)]
struct GeminiApi {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiApi {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn resolve_model(&self, model: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .get(self.url(&format!("models/{model}")))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::ModelNotFound(model.to_owned())),
            status => Err(map_http_error(status, read_error_body(response).await)),
        }
    }

    async fn post(
        &self,
        path: &str,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .http
            .post(self.url(path))
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(map_http_error(status, read_error_body(response).await));
        }
        Ok(response)
    }
}

struct GeminiClient {
    api: GeminiApi,
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    async fn start_chat(
        &self,
        model: &str,
        generation: &GenerationConfig,
    ) -> Result<Box<dyn ChatSession>, BackendError> {
        let model = model.trim_start_matches("models/");
        self.api.resolve_model(model).await?;

        Ok(Box::new(GeminiSession {
            api: self.api.clone(),
            model: model.to_owned(),
            generation: generation.clone(),
            transcript: Transcript::default(),
        }))
    }

    async fn close(&self) {
        debug!("gemini client closed");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "GenerationConfig::is_empty")]
    generation_config: GenerationConfig,
}

struct GeminiSession {
    api: GeminiApi,
    model: String,
    generation: GenerationConfig,
    transcript: Transcript,
}

impl GeminiSession {
    fn request_for(&self, pending: &Content) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self.transcript.with_pending(pending),
            generation_config: self.generation.clone(),
        }
    }
}

#[async_trait]
impl ChatSession for GeminiSession {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &mut self,
        parts: Vec<Part>,
    ) -> Result<GenerateContentResponse, BackendError> {
        let user = Content::user(parts);
        let request = self.request_for(&user);
        let response = self
            .api
            .post(&format!("models/{}:generateContent", self.model), &request)
            .await?;

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        if let Some(reason) = parsed.block_reason() {
            return Err(BackendError::Blocked(reason.to_owned()));
        }

        self.transcript.record_turn(user, reply_content(&parsed));
        Ok(parsed)
    }

    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<ResponseStream, BackendError> {
        let user = Content::user(parts);
        let request = self.request_for(&user);
        let response = self
            .api
            .post(
                &format!("models/{}:streamGenerateContent?alt=sse", self.model),
                &request,
            )
            .await?;

        let mut upstream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();

        let stream = async_stream::stream! {
            while let Some(next) = upstream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(map_transport_error(error));
                        return;
                    }
                };

                buffer.push(&bytes);
                while let Some(line) = buffer.next_line() {
                    match parse_buffered_line(line) {
                        Some(Ok(parsed)) => {
                            yield Ok(parsed);
                        }
                        Some(Err(error)) => {
                            yield Err(error);
                            return;
                        }
                        None => {}
                    }
                }
            }

            match buffer.finish().and_then(parse_buffered_line) {
                Some(Ok(parsed)) => {
                    yield Ok(parsed);
                }
                Some(Err(error)) => {
                    yield Err(error);
                }
                None => {}
            }
        };

        debug!(model = %self.model, "gemini stream prepared");
        Ok(self.transcript.record_stream(user, stream.boxed()))
    }

    fn history(&self) -> Vec<Content> {
        self.transcript.snapshot()
    }
}

/// Raw SSE bytes waiting to form complete lines. Lines are only decoded once
/// whole, so a multibyte character may span network chunks.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Result<String, BackendError>> {
        let index = self.pending.iter().position(|byte| *byte == b'\n')?;
        let line = self.pending.drain(..=index).collect::<Vec<_>>();
        Some(decode_line(&line[..index]))
    }

    /// Whatever is left after the body ended without a final newline.
    fn finish(&mut self) -> Option<Result<String, BackendError>> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> Result<String, BackendError> {
    std::str::from_utf8(bytes)
        .map(|line| line.trim().to_owned())
        .map_err(|error| BackendError::InvalidResponse(error.to_string()))
}

fn parse_buffered_line(
    line: Result<String, BackendError>,
) -> Option<Result<GenerateContentResponse, BackendError>> {
    match line {
        Ok(line) => parse_sse_line(&line),
        Err(error) => Some(Err(error)),
    }
}

fn parse_sse_line(line: &str) -> Option<Result<GenerateContentResponse, BackendError>> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }

    let parsed = match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(parsed) => parsed,
        Err(error) => return Some(Err(BackendError::InvalidResponse(error.to_string()))),
    };
    if let Some(reason) = parsed.block_reason() {
        return Some(Err(BackendError::Blocked(reason.to_owned())));
    }
    Some(Ok(parsed))
}

fn map_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Unavailable(error.to_string())
    }
}

async fn read_error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "unknown backend error".to_owned())
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    warn!(status = status.as_u16(), "gemini request failed");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unauthorized(format!("status {}: {trimmed}", status.as_u16()))
        }
        StatusCode::BAD_REQUEST => BackendError::InvalidRequest(trimmed),
        StatusCode::NOT_FOUND => BackendError::ModelNotFound(trimmed),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Unavailable(format!("rate limited: {trimmed}"))
        }
        status if status.is_server_error() => {
            BackendError::Unavailable(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => BackendError::InvalidResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}
