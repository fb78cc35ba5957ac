use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::errors::ChatError;

pub const USER_ROLE: &str = "user";
pub const MODEL_ROLE: &str = "model";

/// One unit of request or response content.
///
/// `format` is the lowercased image file extension without a leading dot
/// (`"png"`, `"jpeg"`); it travels to the service as `image/<format>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WirePart", try_from = "WirePart")]
pub enum Part {
    Text(String),
    Image { format: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn image(format: impl Into<String>, data: Vec<u8>) -> Self {
        Part::Image {
            format: format.into(),
            data,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            Part::Image { .. } => None,
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Part::Text(text) => f.write_str(text),
            Part::Image { format, data } => write!(f, "[image/{format}; {} bytes]", data.len()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

impl From<Part> for WirePart {
    fn from(part: Part) -> Self {
        match part {
            Part::Text(text) => WirePart {
                text: Some(text),
                inline_data: None,
            },
            Part::Image { format, data } => WirePart {
                text: None,
                inline_data: Some(WireBlob {
                    mime_type: format!("image/{format}"),
                    data: BASE64_STANDARD.encode(data),
                }),
            },
        }
    }
}

impl TryFrom<WirePart> for Part {
    type Error = String;

    fn try_from(wire: WirePart) -> Result<Self, Self::Error> {
        if let Some(text) = wire.text {
            return Ok(Part::Text(text));
        }
        let Some(blob) = wire.inline_data else {
            return Err("part carries neither text nor inline data".to_owned());
        };
        let data = BASE64_STANDARD
            .decode(blob.data.as_bytes())
            .map_err(|error| format!("invalid inline data: {error}"))?;
        let format = blob
            .mime_type
            .strip_prefix("image/")
            .unwrap_or(&blob.mime_type)
            .to_owned();
        Ok(Part::Image { format, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: USER_ROLE.to_owned(),
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: MODEL_ROLE.to_owned(),
            parts,
        }
    }

    /// Concatenated text of the text parts; images are skipped.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<PromptFeedback>,
}

impl GenerateContentResponse {
    /// A single-candidate model reply with one text part.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content::model(vec![Part::text(text)])),
                finish_reason: Some("STOP".to_owned()),
            }],
            ..Self::default()
        }
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl GenerationConfig {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Read-only view of one transcript turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: String,
    pub answer: String,
}

impl From<&Content> for HistoryEntry {
    fn from(content: &Content) -> Self {
        Self {
            role: content.role.clone(),
            answer: content.text(),
        }
    }
}

/// One item delivered over a streaming reply.
#[derive(Debug)]
pub struct StreamChunk {
    pub answer: String,
    pub error: Option<ChatError>,
}

impl StreamChunk {
    pub fn answer(answer: String) -> Self {
        Self {
            answer,
            error: None,
        }
    }

    pub fn error(error: ChatError) -> Self {
        Self {
            answer: String::new(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<String, ChatError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.answer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_parts_serialize_as_inline_data() {
        let part = Part::image("png", vec![1, 2, 3]);
        let value = serde_json::to_value(&part).expect("part should serialize");

        assert_eq!(value["inlineData"]["mimeType"], "image/png");
        assert_eq!(value["inlineData"]["data"], "AQID");
        assert!(value.get("text").is_none());
    }

    #[test]
    fn response_parses_candidates_and_usage() {
        let body = r#"{
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "hel"}, {"text": "lo"}]}, "finishReason": "STOP"}
            ],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
        }"#;

        let response: GenerateContentResponse =
            serde_json::from_str(body).expect("response should parse");

        assert_eq!(response.candidates.len(), 1);
        let content = response.candidates[0]
            .content
            .as_ref()
            .expect("candidate content");
        assert_eq!(content.text(), "hello");
        assert_eq!(
            response.usage_metadata.map(|usage| usage.total_token_count),
            Some(5)
        );
    }

    #[test]
    fn content_text_skips_images() {
        let content = Content::user(vec![
            Part::text("look at "),
            Part::image("jpeg", vec![0xff, 0xd8]),
            Part::text("this"),
        ]);
        assert_eq!(content.text(), "look at this");
    }

    #[test]
    fn generation_config_omits_unset_fields() {
        let config = GenerationConfig::default().with_temperature(0.5);
        let value = serde_json::to_value(&config).expect("config should serialize");
        assert_eq!(value, serde_json::json!({"temperature": 0.5}));
        assert!(GenerationConfig::default().is_empty());
    }
}
