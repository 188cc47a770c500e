//! HTTP client for the vision model.
//!
//! The request body is an ordered list of text and base64-image parts inside
//! a single user message. The response's first text block is scanned for the
//! first balanced JSON object; everything the model says around it is noise.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tickd_core::config::LlmConfig;

use crate::error::{ExtractError, Result};

const API_VERSION: &str = "2023-06-01";

/// One part of the user message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

/// Ordered accumulator for one extraction call.
#[derive(Debug, Default)]
pub struct ExtractionRequest {
    parts: Vec<ContentPart>,
}

impl ExtractionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn add_text(&mut self, text: impl Into<String>) {
        self.parts.push(ContentPart::Text { text: text.into() });
    }

    /// Add raw image bytes; the media type is inferred from the filename.
    pub fn add_image_bytes(&mut self, filename: &str, bytes: &[u8]) {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.parts.push(ContentPart::Image {
            source: ImageSource {
                kind: "base64",
                media_type: media_type_for(filename).to_string(),
                data,
            },
        });
    }

    /// Read an image from disk and append it.
    pub async fn add_image_file(&mut self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ExtractError::Transport(format!("read {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.add_image_bytes(&filename, &bytes);
        Ok(())
    }
}

/// Extension → MIME. Unknown suffixes fall back to JPEG, which the vision
/// API accepts for most phone-camera uploads anyway.
fn media_type_for(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    match lower.rsplit('.').next() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/jpeg",
    }
}

pub struct VisionClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    timeout: Duration,
}

impl VisionClient {
    pub fn new(cfg: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    /// Call the model and parse the first balanced JSON object out of its
    /// reply.
    pub async fn call_json(&self, request: &ExtractionRequest) -> Result<serde_json::Value> {
        let text = self.call(request).await?;
        let json = extract_json_object(&text)
            .ok_or_else(|| ExtractError::Decode("no JSON object in response".to_string()))?;
        serde_json::from_str(json).map_err(|e| ExtractError::Decode(e.to_string()))
    }

    /// Call the model and return the raw text of the first content block.
    pub async fn call(&self, request: &ExtractionRequest) -> Result<String> {
        if request.is_empty() {
            return Err(ExtractError::Decode("empty extraction request".to_string()));
        }

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": request.parts,
            }],
        });
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %self.model, parts = request.parts.len(), "calling vision model");

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "vision API error");
            return Err(ExtractError::Transport(format!(
                "API returned {status}: {text}"
            )));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ExtractError::Transport(e.to_string()))?;

        api_resp
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Unknown => None,
            })
            .ok_or_else(|| ExtractError::Decode("response carried no text block".to_string()))
    }
}

/// Find the first balanced `{…}` substring, skipping braces inside JSON
/// strings and escape sequences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_with_prose_around() {
        let text = "Here is the receipt:\n{\"total\": \"42.50\"}\nLet me know!";
        assert_eq!(extract_json_object(text), Some("{\"total\": \"42.50\"}"));
    }

    #[test]
    fn nested_objects_balance() {
        let text = r#"{"magasin":{"nom":"Migros"},"articles":[{"nom":"Pain"}]}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn braces_inside_strings_are_skipped() {
        let text = r#"{"note":"a } tricky { value"}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let text = r#"{"note":"say \"}\" twice"}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn apology_without_json_yields_none() {
        assert_eq!(
            extract_json_object("I'm sorry, I cannot read this receipt."),
            None
        );
    }

    #[test]
    fn unterminated_object_yields_none() {
        assert_eq!(extract_json_object(r#"{"total": "#), None);
    }

    #[test]
    fn media_types_from_extension() {
        assert_eq!(media_type_for("r.jpg"), "image/jpeg");
        assert_eq!(media_type_for("r.JPEG"), "image/jpeg");
        assert_eq!(media_type_for("r.png"), "image/png");
        assert_eq!(media_type_for("r.webp"), "image/webp");
        assert_eq!(media_type_for("r.gif"), "image/gif");
        assert_eq!(media_type_for("noextension"), "image/jpeg");
        assert_eq!(media_type_for(""), "image/jpeg");
    }

    #[test]
    fn image_part_serialises_to_the_wire_shape() {
        let mut req = ExtractionRequest::new();
        req.add_image_bytes("r.png", b"abc");
        let json = serde_json::to_value(&req.parts).unwrap();
        assert_eq!(json[0]["type"], "image");
        assert_eq!(json[0]["source"]["type"], "base64");
        assert_eq!(json[0]["source"]["media_type"], "image/png");
        assert_eq!(json[0]["source"]["data"], "YWJj");
    }

    #[test]
    fn text_part_serialises_to_the_wire_shape() {
        let mut req = ExtractionRequest::new();
        req.add_text("read this receipt");
        let json = serde_json::to_value(&req.parts).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[0]["text"], "read this receipt");
    }
}
