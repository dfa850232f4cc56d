//! Conversion from A2A message parts to worker content.
//!
//! The conversion is total: every part produces something. All-text
//! messages collapse to a plain string; anything richer becomes a content
//! block sequence. URI-only file parts become an explanatory text block:
//! the server never fetches remote content, and silently dropping a part
//! would hide that from the model.

use base64::Engine as _;
use porter_shared::a2a::Part;
use porter_shared::content::{ContentBlock, WorkerContent, is_image_mime};

const DEFAULT_DOCUMENT_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PartsError {
    #[error("message contained no usable content")]
    Empty,
}

pub fn convert_parts(parts: &[Part]) -> Result<WorkerContent, PartsError> {
    if parts.is_empty() {
        return Err(PartsError::Empty);
    }

    let all_text = parts.iter().all(|part| matches!(part, Part::Text { .. }));
    if all_text {
        let joined = parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if joined.trim().is_empty() {
            return Err(PartsError::Empty);
        }
        return Ok(WorkerContent::Text(joined));
    }

    let mut blocks = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            Part::Text { text, .. } => {
                if !text.trim().is_empty() {
                    blocks.push(ContentBlock::text(text.clone()));
                }
            }
            Part::File { file, .. } => {
                let name = file.name.as_deref().unwrap_or("unnamed file");
                match (&file.bytes, &file.uri) {
                    (Some(bytes), _) => {
                        let mime = file.mime_type.as_deref().unwrap_or(DEFAULT_DOCUMENT_MIME);
                        if base64::engine::general_purpose::STANDARD
                            .decode(bytes.as_bytes())
                            .is_err()
                        {
                            blocks.push(ContentBlock::text(format!(
                                "[File '{name}' ({mime}) carried an invalid base64 payload and was skipped.]"
                            )));
                        } else if is_image_mime(mime) {
                            blocks.push(ContentBlock::image(mime, bytes.clone()));
                        } else {
                            blocks.push(ContentBlock::document(mime, bytes.clone()));
                        }
                    }
                    (None, Some(uri)) => {
                        blocks.push(ContentBlock::text(format!(
                            "[File '{name}' was referenced by URI ({uri}) but remote content is not fetched. Resend it inline as base64 to include it.]"
                        )));
                    }
                    (None, None) => {
                        blocks.push(ContentBlock::text(format!(
                            "[File '{name}' carried neither inline bytes nor a URI.]"
                        )));
                    }
                }
            }
            Part::Data { data, .. } => {
                let pretty = serde_json::to_string_pretty(data)
                    .unwrap_or_else(|_| data.to_string());
                blocks.push(ContentBlock::text(pretty));
            }
        }
    }

    if blocks.is_empty() {
        return Err(PartsError::Empty);
    }
    Ok(WorkerContent::Blocks(blocks))
}
