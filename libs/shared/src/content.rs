//! Multimodal content passed to the worker.
//!
//! A request whose parts are all text collapses to a plain string (the
//! backward-compatible path); anything richer becomes a block sequence in
//! the worker's content-block wire shape.

use serde::{Deserialize, Serialize};

/// Image MIME types the worker accepts as inline image blocks. Anything
/// else with inline bytes is carried as a document block.
pub const IMAGE_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

pub fn is_image_mime(mime_type: &str) -> bool {
    IMAGE_MIME_TYPES.contains(&mime_type)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: BlockSource,
    },
    Document {
        source: BlockSource,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BlockSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: BlockSource {
                source_type: "base64".to_string(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn document(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Document {
            source: BlockSource {
                source_type: "base64".to_string(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

/// The payload handed to a worker session: either a plain prompt string or
/// a content-block sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WorkerContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl WorkerContent {
    pub fn is_empty(&self) -> bool {
        match self {
            WorkerContent::Text(text) => text.trim().is_empty(),
            WorkerContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_mime_whitelist_covers_the_four_formats() {
        for mime in ["image/jpeg", "image/png", "image/gif", "image/webp"] {
            assert!(is_image_mime(mime), "{mime} should be whitelisted");
        }
        assert!(!is_image_mime("application/pdf"));
        assert!(!is_image_mime("image/tiff"));
    }

    #[test]
    fn image_block_serializes_with_base64_source() {
        let block = ContentBlock::image("image/png", "aGVsbG8=");
        let encoded = serde_json::to_value(&block)
            .unwrap_or_else(|error| panic!("encode failed: {error}"));
        assert_eq!(encoded["type"], "image");
        assert_eq!(encoded["source"]["type"], "base64");
        assert_eq!(encoded["source"]["media_type"], "image/png");
    }

    #[test]
    fn worker_content_text_serializes_untagged() {
        let content = WorkerContent::Text("hello".to_string());
        let encoded = serde_json::to_value(&content)
            .unwrap_or_else(|error| panic!("encode failed: {error}"));
        assert_eq!(encoded, serde_json::json!("hello"));
    }

    #[test]
    fn whitespace_only_text_counts_as_empty() {
        assert!(WorkerContent::Text("   \n".to_string()).is_empty());
        assert!(WorkerContent::Blocks(Vec::new()).is_empty());
        assert!(!WorkerContent::Text("hi".to_string()).is_empty());
    }
}
