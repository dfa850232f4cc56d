//! The worker's NDJSON wire schema.
//!
//! Parsing is deliberately permissive: only the `system`/`init` and
//! `result` frames drive the session state machine, every other known type
//! is ignored, unknown types map to [`WorkerFrame::Other`], and unknown
//! fields inside any frame are dropped silently. The worker is free to grow
//! its schema without breaking us.

use porter_shared::content::WorkerContent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    System(SystemFrame),
    Result(ResultFrame),
    Assistant(IgnoredFrame),
    User(IgnoredFrame),
    RateLimitEvent(IgnoredFrame),
    StreamEvent(IgnoredFrame),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct IgnoredFrame {}

#[derive(Debug, Deserialize)]
pub struct SystemFrame {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultFrame {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub permission_denials: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

pub fn parse_frame(line: &str) -> Result<WorkerFrame, serde_json::Error> {
    serde_json::from_str(line)
}

/// Serialize one user turn as a single NDJSON line (without the trailing
/// newline).
pub fn user_message_line(content: &WorkerContent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::json!({
        "type": "user",
        "message": {"role": "user", "content": content},
    }))
}

/// Drain complete lines out of the accumulator, leaving any unterminated
/// remainder in place. Empty lines and invalid UTF-8 are dropped.
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
        let rest = buffer.split_off(pos + 1);
        let mut line = std::mem::replace(buffer, rest);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if let Ok(text) = String::from_utf8(line)
            && !text.trim().is_empty()
        {
            lines.push(text);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_shared::content::ContentBlock;

    #[test]
    fn init_frame_parses_session_id_and_model() {
        let frame = parse_frame(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"opus","tools":["Bash"]}"#,
        )
        .unwrap_or_else(|error| panic!("parse failed: {error}"));

        match frame {
            WorkerFrame::System(system) => {
                assert_eq!(system.subtype, "init");
                assert_eq!(system.session_id.as_deref(), Some("abc"));
                assert_eq!(system.model.as_deref(), Some("opus"));
            }
            other => panic!("expected system frame, got {other:?}"),
        }
    }

    #[test]
    fn result_frame_parses_usage_and_ignores_unknown_fields() {
        let frame = parse_frame(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"4",
                "session_id":"abc","duration_ms":1200,"duration_api_ms":900,"num_turns":2,
                "total_cost_usd":0.015,
                "usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":1,"cache_read_input_tokens":2},
                "permission_denials":[],"brand_new_field":{"x":1}}"#,
        )
        .unwrap_or_else(|error| panic!("parse failed: {error}"));

        match frame {
            WorkerFrame::Result(result) => {
                assert_eq!(result.result.as_deref(), Some("4"));
                assert_eq!(result.usage.input_tokens, 10);
                assert_eq!(result.usage.cache_read_input_tokens, 2);
                assert!(!result.is_error);
            }
            other => panic!("expected result frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_types_map_to_other() {
        let frame = parse_frame(r#"{"type":"telemetry","payload":123}"#)
            .unwrap_or_else(|error| panic!("parse failed: {error}"));
        assert!(matches!(frame, WorkerFrame::Other));
    }

    #[test]
    fn user_line_with_plain_text_collapses_to_a_string() {
        let line = user_message_line(&WorkerContent::Text("hello".to_string()))
            .unwrap_or_else(|error| panic!("encode failed: {error}"));
        let value: serde_json::Value = serde_json::from_str(&line)
            .unwrap_or_else(|error| panic!("decode failed: {error}"));
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"], "hello");
    }

    #[test]
    fn user_line_with_blocks_keeps_the_block_array() {
        let content = WorkerContent::Blocks(vec![
            ContentBlock::text("see image"),
            ContentBlock::image("image/png", "aGVsbG8="),
        ]);
        let line = user_message_line(&content)
            .unwrap_or_else(|error| panic!("encode failed: {error}"));
        let value: serde_json::Value = serde_json::from_str(&line)
            .unwrap_or_else(|error| panic!("decode failed: {error}"));
        assert_eq!(value["message"]["content"][1]["type"], "image");
    }

    #[test]
    fn drain_lines_keeps_unterminated_remainder() {
        let mut buffer = b"{\"a\":1}\n\n{\"b\":2}\r\n{\"partial".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(buffer, b"{\"partial".to_vec());
    }
}
