//! Line protocol between a child process and its parent
//!
//! ```text
//!   parent ──stdin──►  child     one JSON line: the shared map snapshot
//!   parent ◄─stdout──  child     postMainThread=>{"key": value, ...}
//!                                postAlertThread=><json or raw text>
//!   parent ◄─stderr──  child     anything here rejects the thread
//! ```
//!
//! Lines without a known tag are ordinary output and are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Map;
use weft_core::Value;

pub const POST_MAIN_THREAD: &str = "postMainThread";
pub const POST_ALERT_THREAD: &str = "postAlertThread";
pub const SEPARATOR: &str = "=>";

/// Argument that marks a re-executed binary as a job child
pub const JOB_FLAG: &str = "--weft-job";

/// Environment variable carrying the `JobRequest` as JSON
pub const JOB_INPUT_ENV: &str = "WEFT_JOB_INPUT";

/// One decoded control line
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Keys to merge into the parent's shared map
    PostMain(Map<String, Value>),
    /// Value appended to the thread's resolved alerts
    Alert(Value),
}

/// Job a child was started for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Decode one stdout line
pub fn parse_line(line: &str) -> Option<ControlMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (tag, payload) = line.split_once(SEPARATOR)?;
    match tag.trim() {
        POST_MAIN_THREAD => serde_json::from_str::<Map<String, Value>>(payload)
            .ok()
            .map(ControlMessage::PostMain),
        POST_ALERT_THREAD => {
            let value = serde_json::from_str(payload)
                .unwrap_or_else(|_| Value::String(payload.to_string()));
            Some(ControlMessage::Alert(value))
        }
        _ => None,
    }
}

pub fn encode_post_main(data: &Map<String, Value>) -> String {
    format!("{}{}{}", POST_MAIN_THREAD, SEPARATOR, Value::Object(data.clone()))
}

pub fn encode_alert(value: &Value) -> String {
    format!("{}{}{}", POST_ALERT_THREAD, SEPARATOR, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_post_main() {
        let msg = parse_line(r#"postMainThread=>{"k":1}"#).unwrap();
        let mut expected = Map::new();
        expected.insert("k".into(), json!(1));
        assert_eq!(msg, ControlMessage::PostMain(expected));
    }

    #[test]
    fn test_parse_alert() {
        assert_eq!(
            parse_line("postAlertThread=>\"hi\"\r"),
            Some(ControlMessage::Alert(json!("hi")))
        );
        assert_eq!(
            parse_line("postAlertThread=>[1,2]"),
            Some(ControlMessage::Alert(json!([1, 2])))
        );
        // Not JSON: kept as text
        assert_eq!(
            parse_line("postAlertThread=>plain words"),
            Some(ControlMessage::Alert(json!("plain words")))
        );
    }

    #[test]
    fn test_ignored_lines() {
        assert_eq!(parse_line("hello"), None);
        assert_eq!(parse_line("other=>{}"), None);
        // Shared data must be an object
        assert_eq!(parse_line("postMainThread=>[1]"), None);
    }

    #[test]
    fn test_encode_decode() {
        let mut data = Map::new();
        data.insert("x".into(), json!({"nested": true}));
        let line = encode_post_main(&data);
        assert_eq!(parse_line(&line), Some(ControlMessage::PostMain(data)));

        let line = encode_alert(&json!("done"));
        assert_eq!(line, "postAlertThread=>\"done\"");
    }

    #[test]
    fn test_job_request_serde() {
        let req: JobRequest = serde_json::from_str(r#"{"name":"square"}"#).unwrap();
        assert_eq!(req.input, Value::Null);
    }
}
