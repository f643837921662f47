//! Daemon wire protocol
//!
//! JSON frames terminated by an explicit End-Of-Transmission byte; no
//! newline significance, no reliance on socket close. Strictly
//! request/response: a client must not send a second message before
//! receiving the prior response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::project_graph::ProjectGraph;

/// Frame terminator
pub const EOT: u8 = 0x04;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonRequest {
    /// Return the warm graph, rebuilding first if watched files changed
    RequestProjectGraph,
    /// Fire a named unit of work and return its result
    ProcessInBackground {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    RecordOutputsHash { outputs: Vec<String>, hash: String },
    OutputsHashesMatch { outputs: Vec<String>, hash: String },
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonResponse {
    ProjectGraph { project_graph: ProjectGraph },
    OutputsHashesMatch { matches: bool },
    BackgroundResult { result: Value },
    Ok,
    Error { message: String },
}

pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(EOT);
    Ok(bytes)
}

/// Reassembles EOT-delimited frames from arbitrary read chunks
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
}

impl FrameSplitter {
    /// Feed raw bytes; returns every frame completed by this chunk
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == EOT) {
            let frame: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
            frames.push(String::from_utf8_lossy(&frame).into_owned());
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags_use_screaming_snake_case() {
        let json = serde_json::to_string(&DaemonRequest::RequestProjectGraph).unwrap();
        assert_eq!(json, r#"{"type":"REQUEST_PROJECT_GRAPH"}"#);

        let json = serde_json::to_string(&DaemonRequest::RecordOutputsHash {
            outputs: vec!["dist".into()],
            hash: "h".into(),
        })
        .unwrap();
        assert!(json.contains("\"RECORD_OUTPUTS_HASH\""));
    }

    #[test]
    fn splitter_handles_partial_and_coalesced_frames() {
        let mut splitter = FrameSplitter::default();
        let frame_a = encode_frame(&DaemonRequest::Stop).unwrap();
        let frame_b = encode_frame(&DaemonRequest::RequestProjectGraph).unwrap();

        // first frame split in two reads, second arrives coalesced
        let split_at = frame_a.len() / 2;
        assert!(splitter.push(&frame_a[..split_at]).is_empty());

        let mut rest = frame_a[split_at..].to_vec();
        rest.extend_from_slice(&frame_b);
        let frames = splitter.push(&rest);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], r#"{"type":"STOP"}"#);
        assert_eq!(frames[1], r#"{"type":"REQUEST_PROJECT_GRAPH"}"#);
    }

    #[test]
    fn frames_may_contain_newlines() {
        let mut splitter = FrameSplitter::default();
        let mut bytes = br#"{"type":"ERROR","message":"line one\ntwo"}"#.to_vec();
        bytes.push(EOT);
        let frames = splitter.push(&bytes);
        assert_eq!(frames.len(), 1);
        let parsed: DaemonResponse = serde_json::from_str(&frames[0]).unwrap();
        assert!(matches!(parsed, DaemonResponse::Error { .. }));
    }
}
