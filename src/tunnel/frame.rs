//! Frame codec for the agent channel.
//!
//! Every WebSocket text message is one JSON object. Control frames carry a
//! `type` discriminator and decode into [`Frame`]; RPC responses carry
//! `requestId` + `status` and decode into [`RpcResponse`]. Binary payloads
//! (stream bytes, shell output, file chunks) travel base64-encoded inside
//! string fields.
//!
//! ```json
//! {"type":"STREAM_DATA","connectionId":"9b1e…","data":"UElORw=="}
//! {"requestId":"4f0c…","status":"success","data":{"cwd":"/srv/site/sub"}}
//! ```

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame that fails to decode. The channel logs and discards it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has neither `type` nor `requestId`/`status`")]
    MissingDiscriminator,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Control frames, one variant per wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Frame {
    /// Master accepted the agent's credentials.
    HandshakeAck,
    /// Master is stopping; the agent should reconnect right away.
    RelayShutdown,
    Heartbeat {
        data: Metrics,
    },
    ExecCommand {
        request_id: String,
        data: ExecRequest,
    },
    StartShell {
        shell_id: String,
    },
    ShellInput {
        shell_id: String,
        /// base64
        input: String,
    },
    ShellOutput {
        shell_id: String,
        stream: OutputStream,
        /// base64
        data: String,
    },
    ShellExit {
        shell_id: String,
        code: Option<i32>,
    },
    KillShell {
        shell_id: String,
    },
    FileAction {
        request_id: String,
        data: FileAction,
    },
    FileChunk {
        request_id: String,
        /// base64
        data: String,
        is_last: bool,
    },
    StreamOpen {
        connection_id: String,
        port: u16,
    },
    StreamData {
        connection_id: String,
        /// base64
        data: String,
    },
    /// The sender's local leg reached EOF: no more data in that direction.
    /// The other direction stays open until `STREAM_CLOSE`.
    StreamEof {
        connection_id: String,
    },
    StreamClose {
        connection_id: String,
    },
}

impl Frame {
    /// Wire name of the frame, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeAck => "HANDSHAKE_ACK",
            Self::RelayShutdown => "RELAY_SHUTDOWN",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::ExecCommand { .. } => "EXEC_COMMAND",
            Self::StartShell { .. } => "START_SHELL",
            Self::ShellInput { .. } => "SHELL_INPUT",
            Self::ShellOutput { .. } => "SHELL_OUTPUT",
            Self::ShellExit { .. } => "SHELL_EXIT",
            Self::KillShell { .. } => "KILL_SHELL",
            Self::FileAction { .. } => "FILE_ACTION",
            Self::FileChunk { .. } => "FILE_CHUNK",
            Self::StreamOpen { .. } => "STREAM_OPEN",
            Self::StreamData { .. } => "STREAM_DATA",
            Self::StreamEof { .. } => "STREAM_EOF",
            Self::StreamClose { .. } => "STREAM_CLOSE",
        }
    }
}

/// Resource snapshot carried by `HEARTBEAT`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Percent busy since the previous sample.
    pub cpu: f64,
    /// Percent of memory in use.
    pub ram: f64,
    /// Percent of `/` in use.
    pub disk: f64,
    /// Host uptime in seconds.
    pub uptime: u64,
    /// Unix time in milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// `EXEC_COMMAND` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    /// Current directory from the previous call; defaults to `root`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `FILE_ACTION` payload: a jailed path plus the action-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAction {
    pub root: String,
    pub path: String,
    #[serde(flatten)]
    pub op: FileOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum FileOp {
    Read,
    Write {
        /// base64
        content: String,
        #[serde(default)]
        create_dirs: bool,
    },
    List,
    Delete,
    Mkdir,
    Zip {
        dest: String,
    },
    Checksum,
    Upload {
        /// base64
        data: String,
        #[serde(default)]
        offset: u64,
        #[serde(default)]
        is_last: bool,
    },
    Download {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_size: Option<usize>,
    },
}

impl FileOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write { .. } => "write",
            Self::List => "list",
            Self::Delete => "delete",
            Self::Mkdir => "mkdir",
            Self::Zip { .. } => "zip",
            Self::Checksum => "checksum",
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcStatus {
    Success,
    Error,
}

/// RPC response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: String,
    pub status: RpcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine code for errors, e.g. `JAIL_VIOLATION`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RpcResponse {
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: RpcStatus::Success,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(
        request_id: impl Into<String>,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: RpcStatus::Error,
            data: None,
            error: Some(error.into()),
            code: Some(code.into()),
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Anything that travels over the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Frame(Frame),
    Response(RpcResponse),
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl From<RpcResponse> for Message {
    fn from(response: RpcResponse) -> Self {
        Self::Response(response)
    }
}

impl Message {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Frame(frame) => serde_json::to_string(frame),
            Self::Response(response) => serde_json::to_string(response),
        }
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;
        if obj.contains_key("type") {
            Ok(Self::Frame(serde_json::from_value(value)?))
        } else if obj.contains_key("requestId") && obj.contains_key("status") {
            Ok(Self::Response(serde_json::from_value(value)?))
        } else {
            Err(DecodeError::MissingDiscriminator)
        }
    }
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_bytes(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_frames_are_bare_type() {
        let text = Message::Frame(Frame::HandshakeAck).encode().unwrap();
        assert_eq!(text, r#"{"type":"HANDSHAKE_ACK"}"#);
        assert_eq!(
            Message::decode(r#"{"type":"RELAY_SHUTDOWN"}"#).unwrap(),
            Message::Frame(Frame::RelayShutdown)
        );
    }

    #[test]
    fn test_field_names_are_camel_case() {
        let frame = Frame::StreamOpen {
            connection_id: "c1".into(),
            port: 22,
        };
        let value: Value = serde_json::from_str(&Message::from(frame).encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "STREAM_OPEN", "connectionId": "c1", "port": 22})
        );

        let chunk = Frame::FileChunk {
            request_id: "r1".into(),
            data: encode_bytes(b"abc"),
            is_last: true,
        };
        let value: Value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["isLast"], json!(true));
        assert_eq!(value["requestId"], json!("r1"));

        let eof = Frame::StreamEof {
            connection_id: "c1".into(),
        };
        assert_eq!(
            serde_json::to_value(&eof).unwrap(),
            json!({"type": "STREAM_EOF", "connectionId": "c1"})
        );
    }

    #[test]
    fn test_decode_exec_command() {
        let msg = Message::decode(
            r#"{"type":"EXEC_COMMAND","requestId":"r7","data":{"command":"cd sub","cwd":"/srv/site","root":"/srv/site"}}"#,
        )
        .unwrap();
        let Message::Frame(Frame::ExecCommand { request_id, data }) = msg else {
            panic!("wrong variant: {msg:?}");
        };
        assert_eq!(request_id, "r7");
        assert_eq!(data.command, "cd sub");
        assert_eq!(data.cwd.as_deref(), Some("/srv/site"));
        assert_eq!(data.timeout_ms, None);
    }

    #[test]
    fn test_decode_file_action_flattened() {
        let msg = Message::decode(
            r#"{"type":"FILE_ACTION","requestId":"r2","data":{"action":"write","root":"/srv","path":"a.txt","content":"aGk=","createDirs":true}}"#,
        )
        .unwrap();
        let Message::Frame(Frame::FileAction { data, .. }) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(data.root, "/srv");
        assert_eq!(data.path, "a.txt");
        assert_eq!(
            data.op,
            FileOp::Write {
                content: "aGk=".into(),
                create_dirs: true
            }
        );

        let list: FileAction =
            serde_json::from_value(json!({"action": "list", "root": "/srv", "path": "."})).unwrap();
        assert_eq!(list.op, FileOp::List);
        let back = serde_json::to_value(&list).unwrap();
        assert_eq!(back["action"], json!("list"));
    }

    #[test]
    fn test_decode_response_envelope() {
        let msg = Message::decode(
            r#"{"requestId":"r1","status":"error","error":"denied","code":"JAIL_VIOLATION","data":{"cwd":"/srv/site"}}"#,
        )
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(resp.status, RpcStatus::Error);
        assert_eq!(resp.code.as_deref(), Some("JAIL_VIOLATION"));
        assert_eq!(resp.data, Some(json!({"cwd": "/srv/site"})));
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(
            Message::decode("not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            Message::decode("[1,2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            Message::decode(r#"{"hello":"world"}"#),
            Err(DecodeError::MissingDiscriminator)
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"NOT_A_FRAME"}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"STREAM_OPEN","connectionId":"c"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_heartbeat_metrics_tolerate_missing_fields() {
        let msg = Message::decode(r#"{"type":"HEARTBEAT","data":{"cpu":12.5}}"#).unwrap();
        let Message::Frame(Frame::Heartbeat { data }) = msg else {
            panic!("wrong variant");
        };
        assert!((data.cpu - 12.5).abs() < f64::EPSILON);
        assert_eq!(data.uptime, 0);
    }

    #[test]
    fn test_base64_helpers() {
        let bytes = [0u8, 159, 146, 150, 255];
        assert_eq!(decode_bytes(&encode_bytes(&bytes)).unwrap(), bytes);
        assert!(matches!(decode_bytes("@@@"), Err(DecodeError::Base64(_))));
    }
}
