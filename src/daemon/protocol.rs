//! Wire protocol shared by the daemon and its clients.
//!
//! Every message in either direction is one frame: a 4-byte big-endian length
//! followed by that many bytes of UTF-8 JSON. Requests are objects tagged by
//! `cmd`; responses are always `{ok, data, error}`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Largest frame body either side will accept (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Upper bound on stages per escalation.
pub const MAX_STAGES: usize = 16;

/// Upper bound on a single stage delay (7 days).
pub const MAX_STAGE_DELAY_SECS: f64 = 7.0 * 24.0 * 60.0 * 60.0;

/// Framing failures. The connection that produced one is closed; daemon state
/// is left untouched.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the stream cleanly between frames.
    #[error("connection closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("truncated frame: got {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },
    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-request failures, reported back as `{ok: false, error}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("missing field `cmd`")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid {command} request: {reason}")]
    InvalidRequest { command: String, reason: String },
    #[error("invalid stages: {0}")]
    InvalidStages(String),
    #[error("daemon is shutting down")]
    ShuttingDown,
}

/// One step of an escalation: wait `delay_secs` from the `add` call, then
/// deliver at `priority`. Encoded on the wire as `[delay_secs, priority]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, i8)", into = "(f64, i8)")]
pub struct Stage {
    pub delay_secs: f64,
    pub priority: i8,
}

impl Stage {
    pub fn new(delay_secs: f64, priority: i8) -> Self {
        Self {
            delay_secs,
            priority,
        }
    }
}

impl From<(f64, i8)> for Stage {
    fn from((delay_secs, priority): (f64, i8)) -> Self {
        Self::new(delay_secs, priority)
    }
}

impl From<Stage> for (f64, i8) {
    fn from(stage: Stage) -> Self {
        (stage.delay_secs, stage.priority)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.delay_secs, self.priority)
    }
}

/// Parses the CLI form `DELAY:PRIORITY` (e.g. `60:0`).
impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (delay, priority) = s
            .split_once(':')
            .ok_or_else(|| format!("expected DELAY:PRIORITY, got '{s}'"))?;
        let delay_secs = delay
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid delay '{delay}': {e}"))?;
        let priority = priority
            .trim()
            .parse::<i8>()
            .map_err(|e| format!("invalid priority '{priority}': {e}"))?;
        Ok(Self::new(delay_secs, priority))
    }
}

/// Reject stage lists the scheduler cannot honor.
pub fn validate_stages(stages: &[Stage]) -> Result<(), CommandError> {
    if stages.is_empty() {
        return Err(CommandError::InvalidStages(
            "at least one stage is required".to_string(),
        ));
    }
    if stages.len() > MAX_STAGES {
        return Err(CommandError::InvalidStages(format!(
            "{} stages given, at most {MAX_STAGES} allowed",
            stages.len()
        )));
    }
    for (index, stage) in stages.iter().enumerate() {
        if !stage.delay_secs.is_finite()
            || stage.delay_secs < 0.0
            || stage.delay_secs > MAX_STAGE_DELAY_SECS
        {
            return Err(CommandError::InvalidStages(format!(
                "stage {index}: delay {} is outside 0..={MAX_STAGE_DELAY_SECS}",
                stage.delay_secs
            )));
        }
        if !(-2..=2).contains(&stage.priority) {
            return Err(CommandError::InvalidStages(format!(
                "stage {index}: priority {} is outside -2..=2",
                stage.priority
            )));
        }
    }
    Ok(())
}

/// Client request to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Install (or supersede) an escalation
    Add {
        id: String,
        message: String,
        /// Omitted means the daemon's configured default stages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stages: Option<Vec<Stage>>,
    },
    /// Drop an escalation and its un-fired stages
    Cancel { id: String },
    /// Snapshot of pending escalations and sessions
    Status,
    /// Attach a session (increments the reference count)
    RegisterSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Detach a session; the last one out drains the daemon
    UnregisterSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Liveness check
    Ping,
    /// Drain regardless of attached sessions
    Shutdown,
}

impl Request {
    /// Every command name the daemon understands.
    pub const COMMANDS: &'static [&'static str] = &[
        "add",
        "cancel",
        "status",
        "register_session",
        "unregister_session",
        "ping",
        "shutdown",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Request::Add { .. } => "add",
            Request::Cancel { .. } => "cancel",
            Request::Status => "status",
            Request::RegisterSession { .. } => "register_session",
            Request::UnregisterSession { .. } => "unregister_session",
            Request::Ping => "ping",
            Request::Shutdown => "shutdown",
        }
    }

    /// Decode an already-parsed frame body.
    ///
    /// Splits failures into the unknown-command and bad-field cases so the
    /// daemon can answer with a precise error instead of a serde message about
    /// enum variants.
    pub fn from_value(value: Value) -> Result<Self, CommandError> {
        let command = match value.get("cmd") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => return Err(CommandError::UnknownCommand(other.to_string())),
            None => return Err(CommandError::MissingCommand),
        };
        if !Self::COMMANDS.contains(&command.as_str()) {
            return Err(CommandError::UnknownCommand(command));
        }
        serde_json::from_value(value).map_err(|e| CommandError::InvalidRequest {
            command,
            reason: e.to_string(),
        })
    }
}

/// Daemon response to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "daemon returned an error without a message".to_string()))
        }
    }
}

/// Daemon lifecycle phase as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    Starting,
    Listening,
    Draining,
    Stopped,
}

impl fmt::Display for DaemonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonPhase::Starting => "starting",
            DaemonPhase::Listening => "listening",
            DaemonPhase::Draining => "draining",
            DaemonPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// `data` of a successful `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingReply {
    pub pid: u32,
    pub phase: DaemonPhase,
    pub version: String,
}

/// `data` of a successful `add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddReply {
    pub id: String,
    pub stages: usize,
    pub superseded: bool,
}

/// `data` of a successful `cancel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReply {
    pub id: String,
    pub cancelled: bool,
}

/// `data` of `register_session` and `unregister_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReply {
    pub session_id: Option<String>,
    pub session_count: usize,
    #[serde(default)]
    pub shutting_down: bool,
}

/// One pending escalation in a `status` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub id: String,
    pub message: String,
    pub stages_remaining: usize,
    /// Seconds until the next stage fires
    pub next_fire_in: f64,
}

/// One attached session in a `status` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub pid: Option<u32>,
    pub registered_at: DateTime<Utc>,
    pub age_secs: i64,
}

/// `data` of a successful `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub phase: DaemonPhase,
    pub pending: Vec<PendingEscalation>,
    pub sessions: Vec<SessionSnapshot>,
    pub session_count: usize,
}

/// Write a length-prefixed JSON message to a stream.
///
/// Header and body go out in one `write_all`, which loops until every byte
/// has been accepted by the kernel.
pub fn write_message<T: Serialize, W: Write>(
    stream: &mut W,
    message: &T,
) -> Result<(), ProtocolError> {
    let json = serde_json::to_vec(message)?;
    if json.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(json.len()));
    }
    let len = json.len() as u32;

    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);

    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Read one raw frame body.
///
/// Returns [`ProtocolError::Closed`] when the peer hangs up before sending
/// any part of a new frame, and [`ProtocolError::Truncated`] when it hangs up
/// mid-frame.
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    match fill(stream, &mut len_bytes)? {
        0 => return Err(ProtocolError::Closed),
        4 => {}
        received => {
            return Err(ProtocolError::Truncated {
                expected: 4,
                received,
            })
        }
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    let received = fill(stream, &mut body)?;
    if received != len {
        return Err(ProtocolError::Truncated {
            expected: len,
            received,
        });
    }
    Ok(body)
}

/// Read a length-prefixed JSON message from a stream.
pub fn read_message<T: DeserializeOwned, R: Read>(stream: &mut R) -> Result<T, ProtocolError> {
    let body = read_frame(stream)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Keep reading until `buf` is full or the stream hits EOF. Returns the number
/// of bytes read.
fn fill<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    /// Reader that hands out at most `chunk` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(self.chunk).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_write_and_read_request() {
        let mut buffer = Vec::new();
        let request = Request::Add {
            id: "t1".to_string(),
            message: "Waiting for approval".to_string(),
            stages: Some(vec![Stage::new(1.0, 0), Stage::new(2.0, 2)]),
        };

        write_message(&mut buffer, &request).expect("Failed to write message");

        let mut cursor = Cursor::new(buffer);
        let decoded: Request = read_message(&mut cursor).expect("Failed to read message");
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_frame_header_is_big_endian_length() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Request::Ping).unwrap();

        let body = br#"{"cmd":"ping"}"#;
        assert_eq!(&buffer[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buffer[4..], body);
    }

    #[test]
    fn test_request_wire_shape() {
        let value = serde_json::to_value(Request::Add {
            id: "t1".to_string(),
            message: "m".to_string(),
            stages: Some(vec![Stage::new(1.0, 0), Stage::new(2.0, 2)]),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"cmd": "add", "id": "t1", "message": "m", "stages": [[1.0, 0], [2.0, 2]]})
        );
        assert_eq!(
            serde_json::to_value(Request::Status).unwrap(),
            json!({"cmd": "status"})
        );
    }

    #[test]
    fn test_response_wire_shape_has_nulls() {
        let value = serde_json::to_value(Response::failure("boom")).unwrap();
        assert_eq!(value, json!({"ok": false, "data": null, "error": "boom"}));

        let value = serde_json::to_value(Response::success(json!({"x": 1}))).unwrap();
        assert_eq!(value, json!({"ok": true, "data": {"x": 1}, "error": null}));
    }

    #[test]
    fn test_read_across_partial_reads() {
        let mut buffer = Vec::new();
        let request = Request::Cancel {
            id: "session-abc".to_string(),
        };
        write_message(&mut buffer, &request).unwrap();

        let mut reader = Trickle {
            data: buffer,
            pos: 0,
            chunk: 1,
        };
        let decoded: Request = read_message(&mut reader).expect("Failed to read trickled frame");
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_read_message_too_large() {
        let mut buffer = Vec::new();
        let len: u32 = 20 * 1024 * 1024;
        buffer.extend_from_slice(&len.to_be_bytes());

        let mut cursor = Cursor::new(buffer);
        let result: Result<Request, _> = read_message(&mut cursor);

        let err = result.unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_truncated_body_is_protocol_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_be_bytes());
        buffer.extend_from_slice(b"{\"cmd\"");

        let mut cursor = Cursor::new(buffer);
        match read_frame(&mut cursor) {
            Err(ProtocolError::Truncated { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 6);
            }
            other => panic!("Expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_eof_is_closed() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(read_frame(&mut cursor), Err(ProtocolError::Closed)));
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let body = b"not json";
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buffer.extend_from_slice(body);

        let mut cursor = Cursor::new(buffer);
        let result: Result<Value, _> = read_message(&mut cursor);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_from_value_unknown_and_missing_command() {
        assert_eq!(
            Request::from_value(json!({"cmd": "explode"})),
            Err(CommandError::UnknownCommand("explode".to_string()))
        );
        assert_eq!(
            Request::from_value(json!({"id": "x"})),
            Err(CommandError::MissingCommand)
        );
    }

    #[test]
    fn test_from_value_missing_field() {
        let err = Request::from_value(json!({"cmd": "cancel"})).unwrap_err();
        match err {
            CommandError::InvalidRequest { command, reason } => {
                assert_eq!(command, "cancel");
                assert!(reason.contains("id"), "reason was: {reason}");
            }
            other => panic!("Expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_from_value_optional_session_fields() {
        assert_eq!(
            Request::from_value(json!({"cmd": "unregister_session"})).unwrap(),
            Request::UnregisterSession { session_id: None }
        );
        assert_eq!(
            Request::from_value(json!({"cmd": "register_session", "session_id": "a", "pid": 42}))
                .unwrap(),
            Request::RegisterSession {
                session_id: Some("a".to_string()),
                pid: Some(42)
            }
        );
    }

    #[test]
    fn test_stage_accepts_integer_delays() {
        let stages: Vec<Stage> = serde_json::from_value(json!([[60, 0], [3600, 2]])).unwrap();
        assert_eq!(stages, vec![Stage::new(60.0, 0), Stage::new(3600.0, 2)]);
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("60:0".parse::<Stage>(), Ok(Stage::new(60.0, 0)));
        assert_eq!("0.5:-1".parse::<Stage>(), Ok(Stage::new(0.5, -1)));
        assert!("60".parse::<Stage>().is_err());
        assert!("x:0".parse::<Stage>().is_err());
    }

    #[test]
    fn test_validate_stages() {
        assert!(validate_stages(&[Stage::new(1.0, 0), Stage::new(2.0, 2)]).is_ok());
        assert!(validate_stages(&[]).is_err());
        assert!(validate_stages(&[Stage::new(-1.0, 0)]).is_err());
        assert!(validate_stages(&[Stage::new(f64::NAN, 0)]).is_err());
        assert!(validate_stages(&[Stage::new(1.0, 3)]).is_err());
        assert!(validate_stages(&[Stage::new(MAX_STAGE_DELAY_SECS + 1.0, 0)]).is_err());
        assert!(validate_stages(&vec![Stage::new(1.0, 0); MAX_STAGES + 1]).is_err());
    }

    #[test]
    fn test_response_into_result() {
        assert_eq!(
            Response::success(json!(1)).into_result(),
            Ok(json!(1))
        );
        assert_eq!(
            Response::failure("nope").into_result(),
            Err("nope".to_string())
        );
    }
}
