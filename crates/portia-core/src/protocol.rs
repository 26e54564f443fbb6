use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "0.1.0";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const REPLY_CMD: &str = "reply";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Get,
    Annotate,
    Resolve,
}

impl CommandName {
    pub const ALL: [CommandName; 3] = [
        CommandName::Get,
        CommandName::Annotate,
        CommandName::Resolve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Get => "get",
            CommandName::Annotate => "annotate",
            CommandName::Resolve => "resolve",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MsisdnArgs {
    pub msisdn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnnotateArgs {
    pub msisdn: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(MsisdnArgs),
    Annotate(AnnotateArgs),
    Resolve(MsisdnArgs),
}

impl Command {
    pub fn name(&self) -> CommandName {
        match self {
            Command::Get(_) => CommandName::Get,
            Command::Annotate(_) => CommandName::Annotate,
            Command::Resolve(_) => CommandName::Resolve,
        }
    }

    fn bind(name: CommandName, args: Value) -> Result<Self, ProtocolError> {
        let invalid = |err: serde_json::Error| ProtocolError::InvalidArguments {
            command: name.as_str(),
            reason: err.to_string(),
        };
        match name {
            CommandName::Get => serde_json::from_value(args)
                .map(Command::Get)
                .map_err(invalid),
            CommandName::Annotate => serde_json::from_value(args)
                .map(Command::Annotate)
                .map_err(invalid),
            CommandName::Resolve => serde_json::from_value(args)
                .map(Command::Resolve)
                .map_err(invalid),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Caller-chosen correlation value, echoed back verbatim.
    pub id: Value,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Protocol version mismatch. Expected: {expected}, got: {got}.")]
    VersionMismatch { expected: &'static str, got: String },
    #[error("Unsupported command: {0}.")]
    UnsupportedCommand(String),
    #[error("Invalid arguments for {command}: {reason}")]
    InvalidArguments {
        command: &'static str,
        reason: String,
    },
}

/// A request that failed before dispatch, with whatever correlation fields
/// were readable at the time.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRequest {
    pub error: ProtocolError,
    pub reference_cmd: Option<String>,
    pub reference_id: Value,
}

impl From<FrameError> for RejectedRequest {
    fn from(err: FrameError) -> Self {
        Self::unreferenced(ProtocolError::Malformed(err.to_string()))
    }
}

impl RejectedRequest {
    fn unreferenced(error: ProtocolError) -> Self {
        Self {
            error,
            reference_cmd: None,
            reference_id: Value::Null,
        }
    }

    pub fn into_reply(self) -> Reply {
        Reply::error(self.reference_cmd, self.reference_id, self.error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        cmd: String,
        reference_cmd: String,
        #[serde(default)]
        reference_id: Value,
        version: String,
        response: Value,
    },
    Error {
        reference_cmd: Option<String>,
        #[serde(default)]
        reference_id: Value,
        message: String,
        version: String,
    },
}

impl Reply {
    pub fn ok(reference_cmd: &str, reference_id: Value, response: Value) -> Self {
        Reply::Ok {
            cmd: REPLY_CMD.to_string(),
            reference_cmd: reference_cmd.to_string(),
            reference_id,
            version: PROTOCOL_VERSION.to_string(),
            response,
        }
    }

    pub fn error(reference_cmd: Option<String>, reference_id: Value, message: String) -> Self {
        Reply::Error {
            reference_cmd,
            reference_id,
            message,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    raw
}

/// Splits an inbound byte stream into request lines. A line that outgrows
/// `max_frame_bytes` before its newline arrives is reported once as
/// `OversizedBuffer` and the rest of it is dropped up to the next `\n`.
#[derive(Debug)]
pub struct LineFramer {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// Lines and overflow errors come back in stream order. Blank lines are
    /// skipped.
    pub fn push_chunk(&mut self, mut chunk: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        let mut out = Vec::new();
        while !chunk.is_empty() {
            let newline = chunk.iter().position(|byte| *byte == b'\n');
            let (head, rest) = match newline {
                Some(idx) => (&chunk[..idx], Some(&chunk[idx + 1..])),
                None => (chunk, None),
            };

            if !self.discarding {
                self.pending.extend_from_slice(head);
                // one byte of slack for a trailing \r
                if self.pending.len() > self.max_frame_bytes + 1 {
                    out.push(Err(FrameError::OversizedBuffer {
                        size: self.pending.len(),
                        max: self.max_frame_bytes,
                    }));
                    self.pending = Vec::new();
                    self.discarding = true;
                }
            }

            match rest {
                Some(rest) => {
                    if self.discarding {
                        self.discarding = false;
                    } else {
                        let line = std::mem::take(&mut self.pending);
                        if !is_blank(&line) {
                            out.push(Ok(line));
                        }
                    }
                    chunk = rest;
                }
                None => break,
            }
        }
        out
    }

    /// Whatever is left once the peer stops sending, unless it was blank or
    /// already rejected.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let line = std::mem::take(&mut self.pending);
        if self.discarding || is_blank(&line) {
            self.discarding = false;
            return None;
        }
        Some(line)
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Parses one request line. Version is checked before the command is looked
/// up, and both before any argument is bound.
pub fn parse_request(line: &[u8], max_frame_bytes: usize) -> Result<Request, RejectedRequest> {
    let value: Value = decode_frame(line, max_frame_bytes).map_err(RejectedRequest::from)?;
    let Value::Object(mut object) = value else {
        return Err(RejectedRequest::unreferenced(ProtocolError::Malformed(
            "expected a JSON object".to_string(),
        )));
    };

    // non-string commands are echoed as their JSON text
    let reference_cmd = match object.get("cmd") {
        None | Some(Value::Null) => None,
        Some(cmd) => Some(describe(Some(cmd))),
    };
    let reference_id = object.remove("id").unwrap_or(Value::Null);
    let reject = |error: ProtocolError| RejectedRequest {
        error,
        reference_cmd: reference_cmd.clone(),
        reference_id: reference_id.clone(),
    };

    match object.get("version") {
        Some(Value::String(version)) if version == PROTOCOL_VERSION => {}
        other => {
            return Err(reject(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: describe(other),
            }))
        }
    }

    let name = object
        .get("cmd")
        .and_then(Value::as_str)
        .and_then(CommandName::lookup);
    let Some(name) = name else {
        return Err(reject(ProtocolError::UnsupportedCommand(describe(
            object.get("cmd"),
        ))));
    };

    let args = match object.remove("request") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(args) => args,
    };
    let command = Command::bind(name, args).map_err(reject)?;

    Ok(Request {
        id: reference_id,
        command,
    })
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
