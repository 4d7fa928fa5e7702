//! Codec for newline-delimited JSON envelopes.
//!
//! Each envelope is one JSON object followed by `\n`. [`encode`] produces the
//! object bytes without the delimiter; transports that frame by line append
//! it, message-oriented transports (WebSocket) send the bytes as-is.

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Command, ErrorCode, Event};

/// Default maximum frame size (64 KiB), excluding the delimiter.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum")]
    FrameTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The frame is not valid JSON, or its fields do not fit the command.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The frame is JSON but not an object.
    #[error("Envelope must be a JSON object")]
    NotAnObject,

    /// The object has neither a `type` nor a `command` tag.
    #[error("Envelope has no \"type\" or \"command\" tag")]
    MissingTag,

    /// The tag names no known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A `state_update` whose fields are not a JSON object.
    #[error("State fields must be a JSON object")]
    InvalidState,
}

impl ProtocolError {
    /// Error code reported to the client that sent the offending frame.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::FrameTooLarge(_) => ErrorCode::FrameTooLarge,
            ProtocolError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            ProtocolError::InvalidState => ErrorCode::InvalidState,
            ProtocolError::Encode(_)
            | ProtocolError::Decode(_)
            | ProtocolError::NotAnObject
            | ProtocolError::MissingTag => ErrorCode::DecodeError,
        }
    }
}

/// Encode an envelope to JSON bytes (no trailing delimiter).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Encode an envelope followed by the line delimiter.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_line<T: Serialize>(envelope: &T) -> Result<Bytes, ProtocolError> {
    let mut data = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;
    data.push(DELIMITER);
    Ok(Bytes::from(data))
}

/// Decode one frame into a command.
///
/// The tag is read from `command` first, then `type`. A tag that names no
/// known command yields [`ProtocolError::UnknownCommand`], which is kept
/// distinct from malformed JSON so the client can be told which it was.
///
/// # Errors
///
/// Returns an error if the frame is not a well-formed command.
pub fn decode(frame: &[u8]) -> Result<Command, ProtocolError> {
    let value: Value = serde_json::from_slice(trim_line(frame)).map_err(ProtocolError::Decode)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let tag = match object.remove("command") {
        Some(Value::String(tag)) => tag,
        Some(_) => return Err(ProtocolError::MissingTag),
        None => match object.remove("type") {
            Some(Value::String(tag)) => tag,
            _ => return Err(ProtocolError::MissingTag),
        },
    };

    if !Command::TAGS.contains(&tag.as_str()) {
        return Err(ProtocolError::UnknownCommand(tag));
    }

    if tag == "state_update" {
        let fields = object.get("fields").or_else(|| object.get("state"));
        if fields.is_some_and(|value| !value.is_object()) {
            return Err(ProtocolError::InvalidState);
        }
    }

    object.insert("type".to_string(), Value::String(tag));
    serde_json::from_value(Value::Object(object)).map_err(ProtocolError::Decode)
}

/// Decode one frame into an event, as a client would.
///
/// # Errors
///
/// Returns an error if the frame is not a well-formed event.
pub fn decode_event(frame: &[u8]) -> Result<Event, ProtocolError> {
    serde_json::from_slice(trim_line(frame)).map_err(ProtocolError::Decode)
}

fn trim_line(frame: &[u8]) -> &[u8] {
    let mut end = frame.len();
    while end > 0 && matches!(frame[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &frame[..end]
}

/// Splits a byte stream into line frames.
///
/// A line longer than the limit is reported once as
/// [`ProtocolError::FrameTooLarge`] and the rest of it is discarded up to the
/// next delimiter, so the stream stays usable afterwards.
#[derive(Debug)]
pub struct LineFramer {
    max_frame_size: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl LineFramer {
    /// Create a framer with the given frame size limit.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            discarding: false,
        }
    }

    /// The frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Try to take the next complete frame out of `buf`.
    ///
    /// Returns `Ok(Some(frame))` without the delimiter, `Ok(None)` if more
    /// data is needed. Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] for an oversized line.
    pub fn next_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            let newline = buf.iter().position(|b| *b == DELIMITER);

            if self.discarding {
                match newline {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            match newline {
                Some(pos) => {
                    let line = buf.split_to(pos + 1);
                    let frame = trim_line(&line);
                    if frame.len() > self.max_frame_size {
                        return Err(ProtocolError::FrameTooLarge(frame.len()));
                    }
                    if frame.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Some(Bytes::copy_from_slice(frame)));
                }
                None if buf.len() > self.max_frame_size => {
                    let size = buf.len();
                    buf.clear();
                    self.discarding = true;
                    return Err(ProtocolError::FrameTooLarge(size));
                }
                None => return Ok(None),
            }
        }
    }

    /// Take whatever is left in `buf` once the stream has ended.
    ///
    /// A final line without a delimiter still counts as a frame.
    pub fn finish(&mut self, buf: &mut BytesMut) -> Option<Bytes> {
        if self.discarding {
            buf.clear();
            self.discarding = false;
            return None;
        }
        let rest = buf.split();
        let frame = trim_line(&rest);
        if frame.is_empty() || frame.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(Bytes::copy_from_slice(frame))
    }
}
