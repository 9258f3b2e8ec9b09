//! Decoder for the `application/vnd.amazon.eventstream` binary framing the
//! Bedrock runtime streams responses in.
//!
//! Each frame on the wire is:
//!
//! ```text
//! +--------------+--------------+--------------+
//! | total length | headers len  | prelude CRC  |   12-byte prelude
//! +--------------+--------------+--------------+
//! | headers: (name len u8, name, type u8, value)* |
//! +-----------------------------------------------+
//! | payload (JSON for converse-stream events)     |
//! +--------------+
//! | message CRC  |   CRC32 of everything before it
//! +--------------+
//! ```
//!
//! All integers are big-endian. The prelude CRC covers the first 8 bytes;
//! the message CRC covers the whole frame up to itself. Event identity
//! travels in the `:message-type` and `:event-type` / `:exception-type`
//! string headers.

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = 16;

pub const HEADER_MESSAGE_TYPE: &str = ":message-type";
pub const HEADER_EVENT_TYPE: &str = ":event-type";
pub const HEADER_EXCEPTION_TYPE: &str = ":exception-type";

// ---------------------------------------------------------------------------
// Header values
// ---------------------------------------------------------------------------

/// A typed header value. Converse-stream frames only carry strings, but
/// the framing defines the full set and a decoder must skip them all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bytes(Vec<u8>),
    String(String),
    /// Milliseconds since the epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One decoded frame: ordered headers plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Look up a string-typed header by name.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).and_then(|(_, v)| match v {
            HeaderValue::String(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(HEADER_MESSAGE_TYPE)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(HEADER_EVENT_TYPE)
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(HEADER_EXCEPTION_TYPE)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("prelude CRC mismatch")]
    PreludeCrc,
    #[error("message CRC mismatch")]
    MessageCrc,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// the caller should read more bytes and try again. On success returns the
/// frame and the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < PRELUDE_LEN {
        return Ok(None);
    }

    let total_len = read_u32(buf, 0) as usize;
    let headers_len = read_u32(buf, 4) as usize;
    let prelude_crc = read_u32(buf, 8);

    if crc32fast::hash(&buf[..8]) != prelude_crc {
        return Err(FrameError::PreludeCrc);
    }
    if total_len < MIN_FRAME_LEN || headers_len > total_len - MIN_FRAME_LEN {
        return Err(FrameError::Malformed("inconsistent lengths"));
    }
    if buf.len() < total_len {
        return Ok(None);
    }

    let message_crc = read_u32(buf, total_len - 4);
    if crc32fast::hash(&buf[..total_len - 4]) != message_crc {
        return Err(FrameError::MessageCrc);
    }

    let headers = parse_headers(&buf[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
    let payload = buf[PRELUDE_LEN + headers_len..total_len - 4].to_vec();

    Ok(Some((Frame { headers, payload }, total_len)))
}

fn parse_headers(buf: &[u8]) -> Result<Vec<(String, HeaderValue)>, FrameError> {
    let mut headers = Vec::new();
    let mut at = 0usize;

    while at < buf.len() {
        let name_len = buf[at] as usize;
        at += 1;
        if at + name_len + 1 > buf.len() {
            return Err(FrameError::Malformed("truncated header name"));
        }
        let name = std::str::from_utf8(&buf[at..at + name_len])
            .map_err(|_| FrameError::Malformed("header name is not UTF-8"))?
            .to_string();
        at += name_len;

        let value_type = buf[at];
        at += 1;

        let value = match value_type {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                let raw = take(buf, &mut at, 1)?;
                HeaderValue::Byte(raw[0] as i8)
            }
            3 => {
                let raw = take(buf, &mut at, 2)?;
                HeaderValue::Int16(i16::from_be_bytes([raw[0], raw[1]]))
            }
            4 => {
                let raw = take(buf, &mut at, 4)?;
                HeaderValue::Int32(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            5 => {
                let raw = take(buf, &mut at, 8)?;
                HeaderValue::Int64(i64::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ]))
            }
            6 => {
                let len = read_value_len(buf, &mut at)?;
                HeaderValue::Bytes(take(buf, &mut at, len)?.to_vec())
            }
            7 => {
                let len = read_value_len(buf, &mut at)?;
                let raw = take(buf, &mut at, len)?;
                HeaderValue::String(
                    std::str::from_utf8(raw)
                        .map_err(|_| FrameError::Malformed("string header is not UTF-8"))?
                        .to_string(),
                )
            }
            8 => {
                let raw = take(buf, &mut at, 8)?;
                HeaderValue::Timestamp(i64::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ]))
            }
            9 => {
                let raw = take(buf, &mut at, 16)?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(raw);
                HeaderValue::Uuid(uuid)
            }
            _ => return Err(FrameError::Malformed("unknown header value type")),
        };

        headers.push((name, value));
    }

    Ok(headers)
}

fn read_value_len(buf: &[u8], at: &mut usize) -> Result<usize, FrameError> {
    let raw = take(buf, at, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize)
}

fn take<'a>(buf: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8], FrameError> {
    if *at + len > buf.len() {
        return Err(FrameError::Malformed("truncated header value"));
    }
    let slice = &buf[*at..*at + len];
    *at += len;
    Ok(slice)
}

// ---------------------------------------------------------------------------
// Encoding (test support)
// ---------------------------------------------------------------------------

/// Build a valid wire frame with string headers. Only tests encode frames;
/// production code is strictly a consumer of this format.
#[cfg(test)]
pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7u8);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total_len = PRELUDE_LEN + header_bytes.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&frame[..8]).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(&frame).to_be_bytes());
    frame
}

/// Convenience: a converse-stream event frame with a JSON payload.
#[cfg(test)]
pub(crate) fn encode_event(event_type: &str, payload_json: &str) -> Vec<u8> {
    encode_frame(
        &[
            (HEADER_MESSAGE_TYPE, "event"),
            (HEADER_EVENT_TYPE, event_type),
            (":content-type", "application/json"),
        ],
        payload_json.as_bytes(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
