//! Cast V2 channel primitives shared by the bridge.
//!
//! A Cast device speaks length-prefixed protobuf frames over TLS on port 8009.
//!
//! Frame format:
//! - len: u32 BE
//! - payload: protobuf `CastMessage` of `len` bytes
//!
//! JSON control messages travel as `payload_utf8` in STRING messages; the
//! namespace selects the virtual channel (connection, heartbeat, receiver, media).

use std::io::{self, Read, Write};

use prost::Message;
use serde_json::Value;

pub const NAMESPACE_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NAMESPACE_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NAMESPACE_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NAMESPACE_MEDIA: &str = "urn:x-cast:com.google.cast.media";
pub const SENDER_ID: &str = "sender-0";
pub const RECEIVER_ID: &str = "receiver-0";

/// Standard Cast control port.
pub const DEFAULT_PORT: u16 = 8009;

/// Largest frame a receiver accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Castv210 = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    String = 0,
    Binary = 1,
}

/// `extensions.api.cast_channel.CastMessage` (proto2).
#[derive(Clone, PartialEq, prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "ProtocolVersion", required, tag = "1")]
    pub protocol_version: i32,
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "PayloadType", required, tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

impl CastMessage {
    /// Build a STRING message carrying a JSON payload from the default sender.
    pub fn json(destination_id: &str, namespace: &str, payload: &Value) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210 as i32,
            source_id: SENDER_ID.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
            payload_type: PayloadType::String as i32,
            payload_utf8: Some(payload.to_string()),
            payload_binary: None,
        }
    }

    /// Decoded payload type; unknown values are treated as binary.
    pub fn kind(&self) -> PayloadType {
        PayloadType::try_from(self.payload_type).unwrap_or(PayloadType::Binary)
    }

    /// The JSON `type` field of a STRING payload, if any.
    pub fn json_type(&self) -> Option<String> {
        if self.kind() != PayloadType::String {
            return None;
        }
        let value: Value = serde_json::from_str(self.payload_utf8.as_deref()?).ok()?;
        value.get("type")?.as_str().map(str::to_string)
    }
}

/// Encode a message into a single buffer (length prefix + protobuf body).
pub fn encode_frame(msg: &CastMessage) -> io::Result<Vec<u8>> {
    let body_len = msg.encoded_len();
    if body_len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cast frame too large ({body_len} bytes)"),
        ));
    }
    let len = u32::try_from(body_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&len.to_be_bytes());
    msg.encode(&mut out)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(out)
}

/// Write one frame and flush.
pub fn write_frame(mut w: impl Write, msg: &CastMessage) -> io::Result<()> {
    let frame = encode_frame(msg)?;
    w.write_all(&frame)?;
    w.flush()
}

/// Read the 4-byte length prefix of the next frame.
fn read_frame_len(mut r: impl Read) -> io::Result<usize> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cast frame too large ({len} bytes)"),
        ));
    }
    Ok(len)
}

/// Read a frame body of `len` bytes and decode it.
fn read_frame_body(mut r: impl Read, len: usize) -> io::Result<CastMessage> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    CastMessage::decode(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read one complete frame.
pub fn read_frame(mut r: impl Read) -> io::Result<CastMessage> {
    let len = read_frame_len(&mut r)?;
    read_frame_body(r, len)
}

/// True for the errors a socket read timeout produces.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Incremental frame reader for sockets with a read timeout.
///
/// Bytes read before a timeout are kept, so the next `poll` resumes the same
/// frame instead of losing sync with the stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    /// Body length once the prefix is complete.
    body_len: Option<usize>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the current frame received so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read until a whole frame is available. A read timeout yields `Ok(None)`.
    pub fn poll(&mut self, mut r: impl Read) -> io::Result<Option<CastMessage>> {
        loop {
            let need = self.body_len.unwrap_or(4);
            if self.buf.len() == need {
                match self.body_len {
                    None => {
                        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                            as usize;
                        if len > MAX_FRAME_LEN {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("cast frame too large ({len} bytes)"),
                            ));
                        }
                        self.buf.clear();
                        self.body_len = Some(len);
                    }
                    Some(_) => {
                        let decoded = CastMessage::decode(&self.buf[..]);
                        self.buf.clear();
                        self.body_len = None;
                        return decoded
                            .map(Some)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                }
                continue;
            }

            let start = self.buf.len();
            self.buf.resize(need, 0);
            let read = r.read(&mut self.buf[start..]);
            let got = match &read {
                Ok(n) => *n,
                Err(_) => 0,
            };
            self.buf.truncate(start + got);
            match read {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}
