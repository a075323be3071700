//! Outbound method-call serialization and inbound response parsing for the
//! ImageServer wire protocol (§4.3). Implemented as a `tokio_util` codec in
//! the same shape as this crate's other framed protocols: discriminate on
//! the first byte, hand off to a shape-specific parser.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use memchr::memmem;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::xml::extract_tag;

const SEPARATOR: &[u8] = b"\r\n\r\n";
/// Guards against buffering forever on a stream that never sends a
/// terminator (malformed peer, or a desync after a missed trailer).
const MAX_HEADER_LEN: usize = 16 * 1024;

pub const PROPRIETARY_CONTENT_TYPE: &str = "application/x-genericbytedata-octet-stream";
pub const PROPRIETARY_HEADER_LEN: usize = 36;
pub const H264_CODEC_ID: u16 = 0x000A;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("short read")]
    ShortRead,

    #[error("declared payload length does not match the bytes actually present")]
    ContentLengthMismatch,

    #[error("missing or corrupt trailer after image payload")]
    MissingTrailer,

    #[error("method response status was not success: {0}")]
    UnexpectedStatus(String),

    #[error("connection is broken and cannot be used further")]
    ConnectionBroken,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded frame (§3 `Frame`). `prev_ts_ms`/`next_ts_ms` of `-1` mean "no
/// neighbor" — start or end of the recorded range.
#[derive(Debug, Clone)]
pub struct Frame {
    pub request_id: u32,
    pub content_type: String,
    pub content_length: u32,
    pub current_ts_ms: i64,
    pub prev_ts_ms: i64,
    pub next_ts_ms: i64,
    pub payload: Bytes,
}

/// Codec classification, derived once from the first frame (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Jpeg,
    RawH264,
    Unsupported(u16),
}

impl Frame {
    /// Classifies this frame's codec without consuming it.
    pub fn classify(&self) -> Codec {
        if self.content_type.eq_ignore_ascii_case("image/jpeg")
            || self.payload.starts_with(&[0xFF, 0xD8, 0xFF])
        {
            return Codec::Jpeg;
        }
        if self
            .content_type
            .eq_ignore_ascii_case(PROPRIETARY_CONTENT_TYPE)
            && self.payload.len() >= 2
        {
            let codec_id = u16::from_be_bytes([self.payload[0], self.payload[1]]);
            return if codec_id == H264_CODEC_ID {
                Codec::RawH264
            } else {
                Codec::Unsupported(codec_id)
            };
        }
        Codec::Unsupported(0)
    }

    /// Strips the 36-byte proprietary header (§4.3), returning the raw
    /// Annex-B codec payload. Only valid when `classify()` returned
    /// `Codec::RawH264` — the caller must not re-strip an already-stripped
    /// payload (P5).
    pub fn strip_proprietary_header(&self) -> Result<Bytes, ProtoError> {
        if self.payload.len() < PROPRIETARY_HEADER_LEN {
            return Err(ProtoError::ShortRead);
        }
        let declared_len = u32::from_be_bytes([
            self.payload[8],
            self.payload[9],
            self.payload[10],
            self.payload[11],
        ]) as usize;
        let remainder = self.payload.slice(PROPRIETARY_HEADER_LEN..);
        if declared_len != remainder.len() {
            return Err(ProtoError::ContentLengthMismatch);
        }
        Ok(remainder)
    }
}

/// An XML method-call response: `<requestid>`/`<status>` (and, for
/// `alarms`, a sequence list this crate does not use — see DESIGN NOTES).
#[derive(Debug, Clone)]
pub struct MethodResponse {
    pub request_id: u32,
    pub status: String,
}

impl MethodResponse {
    pub fn ensure_success(&self) -> Result<(), ProtoError> {
        if self.status.eq_ignore_ascii_case("success") {
            Ok(())
        } else {
            Err(ProtoError::UnexpectedStatus(self.status.clone()))
        }
    }
}

#[derive(Debug, Clone)]
pub enum WireMessage {
    Method(MethodResponse),
    Image(Frame),
}

/// The six method calls this crate issues (§4.3). `connectupdate` carries a
/// fresh ImageServer token; the rest carry no auth material.
#[derive(Debug, Clone)]
pub enum MethodCall {
    Connect {
        camera_id: String,
        connection_token: String,
        always_std_jpeg: bool,
    },
    ConnectUpdate {
        connection_token: String,
    },
    Goto {
        unix_ms: i64,
    },
    Next,
    Previous,
    #[allow(dead_code)]
    Live,
    Disconnect,
}

impl MethodCall {
    fn name(&self) -> &'static str {
        match self {
            MethodCall::Connect { .. } => "connect",
            MethodCall::ConnectUpdate { .. } => "connectupdate",
            MethodCall::Goto { .. } => "goto",
            MethodCall::Next => "next",
            MethodCall::Previous => "previous",
            MethodCall::Live => "live",
            MethodCall::Disconnect => "disconnect",
        }
    }

    fn body(&self) -> String {
        match self {
            MethodCall::Connect {
                camera_id,
                connection_token,
                always_std_jpeg,
            } => format!(
                "<username>dummy</username><password>dummy</password><alwaysstdjpeg>{yn}</alwaysstdjpeg><connectparam>id={cam}&amp;connectiontoken={tok}</connectparam>",
                yn = if *always_std_jpeg { "yes" } else { "no" },
                cam = camera_id,
                tok = connection_token,
            ),
            MethodCall::ConnectUpdate { connection_token } => format!(
                "<connectparam>connectiontoken={tok}</connectparam>",
                tok = connection_token
            ),
            MethodCall::Goto { unix_ms } => format!("<time>{unix_ms}</time>"),
            MethodCall::Next | MethodCall::Previous | MethodCall::Live | MethodCall::Disconnect => {
                String::new()
            }
        }
    }

    /// Renders the outbound envelope (§4.3 template) for `request_id`.
    pub fn render(&self, request_id: u32) -> Bytes {
        let envelope = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><methodcall><requestid>{id}</requestid><methodname>{name}</methodname>{body}</methodcall>\r\n\r\n",
            id = request_id,
            name = self.name(),
            body = self.body(),
        );
        Bytes::from(envelope.into_bytes())
    }
}

/// Framed codec for the ImageServer TCP protocol. Decoding discriminates on
/// the first non-whitespace byte: `<` means an XML method response,
/// anything else means an ImageResponse (§4.3).
#[derive(Default)]
pub struct FrameCodec(());

impl Decoder for FrameCodec {
    type Item = WireMessage;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let first_non_ws = match src.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => i,
            None => return Ok(None),
        };
        if src[first_non_ws] == b'<' {
            decode_xml(src).map(|opt| opt.map(WireMessage::Method))
        } else {
            decode_image(src).map(|opt| opt.map(WireMessage::Image))
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn decode_xml(src: &mut BytesMut) -> Result<Option<MethodResponse>, ProtoError> {
    let end = match memmem::find(src, SEPARATOR) {
        Some(idx) => idx,
        None => {
            if src.len() > MAX_HEADER_LEN {
                return Err(ProtoError::BadHeader("xml response too large".into()));
            }
            return Ok(None);
        }
    };
    let buf = src.split_to(end + SEPARATOR.len());
    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProtoError::BadHeader("non-utf8 xml response".into()))?;

    let request_id = extract_tag(text, "requestid")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| ProtoError::BadHeader("missing <requestid>".into()))?;
    let status = extract_tag(text, "status")
        .ok_or_else(|| ProtoError::BadHeader("missing <status>".into()))?;

    Ok(Some(MethodResponse { request_id, status }))
}

fn decode_image(src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
    let header_end = match memmem::find(src, SEPARATOR) {
        Some(idx) => idx,
        None => {
            if src.len() > MAX_HEADER_LEN {
                return Err(ProtoError::BadHeader("image header too large".into()));
            }
            return Ok(None);
        }
    };

    let header_text = std::str::from_utf8(&src[..header_end])
        .map_err(|_| ProtoError::BadHeader("non-ascii image header".into()))?;
    let headers = parse_header_lines(header_text);

    let content_type = headers
        .get("content-type")
        .cloned()
        .ok_or_else(|| ProtoError::BadHeader("missing Content-type".into()))?;
    let content_length: u32 = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ProtoError::BadHeader("missing Content-length".into()))?;
    let request_id: u32 = headers
        .get("requestid")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ProtoError::BadHeader("missing RequestId".into()))?;
    let current_ts_ms: i64 = headers
        .get("current")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ProtoError::BadHeader("missing Current".into()))?;
    let prev_ts_ms: i64 = headers.get("prev").and_then(|v| v.parse().ok()).unwrap_or(-1);
    let next_ts_ms: i64 = headers.get("next").and_then(|v| v.parse().ok()).unwrap_or(-1);

    let total_needed = header_end + SEPARATOR.len() + content_length as usize + SEPARATOR.len();
    if src.len() < total_needed {
        // Not a protocol error yet; wait for the rest to arrive.
        return Ok(None);
    }

    let mut buf = src.split_to(total_needed);
    let _ = buf.split_to(header_end + SEPARATOR.len());
    let payload = buf.split_to(content_length as usize).freeze();
    let trailer = buf.split_to(SEPARATOR.len());
    if &trailer[..] != SEPARATOR {
        return Err(ProtoError::MissingTrailer);
    }

    Ok(Some(Frame {
        request_id,
        content_type,
        content_length,
        current_ts_ms,
        prev_ts_ms,
        next_ts_ms,
        payload,
    }))
}

fn parse_header_lines(text: &str) -> HashMap<String, String> {
    text.split("\r\n")
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}
