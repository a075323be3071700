//! A scripted ImageServer double for the export integration tests: a plain
//! `TcpListener` that answers `connect`/`goto`/`next`/`connectupdate` with
//! hand-built wire frames, mirroring §4.3 byte-for-byte without pulling in
//! the crate's own codec (so a bug in the codec can't hide a bug here).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const PROPRIETARY_CONTENT_TYPE: &str = "application/x-genericbytedata-octet-stream";
pub const H264_CODEC_ID: u16 = 0x000A;

#[derive(Clone, Copy)]
pub enum ScriptCodec {
    H264,
    Jpeg,
    Unsupported(u16),
}

/// One scripted recorded frame: timestamp plus the codec payload a real
/// recorder would have already classified as one of the above.
pub struct ScriptFrame {
    pub current_ts_ms: i64,
    pub next_ts_ms: i64,
    pub corrupt_trailer: bool,
}

impl ScriptFrame {
    pub fn new(current_ts_ms: i64, next_ts_ms: i64) -> Self {
        Self {
            current_ts_ms,
            next_ts_ms,
            corrupt_trailer: false,
        }
    }

    /// A frame whose post-payload trailer is deliberately malformed (§8
    /// scenario 4), in place of the required `\r\n\r\n`.
    pub fn corrupt(current_ts_ms: i64) -> Self {
        Self {
            current_ts_ms,
            next_ts_ms: -1,
            corrupt_trailer: true,
        }
    }
}

pub async fn start(codec: ScriptCodec, frames: Vec<ScriptFrame>) -> std::net::SocketAddr {
    start_with_delay(codec, frames, std::time::Duration::ZERO).await
}

/// Like `start`, but sleeps `delay` before answering each `next`/`goto`.
/// Used to let wall-clock time pass between frames so a `Pipeliner` refresh
/// interval can elapse mid-export (§8 scenario 5).
pub async fn start_with_delay(
    codec: ScriptCodec,
    frames: Vec<ScriptFrame>,
    delay: std::time::Duration,
) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve(stream, codec, frames, delay).await;
    });
    addr
}

async fn serve(
    mut stream: TcpStream,
    codec: ScriptCodec,
    frames: Vec<ScriptFrame>,
    delay: std::time::Duration,
) {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4096];
    let mut frame_iter = frames.into_iter();

    loop {
        let n = match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&scratch[..n]);

        while let Some(pos) = find_separator(&buf) {
            let request = buf.drain(..pos + 4).collect::<Vec<u8>>();
            let text = String::from_utf8_lossy(&request[..request.len() - 4]).into_owned();
            let request_id = extract(&text, "requestid").unwrap_or_default();
            let method = extract(&text, "methodname").unwrap_or_default();

            match method.as_str() {
                "connect" | "connectupdate" => {
                    let response = format!(
                        "<?xml version=\"1.0\"?><methodresponse><requestid>{request_id}</requestid><status>success</status></methodresponse>\r\n\r\n"
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
                "goto" | "next" => {
                    let Some(frame) = frame_iter.next() else {
                        return;
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let bytes = render_image_response(&request_id, codec, &frame);
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                "disconnect" => return,
                other => panic!("mock ImageServer received unexpected method {other}"),
            }
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn extract(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].to_string())
}

fn render_image_response(request_id: &str, codec: ScriptCodec, frame: &ScriptFrame) -> Vec<u8> {
    let payload = match codec {
        ScriptCodec::H264 => {
            let mut p = vec![0u8; 36];
            p[0..2].copy_from_slice(&H264_CODEC_ID.to_be_bytes());
            let nal = [0u8, 0, 0, 1, 0x67, 0x42, 0x00];
            p[8..12].copy_from_slice(&(nal.len() as u32).to_be_bytes());
            p.extend_from_slice(&nal);
            p
        }
        ScriptCodec::Unsupported(id) => {
            let mut p = vec![0u8; 36];
            p[0..2].copy_from_slice(&id.to_be_bytes());
            p
        }
        ScriptCodec::Jpeg => {
            let mut p = vec![0xFF, 0xD8, 0xFF, 0xE0];
            p.extend_from_slice(b"fake-jpeg-bytes");
            p.extend_from_slice(&[0xFF, 0xD9]);
            p
        }
    };

    let content_type = match codec {
        ScriptCodec::Jpeg => "image/jpeg",
        _ => PROPRIETARY_CONTENT_TYPE,
    };

    let header = format!(
        "Content-type: {content_type}\r\nContent-length: {len}\r\nCurrent: {current}\r\nPrev: -1\r\nNext: {next}\r\nRequestId: {request_id}\r\n\r\n",
        len = payload.len(),
        current = frame.current_ts_ms,
        next = frame.next_ts_ms,
    );

    let mut out = header.into_bytes();
    out.extend_from_slice(&payload);
    if frame.corrupt_trailer {
        out.extend_from_slice(b"XXXX");
    } else {
        out.extend_from_slice(b"\r\n\r\n");
    }
    out
}

