//! A single TCP connection to a Recording Server's ImageServer port,
//! framed with `FrameCodec` and driven through the `Closed -> Open ->
//! Broken` lifecycle of §4.4. Plain TCP — the ImageServer protocol is not
//! TLS-wrapped, unlike this crate's camera/FTP ancestry.

use std::net::ToSocketAddrs;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use super::codec::{FrameCodec, MethodCall, ProtoError, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    /// Terminal: a protocol violation or I/O error occurred. A `Connection`
    /// in this state refuses further sends (§4.4 P4).
    Broken,
}

/// Default read timeout if the caller doesn't supply one. A Recording
/// Server that accepted the TCP handshake but never answers a `connect`
/// call is as good as unreachable.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    state: State,
    read_timeout: Duration,
}

impl Connection {
    #[instrument(skip(read_timeout), fields(host, port))]
    pub async fn connect(
        host: &str,
        port: u16,
        read_timeout: Duration,
    ) -> Result<Self, ProtoError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(ProtoError::Io)?
            .next()
            .ok_or_else(|| {
                ProtoError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("could not resolve {host}:{port}"),
                ))
            })?;

        let stream = timeout(read_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProtoError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(ProtoError::Io)?;

        debug!("tcp connected");
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::default()),
            state: State::Open,
            read_timeout,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(stream: TcpStream, read_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
            state: State::Open,
            read_timeout,
        }
    }

    fn ensure_open(&self) -> Result<(), ProtoError> {
        match self.state {
            State::Open => Ok(()),
            State::Closed | State::Broken => Err(ProtoError::ConnectionBroken),
        }
    }

    /// Sends one method call. Does not wait for its response — pairing
    /// requests with responses is the `Pipeliner`'s job (§4.5).
    pub async fn send_call(&mut self, call: &MethodCall, request_id: u32) -> Result<(), ProtoError> {
        self.ensure_open()?;
        let rendered = call.render(request_id);
        if let Err(e) = self.framed.send(rendered).await {
            self.state = State::Broken;
            return Err(e);
        }
        Ok(())
    }

    /// Raw bytes sink for data that isn't a rendered `MethodCall` (none in
    /// this protocol today, but keeps the send path symmetric with `recv`).
    #[cfg(test)]
    pub(crate) async fn send_raw(&mut self, bytes: Bytes) -> Result<(), ProtoError> {
        self.ensure_open()?;
        if let Err(e) = self.framed.send(bytes).await {
            self.state = State::Broken;
            return Err(e);
        }
        Ok(())
    }

    /// Reads the next frame, enforcing the read timeout. Any error — I/O,
    /// protocol violation, or timeout — trips the connection to `Broken`;
    /// the caller must reconnect rather than retry reads on this instance.
    pub async fn recv(&mut self) -> Result<WireMessage, ProtoError> {
        self.ensure_open()?;
        let next = timeout(self.read_timeout, self.framed.next()).await;
        match next {
            Ok(Some(Ok(msg))) => Ok(msg),
            Ok(Some(Err(e))) => {
                self.state = State::Broken;
                Err(e)
            }
            Ok(None) => {
                self.state = State::Broken;
                Err(ProtoError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )))
            }
            Err(_) => {
                self.state = State::Broken;
                Err(ProtoError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "read timed out",
                )))
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.state == State::Broken
    }

    pub async fn close(mut self) {
        self.state = State::Closed;
        let _ = self.framed.close().await;
    }
}
