//! Length-prefixed message framing over an async byte stream.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::codec::BuildCodec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::BuildMessage;

/// Default bound on a single send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(300);

const READ_CHUNK: usize = 8 * 1024;

pub struct FramedChannel<S> {
    stream: S,
    read_buf: BytesMut,
    send_timeout: Duration,
}

impl FramedChannel<TcpStream> {
    /// Connect to a master listening on `addr`.
    pub async fn connect(addr: &str, send_timeout: Duration) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, send_timeout))
    }
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, send_timeout: Duration) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Write one framed message, failing with `Timeout` if the peer does
    /// not drain it in time.
    pub async fn send(&mut self, msg: &BuildMessage) -> ProtocolResult<()> {
        let frame = BuildCodec::encode(msg)?;
        let limit = self.send_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(Ok(())) => {
                trace!(message = msg.type_name(), bytes = frame.len(), "sent");
                Ok(())
            }
            Ok(Err(e)) if is_disconnect(&e) => Err(ProtocolError::ConnectionClosed),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtocolError::Timeout(limit)),
        }
    }

    /// Read the next message. `None` means the peer closed the connection
    /// between messages.
    pub async fn recv(&mut self) -> ProtocolResult<Option<BuildMessage>> {
        loop {
            if let Some(total) = BuildCodec::frame_len(&self.read_buf)? {
                if self.read_buf.len() >= total {
                    let frame = self.read_buf.split_to(total);
                    let (msg, _) = BuildCodec::decode(&frame)?;
                    trace!(message = msg.type_name(), bytes = total, "received");
                    return Ok(Some(msg));
                }
            }
            self.read_buf.reserve(READ_CHUNK);
            let n = match self.stream.read_buf(&mut self.read_buf).await {
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::FramingError(format!(
                    "connection closed with {} bytes of a partial frame",
                    self.read_buf.len()
                )));
            }
        }
    }

    /// Like [`recv`](Self::recv), but a closed connection is an error.
    pub async fn recv_required(&mut self) -> ProtocolResult<BuildMessage> {
        self.recv().await?.ok_or(ProtocolError::ConnectionClosed)
    }

    /// Send a request and wait for its reply. An `Error` reply becomes
    /// `ProtocolError::RemoteError`.
    pub async fn request(&mut self, msg: &BuildMessage) -> ProtocolResult<BuildMessage> {
        self.send(msg).await?;
        match self.recv_required().await? {
            BuildMessage::Error { code, message } => Err(ProtocolError::RemoteError { code, message }),
            reply => Ok(reply),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_types::ResultStatus;

    fn pair() -> (FramedChannel<tokio::io::DuplexStream>, FramedChannel<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            FramedChannel::new(a, Duration::from_secs(5)),
            FramedChannel::new(b, Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (mut a, mut b) = pair();
        a.send(&BuildMessage::GetCommandToExecute).await.unwrap();
        a.send(&BuildMessage::SpawnResult(ResultStatus::Failed)).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(BuildMessage::GetCommandToExecute));
        assert_eq!(
            b.recv().await.unwrap(),
            Some(BuildMessage::SpawnResult(ResultStatus::Failed))
        );
    }

    #[tokio::test]
    async fn clean_close_is_none() {
        let (a, mut b) = pair();
        drop(a);
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(
            b.recv_required().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn partial_frame_then_close_is_framing_error() {
        let (mut raw, b) = tokio::io::duplex(1024);
        raw.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(raw);
        let mut chan = FramedChannel::new(b, Duration::from_secs(1));
        assert!(matches!(chan.recv().await, Err(ProtocolError::FramingError(_))));
    }

    #[tokio::test]
    async fn send_times_out_when_peer_stops_reading() {
        let (a, _b) = tokio::io::duplex(16);
        let mut chan = FramedChannel::new(a, Duration::from_millis(50));
        let big = BuildMessage::RegisterResult(forge_types::CommandResultEntry {
            log_messages: (0..64)
                .map(|i| forge_types::LogMessage::new("m", forge_types::LogMessageType::Info, format!("line {i}")))
                .collect(),
            ..Default::default()
        });
        let err = chan.send(&big).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[tokio::test]
    async fn request_maps_error_reply() {
        let (mut a, mut b) = pair();
        let server = tokio::spawn(async move {
            let _ = b.recv().await.unwrap();
            b.send(&BuildMessage::Error {
                code: 7,
                message: "no".into(),
            })
            .await
            .unwrap();
        });
        let err = a.request(&BuildMessage::GetOutputObjects).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RemoteError { code: 7, .. }));
        server.await.unwrap();
    }
}
