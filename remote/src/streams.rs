//! Framed message streams over split TCP connections.
//!
//! Messages are length-delimited bincode frames. Bulk data bypasses the
//! framing: the sender writes raw bytes directly after a framed header and
//! the receiver drains them with [`RecvStream::recv_data`], which empties
//! the codec's read buffer before touching the socket.

use bytes::Buf;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use common::{Error, Result};

/// Upper bound on a single framed message; chunked writes of any sensible
/// transfer size fit well under this.
const MAX_FRAME_LENGTH: usize = 256 << 20;

fn codec() -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

fn transport_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Transport(format!("{context}: {err}"))
}

/// Framed send stream for length-delimited messages.
///
/// Generic over the underlying writer type - works with TCP or any AsyncWrite.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        Self {
            framed: tokio_util::codec::FramedWrite::new(stream, codec()),
        }
    }

    pub async fn send_message<T: serde::Serialize>(&mut self, obj: &T) -> Result<()> {
        let bytes =
            bincode::serialize(obj).map_err(|err| transport_err("failed encoding message", err))?;
        self.framed
            .send(bytes::Bytes::from(bytes))
            .await
            .map_err(|err| transport_err("failed sending message", err))?;
        self.framed
            .flush()
            .await
            .map_err(|err| transport_err("failed flushing message", err))?;
        Ok(())
    }

    /// Writes raw bulk bytes, bypassing the framing.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        tracing::trace!(len = data.len(), "sending bulk data");
        let stream = self.framed.get_mut();
        stream
            .write_all(data)
            .await
            .map_err(|err| transport_err("failed sending bulk data", err))?;
        stream
            .flush()
            .await
            .map_err(|err| transport_err("failed flushing bulk data", err))?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited messages.
///
/// Generic over the underlying reader type - works with TCP or any AsyncRead.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            framed: tokio_util::codec::FramedRead::new(stream, codec()),
        }
    }

    /// Receives the next framed message; `None` on clean end of stream.
    pub async fn recv_message<T: serde::de::DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match futures::StreamExt::next(&mut self.framed).await {
            Some(frame) => {
                let bytes = frame.map_err(|err| transport_err("failed receiving message", err))?;
                let obj = bincode::deserialize(&bytes)
                    .map_err(|err| transport_err("failed decoding message", err))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// Fills `buf` with raw bulk bytes, draining anything the codec already
    /// buffered before reading from the underlying stream.
    pub async fn recv_data(&mut self, buf: &mut [u8]) -> Result<()> {
        tracing::trace!(len = buf.len(), "receiving bulk data");
        let read_buffer = self.framed.read_buffer_mut();
        let buffered = read_buffer.len().min(buf.len());
        if buffered > 0 {
            buf[..buffered].copy_from_slice(&read_buffer[..buffered]);
            read_buffer.advance(buffered);
        }
        if buffered < buf.len() {
            self.framed
                .get_mut()
                .read_exact(&mut buf[buffered..])
                .await
                .map_err(|err| transport_err("failed receiving bulk data", err))?;
        }
        Ok(())
    }
}

/// Bidirectional message connection over a single TCP stream.
#[derive(Debug)]
pub struct Connection {
    send: SendStream,
    recv: RecvStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            send: SendStream::new(write_half),
            recv: RecvStream::new(read_half),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| transport_err("failed connecting", err))?;
        Ok(Self::new(stream))
    }

    pub fn send_mut(&mut self) -> &mut SendStream {
        &mut self.send
    }

    pub fn recv_mut(&mut self) -> &mut RecvStream {
        &mut self.recv
    }

    pub async fn send_message<T: serde::Serialize>(&mut self, obj: &T) -> Result<()> {
        self.send.send_message(obj).await
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.send.send_data(data).await
    }

    pub async fn recv_data(&mut self, buf: &mut [u8]) -> Result<()> {
        self.recv.recv_data(buf).await
    }

    /// Receives a reply that the protocol requires; end of stream is a
    /// transport failure.
    pub async fn recv_reply<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        self.recv
            .recv_message()
            .await?
            .ok_or_else(|| Error::Transport("connection closed by peer".to_string()))
    }

    /// One request/response exchange.
    pub async fn call<Q, T>(&mut self, request: &Q) -> Result<T>
    where
        Q: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        self.send.send_message(request).await?;
        self.recv_reply().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Ping {
        seq: u32,
        payload: Vec<u8>,
    }

    #[tokio::test]
    async fn messages_round_trip() -> Result<()> {
        let (client, server) = tokio::io::duplex(4096);
        let (_, write) = tokio::io::split(client);
        let (read, _) = tokio::io::split(server);
        let mut send = SendStream::new(write);
        let mut recv = RecvStream::new(read);
        let sent = Ping {
            seq: 7,
            payload: vec![1, 2, 3],
        };
        send.send_message(&sent).await?;
        let received: Ping = recv.recv_message().await?.unwrap();
        assert_eq!(received, sent);
        Ok(())
    }

    #[tokio::test]
    async fn bulk_data_follows_a_framed_header() -> Result<()> {
        let (client, server) = tokio::io::duplex(64);
        let (_, write) = tokio::io::split(client);
        let (read, _) = tokio::io::split(server);
        let mut send = SendStream::new(write);
        let mut recv = RecvStream::new(read);
        let header = Ping {
            seq: 1,
            payload: vec![],
        };
        let bulk: Vec<u8> = (0..=255).collect();
        let writer = tokio::spawn(async move {
            send.send_message(&header).await?;
            send.send_data(&bulk).await?;
            Ok::<_, Error>(send)
        });
        let received: Ping = recv.recv_message().await?.unwrap();
        assert_eq!(received.seq, 1);
        let mut buf = vec![0u8; 256];
        recv.recv_data(&mut buf).await?;
        assert_eq!(buf, (0..=255).collect::<Vec<u8>>());
        writer.await.expect("writer task panicked")?;
        Ok(())
    }

    #[tokio::test]
    async fn eof_is_none_for_messages() -> Result<()> {
        let (client, server) = tokio::io::duplex(64);
        let (_, write) = tokio::io::split(client);
        let (read, _) = tokio::io::split(server);
        drop(SendStream::new(write));
        let mut recv = RecvStream::new(read);
        assert!(recv.recv_message::<Ping>().await?.is_none());
        Ok(())
    }
}
