//! Line-delimited JSON framing over an async byte stream.
//!
//! Stratum servers speak newline-delimited JSON. [`Connection`] wraps any
//! duplex stream (plain TCP, TLS, SOCKS tunnel, or TLS inside a tunnel) and
//! moves whole JSON messages in and out of it. The [`Transport`] trait
//! abstracts message I/O so the client can run over channel-based mocks in
//! tests.

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::trace;

use crate::error::{StratumError, StratumResult};
use crate::messages::Request;

/// Longest line we accept from a server. Large mempool or history replies
/// can run to a few megabytes.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Message-level I/O for the Stratum protocol.
///
/// The client's connection task `select!`s on [`read_message`] alongside its
/// outbound queue, so implementations must make `read_message` cancel-safe:
/// dropping the future before it completes must not lose data.
///
/// [`read_message`]: Transport::read_message
#[async_trait]
pub trait Transport: Send + 'static {
    /// Read one complete, decoded JSON message.
    ///
    /// Returns `None` on clean connection close (EOF). Undecodable input is
    /// reported as [`StratumError::InvalidMessage`] and does not end the
    /// stream.
    async fn read_message(&mut self) -> StratumResult<Option<Value>>;

    /// Write one request.
    async fn write_message(&mut self, msg: &Request) -> StratumResult<()>;

    /// Close the underlying connection.
    async fn shutdown(&mut self) -> StratumResult<()> {
        Ok(())
    }
}

/// Any byte stream a [`Connection`] can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed stream produced by the connector.
pub type BoxedStream = Box<dyn AsyncStream>;

/// One line off the wire.
enum Frame {
    Line(String),
    /// A line we had to throw away, and why
    Rejected(String),
}

/// `LinesCodec` that reports unusable lines as frames instead of errors.
///
/// `FramedRead` ends the stream after any decoder error, so oversized and
/// non-UTF-8 lines must not surface as one. Only reader I/O errors do.
struct LineFramer {
    lines: LinesCodec,
    max_length: usize,
}

impl LineFramer {
    fn new(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    fn frame(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> io::Result<Option<Frame>> {
        match decoded {
            Ok(line) => Ok(line.map(Frame::Line)),
            // The codec discards up to the next newline on later calls
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Rejected(format!(
                "line longer than {} bytes",
                self.max_length
            )))),
            // Raised after the offending line was consumed
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Frame::Rejected(format!("line is not UTF-8: {e}"))))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineFramer {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        let decoded = self.lines.decode(buf);
        self.frame(decoded)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        let decoded = self.lines.decode_eof(buf);
        self.frame(decoded)
    }
}

/// Buffered, framed connection to a Stratum server.
pub struct Connection {
    /// Line-framed reader for incoming messages
    reader: FramedRead<ReadHalf<BoxedStream>, LineFramer>,

    /// Buffered writer for outgoing messages
    writer: BufWriter<WriteHalf<BoxedStream>>,
}

impl Connection {
    /// Create a new connection over an established stream.
    pub fn new(stream: impl AsyncStream + 'static) -> Self {
        Self::with_max_line_length(stream, MAX_LINE_LENGTH)
    }

    fn with_max_line_length(stream: impl AsyncStream + 'static, max_length: usize) -> Self {
        let stream: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: FramedRead::new(read_half, LineFramer::new(max_length)),
            writer: BufWriter::new(write_half),
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<Value>> {
        loop {
            let line = match self.reader.next().await {
                None => return Ok(None),
                Some(Ok(Frame::Line(line))) => line,
                Some(Ok(Frame::Rejected(reason))) => {
                    return Err(StratumError::InvalidMessage(reason));
                }
                Some(Err(e)) => return Err(StratumError::Io(e)),
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            trace!(rx = %line, "Received message");

            let msg = serde_json::from_str(line).map_err(|e| {
                StratumError::InvalidMessage(format!("Failed to parse JSON: {}, line: {}", e, line))
            })?;

            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &Request) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }

    async fn shutdown(&mut self) -> StratumResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// client's side, the handle is the test's side. Dropping the handle looks
/// like the server closing the connection.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<Value>,
    tx: tokio::sync::mpsc::UnboundedSender<Request>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Use `send()` to feed messages to the client and `recv()` to read
/// requests the client wrote.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Value>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Request>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<Value>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &Request) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the client.
    pub fn send(&self, msg: Value) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a request the client wrote.
    ///
    /// Returns `None` once the client has dropped its side.
    pub async fn recv(&mut self) -> Option<Request> {
        self.rx.recv().await
    }

    /// Receive a request if one is already queued.
    pub fn try_recv(&mut self) -> Option<Request> {
        self.rx.try_recv().ok()
    }

    /// Answer `request` with a successful result.
    pub fn respond(&self, request: &Request, result: Value) {
        self.send(serde_json::json!({"id": request.id, "result": result}));
    }
}
