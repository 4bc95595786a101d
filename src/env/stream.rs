//! Direct-to-socket response streaming.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::http::chunked;

/// The connection that owned this stream is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("stream closed: the connection is no longer accepting writes")]
pub struct StreamClosed;

/// What a [`StreamHandle`] asks the connection to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Bytes written to the socket as-is.
    Data(Bytes),
    /// End of the response cycle.
    Close,
}

/// Per-request handle for writing a streaming response body.
///
/// Frames are queued to the owning connection, which writes them after the
/// response head, bypassing the buffered [`Response`](crate::http::Response).
/// The handle is cheap to clone and can be moved into timers and spawned tasks.
///
/// Two modes share the handle:
///
/// - plain streaming: [`send`](Self::send) … [`close`](Self::close);
/// - chunked: [`send_chunk`](Self::send_chunk) … [`close_chunked`](Self::close_chunked).
#[derive(Debug, Clone)]
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<StreamFrame>,
}

impl StreamHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Writes raw bytes.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), StreamClosed> {
        self.push(StreamFrame::Data(data.into()))
    }

    /// Ends a plain streaming response.
    pub fn close(&self) -> Result<(), StreamClosed> {
        self.push(StreamFrame::Close)
    }

    /// Writes `data` as one chunk. Empty input is skipped, since a zero-length
    /// chunk would terminate the body.
    pub fn send_chunk(&self, data: impl AsRef<[u8]>) -> Result<(), StreamClosed> {
        let data = data.as_ref();
        if data.is_empty() {
            return Ok(());
        }
        self.push(StreamFrame::Data(chunked::encode(data)))
    }

    /// Writes the terminating zero-length chunk and ends the response.
    pub fn close_chunked(&self) -> Result<(), StreamClosed> {
        self.push(StreamFrame::Data(Bytes::from_static(chunked::TERMINATOR)))?;
        self.close()
    }

    /// `true` once the connection has dropped the receiving side.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, frame: StreamFrame) -> Result<(), StreamClosed> {
        self.tx.send(frame).map_err(|_| StreamClosed)
    }
}
