//! Incremental request decoder: socket bytes in, message events out.
//!
//! The decoder never buffers a body itself. Each call to
//! [`RequestDecoder::decode`] consumes what it can from the connection's read
//! buffer and yields at most one [`ParseEvent`], so bodies of pipelined
//! requests are handed over as they arrive.

use bytes::{Buf, Bytes, BytesMut};

use super::RequestHead;
use crate::error::ProtocolError;

/// Longest chunk-size line (size + extensions) we are willing to buffer.
const MAX_CHUNK_LINE: usize = 1024;

/// How a request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

/// One step of message decoding.
#[derive(Debug)]
pub enum ParseEvent {
    /// A complete request head.
    Head(RequestHead),
    /// A slice of the (de-chunked) body.
    Body(Bytes),
    /// The message ended; the next bytes belong to a new request.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHead,
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Done,
}

/// Push decoder for HTTP/1.x requests, supporting `Content-Length` and
/// `chunked` bodies.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use weft::http::{ParseEvent, RequestDecoder};
///
/// let mut decoder = RequestDecoder::new(8 * 1024, 1024);
/// let mut buf = BytesMut::from(&b"POST /n HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi"[..]);
///
/// assert!(matches!(decoder.decode(&mut buf), Ok(Some(ParseEvent::Head(_)))));
/// assert!(matches!(decoder.decode(&mut buf), Ok(Some(ParseEvent::Body(b))) if b == "hi"));
/// assert!(matches!(decoder.decode(&mut buf), Ok(Some(ParseEvent::Complete))));
/// assert!(matches!(decoder.decode(&mut buf), Ok(None)));
/// ```
#[derive(Debug)]
pub struct RequestDecoder {
    state: State,
    max_head_bytes: usize,
    max_body_bytes: usize,
    body_seen: u64,
}

impl RequestDecoder {
    pub fn new(max_head_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            state: State::AwaitingHead,
            max_head_bytes,
            max_body_bytes,
            body_seen: 0,
        }
    }

    /// `true` between messages, i.e. while waiting for the next request head.
    pub fn is_idle(&self) -> bool {
        self.state == State::AwaitingHead
    }

    /// Consumes bytes from `buf` and returns the next event, or `Ok(None)` when
    /// more input is needed.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] leaves the decoder in an undefined position; the
    /// caller must drop the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ParseEvent>, ProtocolError> {
        loop {
            match self.state {
                State::AwaitingHead => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let Some((head, head_len)) = RequestHead::parse(buf)? else {
                        if buf.len() > self.max_head_bytes {
                            return Err(ProtocolError::HeadTooLarge {
                                max_bytes: self.max_head_bytes,
                            });
                        }
                        return Ok(None);
                    };
                    if head_len > self.max_head_bytes {
                        return Err(ProtocolError::HeadTooLarge {
                            max_bytes: self.max_head_bytes,
                        });
                    }
                    let framing = head.framing()?;
                    buf.advance(head_len);
                    self.body_seen = 0;
                    self.state = match framing {
                        Framing::Empty => State::Done,
                        Framing::Length(n) => {
                            self.account(n)?;
                            State::Length { remaining: n }
                        }
                        Framing::Chunked => State::ChunkSize,
                    };
                    return Ok(Some(ParseEvent::Head(head)));
                }

                State::Length { remaining } => {
                    let Some(chunk) = take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::Done
                    } else {
                        State::Length { remaining: left }
                    };
                    return Ok(Some(ParseEvent::Body(chunk)));
                }

                State::ChunkSize => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        buf.advance(consumed);
                        if size == 0 {
                            self.state = State::Trailers;
                        } else {
                            self.account(size)?;
                            self.state = State::ChunkData { remaining: size };
                        }
                    }
                    Ok(httparse::Status::Partial) => {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(ProtocolError::ChunkSize);
                        }
                        return Ok(None);
                    }
                    Err(_) => return Err(ProtocolError::ChunkSize),
                },

                State::ChunkData { remaining } => {
                    let Some(chunk) = take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                    return Ok(Some(ParseEvent::Body(chunk)));
                }

                State::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ProtocolError::Chunked("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }

                // Trailer fields are read and discarded.
                State::Trailers => match buf.windows(2).position(|w| w == b"\r\n") {
                    Some(0) => {
                        buf.advance(2);
                        self.state = State::Done;
                    }
                    Some(end) => buf.advance(end + 2),
                    None => {
                        if buf.len() > self.max_head_bytes {
                            return Err(ProtocolError::Chunked("trailer section too large"));
                        }
                        return Ok(None);
                    }
                },

                State::Done => {
                    self.state = State::AwaitingHead;
                    return Ok(Some(ParseEvent::Complete));
                }
            }
        }
    }

    fn account(&mut self, len: u64) -> Result<(), ProtocolError> {
        self.body_seen = self.body_seen.saturating_add(len);
        if self.body_seen > self.max_body_bytes as u64 {
            return Err(ProtocolError::BodyTooLarge {
                max_bytes: self.max_body_bytes,
            });
        }
        Ok(())
    }
}

fn take_body(buf: &mut BytesMut, remaining: u64) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }
    let n = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
    Some(buf.split_to(n).freeze())
}
