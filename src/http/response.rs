//! HTTP/1.1 response builder and wire serialization.
//!
//! A response either carries its whole body ([`Body::Full`]) or is a
//! streaming response ([`Body::Streaming`]): only the head is written by the
//! connection, and the body is pushed afterwards through the request's
//! [`StreamHandle`](crate::env::StreamHandle).

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode};
use crate::error::AppError;

/// Response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// The complete body; `Content-Length` is derived from it.
    Full(Bytes),
    /// Sentinel: the head goes out now, the body follows through the stream
    /// handle, and the response is only finished by a stream close.
    Streaming,
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use weft::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Full(Bytes::new()),
            keep_alive: true,
        }
    }

    /// A plain streaming response: raw bytes follow the head until the stream
    /// is closed. Without a `Content-Length` the connection closes afterwards.
    pub fn streaming(status: StatusCode) -> Self {
        Self {
            body: Body::Streaming,
            ..Self::new(status)
        }
    }

    /// A chunked streaming response (`Transfer-Encoding: chunked`).
    pub fn chunked(status: StatusCode) -> Self {
        Self::streaming(status).header("Transfer-Encoding", "chunked")
    }

    /// The structured body sent for an [`AppError`]:
    /// `{"status": <code>, "error": <message>}`.
    pub fn from_error(err: &AppError) -> Self {
        let status = err.status();
        let payload = serde_json::json!({
            "status": status.as_u16(),
            "error": err.public_message(),
        });
        Self::new(status)
            .header("Content-Type", "application/json")
            .body(payload.to_string())
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a list-valued header as repeated header lines.
    #[must_use]
    pub fn header_values<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.headers.append_all(name, values);
        self
    }

    /// Appends a header in-place. Intended for post-processing hooks that
    /// decorate a response produced downstream.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body_bytes(bytes))
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn payload(&self) -> &Body {
        &self.body
    }

    pub fn is_streaming(&self) -> bool {
        self.body == Body::Streaming
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    /// A plain stream has no length, so only closing the connection ends it.
    pub fn is_close_delimited(&self) -> bool {
        self.is_streaming() && !self.is_chunked() && !self.headers.contains("content-length")
    }

    /// Serializes the response using HTTP/1.1 wire format.
    ///
    /// For a full body this adds `Content-Type: text/plain; charset=utf-8`
    /// when the body is non-empty and untyped, and `Content-Length`
    /// (omitted, with the body, for statuses that forbid one). For a
    /// streaming response only the head is produced.
    /// `Connection: keep-alive` or `Connection: close` is always written.
    pub fn into_bytes(self) -> BytesMut {
        self.serialize(true)
    }

    /// Serializes the head a `HEAD` request gets: the same status line and
    /// headers, `Content-Length` included, but no body bytes.
    pub fn into_head_bytes(self) -> BytesMut {
        self.serialize(false)
    }

    fn serialize(mut self, with_body: bool) -> BytesMut {
        let body = match std::mem::replace(&mut self.body, Body::Streaming) {
            Body::Full(bytes) if self.status.allows_body() => Some(bytes),
            Body::Full(_) => Some(Bytes::new()),
            Body::Streaming => None,
        };

        if let Some(bytes) = &body {
            self.headers.remove("content-length");
            self.headers.remove("transfer-encoding");
            if !bytes.is_empty() && !self.headers.contains("content-type") {
                self.headers
                    .insert("Content-Type", "text/plain; charset=utf-8");
            }
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let body_len = body.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + body_len);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        self.headers.write_to(&mut buf);

        if let Some(bytes) = body {
            if self.status.allows_body() {
                buf.put(format!("Content-Length: {body_len}\r\n").as_bytes());
            }
            buf.put_slice(b"\r\n");
            if with_body {
                buf.put(bytes);
            }
        } else {
            buf.put_slice(b"\r\n");
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl From<StatusCode> for Response {
    fn from(status: StatusCode) -> Self {
        Self::new(status)
    }
}
