//! Request heads (parsed with [`httparse`]) and the per-message lifecycle.
//!
//! A [`Request`] is born when its head has been decoded and walks
//! `ReadingBody → Complete → Servicing → Responded`. The state before a head
//! exists (awaiting headers) belongs to the [`RequestDecoder`](super::RequestDecoder).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::parser::Framing;
use super::{Headers, Method, Version};
use crate::env::{CloseHooks, Env, StreamFrame, StreamHandle};
use crate::error::{AppError, InvalidTransition, ProtocolError};

/// The request line and header block of one HTTP/1.x message.
///
/// # Examples
///
/// ```
/// use weft::http::RequestHead;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (head, offset) = RequestHead::parse(raw).unwrap().unwrap();
///
/// assert_eq!(head.method().as_str(), "GET");
/// assert_eq!(head.path(), "/hello");
/// assert_eq!(head.query_param("name"), Some("world"));
/// assert_eq!(head.headers().get("host"), Some("localhost"));
/// assert_eq!(offset, raw.len());
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    params: HashMap<String, String>,
}

impl RequestHead {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a request head from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the head is still incomplete, otherwise the
    /// head and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Parse`] for malformed bytes, [`ProtocolError::MissingField`]
    /// if `httparse` reports a complete head without a method, path or version.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let head_len = match raw.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let method = match raw
            .method
            .ok_or(ProtocolError::MissingField { field: "method" })?
            .parse::<Method>()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let target = raw.path.ok_or(ProtocolError::MissingField { field: "path" })?;
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };

        let version = Version::from_minor(
            raw.version
                .ok_or(ProtocolError::MissingField { field: "version" })?,
        );

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Ok(Some((
            Self {
                method,
                path,
                query,
                version,
                headers: header_map,
                params,
            },
            head_len,
        )))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Whether the client wants the connection kept open after this exchange.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close unless
    /// `Connection: keep-alive` is sent.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            false
        } else if self.headers.has_token("connection", "keep-alive") {
            true
        } else {
            self.version == Version::Http11
        }
    }

    /// How the message body is delimited (RFC 9112 §6.3).
    ///
    /// # Errors
    ///
    /// Conflicting or unparseable length information is a [`ProtocolError`]:
    /// the end of the message cannot be found, so the stream is unusable.
    pub fn framing(&self) -> Result<Framing, ProtocolError> {
        let chunked = if self.headers.contains("transfer-encoding") {
            let last = self
                .headers
                .get_all("transfer-encoding")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last()
                .unwrap_or_default();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ProtocolError::TransferCoding(last.to_owned()));
            }
            true
        } else {
            false
        };

        let mut length: Option<u64> = None;
        for value in self.headers.get_all("content-length") {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ProtocolError::ContentLength)?;
            match length {
                Some(seen) if seen != parsed => return Err(ProtocolError::ContentLength),
                _ => length = Some(parsed),
            }
        }

        match (chunked, length) {
            (true, Some(_)) => Err(ProtocolError::AmbiguousLength),
            (true, None) => Ok(Framing::Chunked),
            (false, Some(0)) | (false, None) => Ok(Framing::Empty),
            (false, Some(n)) => Ok(Framing::Length(n)),
        }
    }
}

/// Parses `key=value&key2=value2`, decoding `+` as a space.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

/// Where a [`Request`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    ReadingBody,
    Complete,
    Servicing,
    Responded,
}

/// What a completed request hands to the dispatcher.
#[derive(Debug)]
pub enum Service {
    /// Run the chain with this environment.
    Dispatch(Env),
    /// A request hook failed while the message was read; answer with this error.
    Reject(AppError),
}

/// One HTTP message on a connection, from decoded head to written response.
pub struct Request {
    seq: u64,
    state: RequestState,
    head: Arc<RequestHead>,
    env: Option<Env>,
    frames: Option<mpsc::UnboundedReceiver<StreamFrame>>,
    close_hooks: CloseHooks,
    failure: Option<AppError>,
}

impl Request {
    /// Builds the request and its environment right after the head was decoded.
    pub fn new(seq: u64, head: RequestHead, peer: Option<SocketAddr>) -> Self {
        let head = Arc::new(head);
        let (stream, frames) = StreamHandle::channel();
        let close_hooks = CloseHooks::default();
        let env = Env::from_parts(Arc::clone(&head), peer, stream, close_hooks.clone());
        Self {
            seq,
            state: RequestState::ReadingBody,
            head,
            env: Some(env),
            frames: Some(frames),
            close_hooks,
            failure: None,
        }
    }

    /// Position of this request on its connection, starting at 0.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// The environment, while the request is still being read.
    pub fn env_mut(&mut self) -> Option<&mut Env> {
        self.env.as_mut()
    }

    /// Records a hook failure. The body keeps draining; only the first error is kept.
    pub fn fail(&mut self, err: AppError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Marks the whole message as received.
    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition(RequestState::ReadingBody, RequestState::Complete)
    }

    /// Moves a complete request into service.
    pub fn begin_service(&mut self) -> Result<Service, InvalidTransition> {
        self.transition(RequestState::Complete, RequestState::Servicing)?;
        if let Some(err) = self.failure.take() {
            self.env = None;
            return Ok(Service::Reject(err));
        }
        match self.env.take() {
            Some(env) => Ok(Service::Dispatch(env)),
            None => Ok(Service::Reject(AppError::Dropped)),
        }
    }

    /// Receiving side of the request's stream handle; taken once by the connection.
    pub(crate) fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<StreamFrame>> {
        self.frames.take()
    }

    /// Marks the response as fully written.
    pub fn responded(&mut self) -> Result<(), InvalidTransition> {
        self.transition(RequestState::Servicing, RequestState::Responded)
    }

    /// Drops a request that will never be answered and runs its close hooks.
    pub fn cancel(self) {
        debug!(
            seq = self.seq,
            state = ?self.state,
            path = %self.head.path(),
            "request cancelled"
        );
        self.close_hooks.run();
    }

    fn transition(&mut self, from: RequestState, to: RequestState) -> Result<(), InvalidTransition> {
        if self.state != from {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("seq", &self.seq)
            .field("state", &self.state)
            .field("method", self.head.method())
            .field("path", &self.head.path())
            .field("failed", &self.failure.is_some())
            .finish()
    }
}
