//! Error types for every layer of the pipeline.
//!
//! | Type | Raised by | Wire behaviour |
//! |------|-----------|----------------|
//! | [`ProtocolError`] | the request decoder | connection aborted, nothing written |
//! | [`AppError`] | middleware, handlers, aroundware | status + JSON error body |
//! | [`AroundwareError`] | [`Barrier`](crate::aroundware::Barrier) bookkeeping | logged loudly, answered with `500` |
//! | [`InvalidTransition`] | the [`Request`](crate::http::Request) state machine | internal bug, surfaces as [`ServerError`] |

use std::any::Any;

use thiserror::Error;

use crate::aroundware::Handle;
use crate::env::StreamClosed;
use crate::http::StatusCode;
use crate::http::request::RequestState;

/// Errors produced by the server and its connections.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    State(#[from] InvalidTransition),
}

/// Malformed bytes on the wire.
///
/// Once one of these is raised the framing of the stream is unknown, so the
/// connection is dropped without writing a response.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("malformed chunked body: {0}")]
    Chunked(&'static str),

    #[error("invalid Content-Length header")]
    ContentLength,

    #[error("both Content-Length and Transfer-Encoding present")]
    AmbiguousLength,

    #[error("unsupported transfer coding: {0}")]
    TransferCoding(String),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request head exceeds {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },

    #[error("request body exceeds {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
}

/// A request-scoped failure raised while servicing a request.
///
/// [`AppError::Http`] is the typed variant: its status and message are sent
/// to the client as-is. Every other variant is an internal failure and is
/// answered with a generic `500` so that internals never leak.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{status}: {message}")]
    Http { status: StatusCode, message: String },

    #[error("aroundware invariant violated: {0}")]
    Aroundware(#[from] AroundwareError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("request dropped without a response")]
    Dropped,

    #[error(transparent)]
    Stream(#[from] StreamClosed),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl AppError {
    /// A typed error carrying its own status code and client-facing message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }

    /// Wraps any error as an opaque internal failure.
    pub fn internal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Internal(err.into())
    }

    /// Converts a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }

    /// The status code sent to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Http { status, .. } => *status,
            _ => StatusCode::InternalServerError,
        }
    }

    /// The message sent to the client.
    pub fn public_message(&self) -> &str {
        match self {
            Self::Http { message, .. } => message,
            _ => StatusCode::InternalServerError.canonical_reason(),
        }
    }

    /// `true` for failures that are bugs rather than client mistakes.
    pub fn is_internal(&self) -> bool {
        !matches!(self, Self::Http { .. })
    }
}

/// Fan-out bookkeeping bug in an aroundware barrier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AroundwareError {
    #[error("response for unknown or already resolved handle `{0}`")]
    UnknownHandle(Handle),

    #[error("handle `{0}` is already pending")]
    DuplicateHandle(Handle),

    #[error("handle `{0}` is reserved for the downstream call")]
    ReservedHandle(Handle),

    #[error("barrier has already fired")]
    AlreadyFired,

    #[error("barrier completion fired twice")]
    DoubleCompletion,
}

/// An illegal move in the request lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("request cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: RequestState,
    pub to: RequestState,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
