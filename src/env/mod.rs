//! The per-request environment threaded through the middleware chain.
//!
//! An [`Env`] is built by the connection as soon as a request head has been
//! decoded and is moved (never shared) from stage to stage. Everything a stage
//! needs after it handed the environment downstream (the [`Trace`], the
//! [`StreamHandle`], close hooks) is a cheap shared handle inside it.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Bytes, BytesMut};

use crate::http::{Headers, Method, RequestHead, Version};

mod stream;
mod trace;

pub use stream::{StreamClosed, StreamFrame, StreamHandle};
pub use trace::Trace;

/// Type-erased map for request-scoped values set by one stage and read by
/// another, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// One-shot callbacks run when a request is cancelled before its response
/// was written (peer disconnect, protocol abort).
#[derive(Clone, Default)]
pub struct CloseHooks {
    hooks: Arc<Mutex<Vec<CloseHook>>>,
}

impl CloseHooks {
    pub fn register(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Runs and clears every registered hook.
    pub fn run(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook();
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-request environment: request head, body, stream handle, trace,
/// close hooks and typed extensions.
///
/// # Examples
///
/// ```
/// use weft::env::Env;
/// use weft::http::RequestHead;
///
/// let (head, _) = RequestHead::parse(b"GET /users?id=7 HTTP/1.1\r\n\r\n").unwrap().unwrap();
/// let mut env = Env::new(head);
/// env.extensions_mut().insert(42u32);
///
/// assert_eq!(env.path(), "/users");
/// assert_eq!(env.query_param("id"), Some("7"));
/// assert_eq!(env.extensions().get::<u32>(), Some(&42));
/// ```
pub struct Env {
    head: Arc<RequestHead>,
    body: BytesMut,
    peer: Option<SocketAddr>,
    stream: StreamHandle,
    trace: Trace,
    close_hooks: CloseHooks,
    extensions: Extensions,
}

impl Env {
    /// A detached environment: stream writes fail with [`StreamClosed`] and
    /// close hooks only run if the caller runs them.
    pub fn new(head: RequestHead) -> Self {
        let (stream, _) = StreamHandle::channel();
        Self::from_parts(Arc::new(head), None, stream, CloseHooks::default())
    }

    pub(crate) fn from_parts(
        head: Arc<RequestHead>,
        peer: Option<SocketAddr>,
        stream: StreamHandle,
        close_hooks: CloseHooks,
    ) -> Self {
        Self {
            head,
            body: BytesMut::new(),
            peer,
            stream,
            trace: Trace::new(),
            close_hooks,
            extensions: Extensions::new(),
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn query_string(&self) -> Option<&str> {
        self.head.query_string()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.head.query_param(key)
    }

    pub fn version(&self) -> Version {
        self.head.version()
    }

    pub fn headers(&self) -> &Headers {
        self.head.headers()
    }

    pub fn keep_alive(&self) -> bool {
        self.head.is_keep_alive()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Takes the body, leaving an empty buffer behind.
    pub fn take_body(&mut self) -> Bytes {
        self.body.split().freeze()
    }

    /// Parses the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    /// Handle for streaming the response body straight to the connection.
    pub fn stream(&self) -> &StreamHandle {
        &self.stream
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Registers a callback for when the request is cancelled by the
    /// connection going away.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        self.close_hooks.register(hook);
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("method", self.head.method())
            .field("path", &self.head.path())
            .field("body_len", &self.body.len())
            .field("peer", &self.peer)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}
