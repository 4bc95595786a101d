//! Middleware chain: an immutable, ordered list of stages in front of an
//! endpoint, with an explicit completion continuation.
//!
//! Every stage is called as `call(env, next, done)` and answers with a
//! [`Reply`]:
//!
//! - [`Reply::Ready`]: the outcome is known now, `done` is never used;
//! - [`Reply::Pending`]: the outcome will be delivered later through `done`,
//!   typically from a spawned task or timer.
//!
//! A stage that wants to act on the result wraps `done` before passing it
//! down ([`Completion::map`]), so work deferred onto the reactor still flows
//! back through every stage. [`AsyncMiddleware`] packages that pattern as a
//! pre/post hook pair that runs its post hook exactly once whichever way
//! downstream answers.
//!
//! ## Core types
//!
//! - [`Chain`] / [`ChainBuilder`]: composed once at startup and shared.
//! - [`Next`]: cursor into the remaining stages.
//! - [`Middleware`] and [`Endpoint`]: the two stage shapes.
//! - [`Completion`]: the one-shot continuation.
//! - [`handler_fn`] / [`sync_fn`]: endpoints from closures.

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use tracing::error;

use crate::env::Env;
use crate::error::AppError;
use crate::http::Response;

mod async_middleware;
mod heartbeat;
mod logger;
mod tracer;
mod validation;

pub use async_middleware::{AsyncMiddleware, AsyncStage};
pub use heartbeat::Heartbeat;
pub use logger::{LoggerMiddleware, RequestLine};
pub use tracer::{TRACE_HEADER, TracerMiddleware};
pub use validation::RequiredParam;

/// The result of servicing a request.
pub type Outcome = Result<Response, AppError>;

/// What a stage answers when it is called.
#[derive(Debug)]
pub enum Reply {
    /// The outcome is available synchronously.
    Ready(Outcome),
    /// The outcome will arrive through the [`Completion`] passed to the stage.
    Pending,
}

impl Reply {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl From<Outcome> for Reply {
    fn from(outcome: Outcome) -> Self {
        Self::Ready(outcome)
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self::Ready(Ok(response))
    }
}

impl From<AppError> for Reply {
    fn from(err: AppError) -> Self {
        Self::Ready(Err(err))
    }
}

/// One-shot continuation that delivers a deferred [`Outcome`] upstream.
///
/// Consumed by [`complete`](Self::complete), so it cannot fire twice. Dropping
/// it without completing after answering [`Reply::Pending`] leaves the
/// request unanswered; the dispatcher turns that into a `500`.
pub struct Completion {
    fire: Box<dyn FnOnce(Outcome) + Send>,
}

impl Completion {
    pub fn new(fire: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            fire: Box::new(fire),
        }
    }

    pub fn complete(self, outcome: Outcome) {
        (self.fire)(outcome)
    }

    /// Returns a continuation that runs `f` on the outcome, then completes
    /// `self` with its result.
    pub fn map(self, f: impl FnOnce(Outcome) -> Outcome + Send + 'static) -> Self {
        Self::new(move |outcome| self.complete(f(outcome)))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// A chain stage sitting in front of the rest of the chain.
///
/// Implementations must be stateless with respect to requests: the same
/// instance serves every request concurrently. Request-scoped data belongs in
/// the [`Env`] or in per-request objects created inside `call`.
///
/// # Contract
///
/// - Return [`Reply::Ready`] to answer (or short-circuit) now. `done` is then
///   dropped unused.
/// - Return [`Reply::Pending`] only after arranging for `done` to be
///   completed exactly once.
/// - To forward, call [`Next::call`] and either return its reply or, for
///   post-processing, pass a [`Completion::map`]-wrapped continuation.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, env: Env, next: Next, done: Completion) -> Reply;
}

/// The innermost stage: the application itself.
pub trait Endpoint: Send + Sync + 'static {
    fn call(&self, env: Env, done: Completion) -> Reply;
}

struct Stages {
    stages: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Endpoint>,
}

/// A cursor into the remaining chain for a single request.
///
/// `Next` is consumed by [`call`](Self::call), so a stage forwards at most once.
pub struct Next {
    chain: Arc<Stages>,
    index: usize,
}

impl Next {
    /// Invokes the next stage, or the endpoint once the stages are exhausted.
    pub fn call(mut self, env: Env, done: Completion) -> Reply {
        match self.chain.stages.get(self.index).cloned() {
            Some(stage) => {
                self.index += 1;
                stage.call(env, self, done)
            }
            None => self.chain.endpoint.call(env, done),
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("stages", &self.chain.stages.len())
            .finish()
    }
}

/// The composed application: stages in declaration order plus an endpoint.
///
/// Built once, then cloned cheaply into every connection. It holds no
/// request state, so invoking it repeatedly with the same input runs the
/// hooks in the same order every time.
///
/// # Examples
///
/// ```rust,no_run
/// use weft::http::{Response, StatusCode};
/// use weft::middleware::{Chain, Heartbeat, LoggerMiddleware, handler_fn};
///
/// let chain = Chain::builder()
///     .with(Heartbeat::new("/status"))
///     .with_async(LoggerMiddleware)
///     .endpoint(handler_fn(|_env| async { Ok(Response::new(StatusCode::Ok).body("hi")) }));
/// assert_eq!(chain.len(), 2);
/// ```
#[derive(Clone)]
pub struct Chain {
    inner: Arc<Stages>,
}

impl Chain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Runs the whole chain for one request.
    pub fn call(&self, env: Env, done: Completion) -> Reply {
        Next {
            chain: Arc::clone(&self.inner),
            index: 0,
        }
        .call(env, done)
    }

    /// Number of stages in front of the endpoint.
    pub fn len(&self) -> usize {
        self.inner.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.stages.is_empty()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("stages", &self.len()).finish()
    }
}

/// Collects stages in declaration order; the first added is the outermost.
#[derive(Default)]
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Middleware>>,
}

impl ChainBuilder {
    #[must_use]
    pub fn with(mut self, stage: impl Middleware) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Adds a pre/post hook middleware.
    #[must_use]
    pub fn with_async<M: AsyncMiddleware>(self, middleware: M) -> Self {
        self.with(AsyncStage::new(middleware))
    }

    /// Terminates the chain and freezes it.
    pub fn endpoint(self, endpoint: impl Endpoint) -> Chain {
        Chain {
            inner: Arc::new(Stages {
                stages: self.stages,
                endpoint: Arc::new(endpoint),
            }),
        }
    }
}

/// Endpoint built from an async closure; see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure as an [`Endpoint`].
///
/// The future is spawned on the runtime and the endpoint always answers
/// [`Reply::Pending`]. A panic inside the future becomes an
/// [`AppError::Panicked`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Env) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Endpoint for HandlerFn<F>
where
    F: Fn(Env) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, env: Env, done: Completion) -> Reply {
        let fut = (self.f)(env);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let err = AppError::from_panic(panic);
                    error!(error = %err, "handler task failed");
                    Err(err)
                });
            done.complete(outcome);
        });
        Reply::Pending
    }
}

/// Endpoint built from a synchronous closure; see [`sync_fn`].
pub struct SyncFn<F> {
    f: F,
}

/// Wraps a synchronous closure as an [`Endpoint`] that always answers
/// [`Reply::Ready`].
pub fn sync_fn<F>(f: F) -> SyncFn<F>
where
    F: Fn(Env) -> Outcome + Send + Sync + 'static,
{
    SyncFn { f }
}

impl<F> Endpoint for SyncFn<F>
where
    F: Fn(Env) -> Outcome + Send + Sync + 'static,
{
    fn call(&self, env: Env, _done: Completion) -> Reply {
        Reply::Ready((self.f)(env))
    }
}

/// Stage built from a closure; see [`middleware_fn`].
pub struct MiddlewareFn<F> {
    f: F,
}

/// Wraps a closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(Env, Next, Completion) -> Reply + Send + Sync + 'static,
{
    MiddlewareFn { f }
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(Env, Next, Completion) -> Reply + Send + Sync + 'static,
{
    fn call(&self, env: Env, next: Next, done: Completion) -> Reply {
        (self.f)(env, next, done)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::sync::oneshot;

    use super::*;
    use crate::http::RequestHead;

    pub(crate) fn env(raw: &str) -> Env {
        Env::new(RequestHead::parse(raw.as_bytes()).unwrap().unwrap().0)
    }

    pub(crate) fn get(path: &str) -> Env {
        env(&format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n"))
    }

    /// Runs the chain and waits for the outcome, whichever path it takes.
    pub(crate) async fn run(chain: &Chain, env: Env) -> Outcome {
        let (tx, rx) = oneshot::channel();
        match chain.call(env, Completion::new(move |o| drop(tx.send(o)))) {
            Reply::Ready(outcome) => outcome,
            Reply::Pending => rx.await.expect("completion dropped"),
        }
    }
}
