//! Aroundware: middleware that fans out concurrent work around the
//! downstream call and rejoins it before the response is finalized.
//!
//! An [`AroundwareFactory`] builds one [`Aroundware`] instance per request.
//! The instance gets a fresh [`Barrier`]; in `pre_process` it may
//! [`enqueue`](Barrier::enqueue) deferred operations and optionally
//! [`perform`](Barrier::perform) them before the request continues. The
//! downstream call is tracked as the implicit [`Handle::DOWNSTREAM`]. Once
//! every handle resolved, `post_process` builds the final outcome.
//!
//! # Examples
//!
//! ```rust
//! use std::ops::ControlFlow;
//! use async_trait::async_trait;
//! use weft::aroundware::{Aroundware, AroundwareStage, Barrier, BarrierResults, Handle};
//! use weft::env::Env;
//! use weft::error::AppError;
//! use weft::http::{Response, StatusCode};
//! use weft::middleware::{Chain, Outcome, sync_fn};
//!
//! struct Quota;
//!
//! #[async_trait]
//! impl Aroundware for Quota {
//!     type Value = u32;
//!     type Error = String;
//!
//!     async fn pre_process(
//!         &mut self,
//!         _env: &mut Env,
//!         barrier: &mut Barrier<u32, String>,
//!     ) -> Result<ControlFlow<Response>, AppError> {
//!         barrier.enqueue("quota", async { Ok::<_, String>(42) })?;
//!         Ok(ControlFlow::Continue(()))
//!     }
//!
//!     fn post_process(self, results: BarrierResults<u32, String>) -> Outcome {
//!         let left = results.successes.get(&Handle::from("quota")).copied().unwrap_or(0);
//!         results
//!             .downstream
//!             .map(|res| res.header("X-Quota", left.to_string()))
//!     }
//! }
//!
//! let chain = Chain::builder()
//!     .with(AroundwareStage::new(|_env: &Env| Quota))
//!     .endpoint(sync_fn(|_| Ok(Response::new(StatusCode::Ok))));
//! ```

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::error;

use crate::env::Env;
use crate::error::{AppError, AroundwareError};
use crate::http::Response;
use crate::middleware::{Completion, Middleware, Next, Outcome, Reply};

mod barrier;

pub use barrier::{Barrier, BarrierResults, Failure, Handle, OpResult, Resolver};

/// Per-request fan-out/fan-in middleware.
///
/// `Value` and `Error` are the success and error types of the deferred
/// operations this aroundware enqueues.
#[async_trait]
pub trait Aroundware: Send + Sized + 'static {
    type Value: Send + 'static;
    type Error: Send + 'static;

    /// Runs before the downstream call. Returning `Break` answers with that
    /// response and skips downstream; returning `Err` answers with the error.
    /// In both cases the barrier is abandoned.
    async fn pre_process(
        &mut self,
        _env: &mut Env,
        _barrier: &mut Barrier<Self::Value, Self::Error>,
    ) -> Result<ControlFlow<Response>, AppError> {
        Ok(ControlFlow::Continue(()))
    }

    /// Called once per resolved handle, as it resolves.
    fn on_response(&mut self, _handle: &Handle, _result: &OpResult<Self::Value, Self::Error>) {}

    /// Builds the final outcome once every handle, downstream included, resolved.
    fn post_process(self, results: BarrierResults<Self::Value, Self::Error>) -> Outcome;
}

/// Creates one [`Aroundware`] instance per request.
pub trait AroundwareFactory: Send + Sync + 'static {
    type Aroundware: Aroundware;

    fn create(&self, env: &Env) -> Self::Aroundware;
}

impl<F, A> AroundwareFactory for F
where
    F: Fn(&Env) -> A + Send + Sync + 'static,
    A: Aroundware,
{
    type Aroundware = A;

    fn create(&self, env: &Env) -> A {
        self(env)
    }
}

/// Mounts an [`AroundwareFactory`] in a [`Chain`](crate::middleware::Chain).
///
/// Each request is driven on its own task, so the stage always answers
/// [`Reply::Pending`].
pub struct AroundwareStage<F> {
    factory: Arc<F>,
    timeout: Option<Duration>,
}

impl<F: AroundwareFactory> AroundwareStage<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            timeout: None,
        }
    }

    /// Gives up on still-pending handles this long after the instance was
    /// created. Timed-out operations are recorded as [`Failure::TimedOut`]; a
    /// timed-out downstream becomes a `504`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<F: AroundwareFactory> Middleware for AroundwareStage<F> {
    fn call(&self, env: Env, next: Next, done: Completion) -> Reply {
        let around = self.factory.create(&env);
        let deadline = self.timeout.map(|t| Instant::now() + t);

        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(drive(around, env, next, deadline))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    error!(error = %err, "aroundware invariant violated");
                    Err(err.into())
                }
                Err(panic) => Err(AppError::from_panic(panic)),
            };
            done.complete(outcome);
        });

        Reply::Pending
    }
}

async fn drive<A: Aroundware>(
    mut around: A,
    mut env: Env,
    next: Next,
    deadline: Option<Instant>,
) -> Result<Outcome, AroundwareError> {
    let mut barrier = Barrier::with_deadline(deadline);

    match around.pre_process(&mut env, &mut barrier).await {
        Ok(ControlFlow::Continue(())) => {}
        Ok(ControlFlow::Break(response)) => return Ok(Ok(response)),
        Err(err) => {
            if let AppError::Aroundware(violation) = &err {
                error!(error = %violation, "aroundware invariant violated in pre_process");
            }
            return Ok(Err(err));
        }
    }

    barrier.arm()?;
    if let Reply::Ready(outcome) = next.call(env, barrier.downstream_completion()) {
        barrier.accept_downstream(outcome)?;
    }
    barrier.wait(&mut around).await?;

    Ok(around.post_process(barrier.into_results()))
}
