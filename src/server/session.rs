//! Runs the chain for one request and turns its outcome into a response.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::env::Env;
use crate::error::AppError;
use crate::http::Response;
use crate::middleware::{Chain, Completion, Outcome, Reply};

type Slot = Arc<Mutex<Option<oneshot::Sender<Outcome>>>>;

/// Invokes the chain and hands its outcome back, whether the chain answers
/// synchronously or later through its completion.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    chain: Chain,
}

impl Dispatcher {
    pub fn new(chain: Chain) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Starts servicing `env`. The receiver yields the outcome exactly once;
    /// it errors if the chain dropped its completion without answering.
    pub fn dispatch(&self, env: Env) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(tx)));

        let deferred = Arc::clone(&slot);
        let done = Completion::new(move |outcome| deliver(&deferred, outcome));

        match catch_unwind(AssertUnwindSafe(|| self.chain.call(env, done))) {
            Ok(Reply::Ready(outcome)) => deliver(&slot, outcome),
            Ok(Reply::Pending) => {}
            Err(panic) => {
                let err = AppError::from_panic(panic);
                error!(error = %err, "chain panicked");
                deliver(&slot, Err(err));
            }
        }
        rx
    }
}

fn deliver(slot: &Slot, outcome: Outcome) {
    let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match tx {
        Some(tx) => {
            if tx.send(outcome).is_err() {
                debug!("outcome arrived after the request was cancelled");
            }
        }
        None => warn!("request answered twice; ignoring the second outcome"),
    }
}

/// Formats an outcome for the wire. Internal failures are logged here and
/// answered with a generic `500`.
pub fn into_response(outcome: Outcome) -> Response {
    match outcome {
        Ok(response) => response,
        Err(err) => {
            if err.is_internal() {
                error!(error = %err, "request failed");
            } else {
                debug!(status = err.status().as_u16(), error = %err, "request rejected");
            }
            Response::from_error(&err)
        }
    }
}
