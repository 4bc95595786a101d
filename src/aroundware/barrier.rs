//! Fan-out / fan-in bookkeeping for one aroundware instance.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Aroundware;
use crate::error::{AppError, AroundwareError, panic_message};
use crate::http::StatusCode;
use crate::middleware::{Completion, Outcome};

/// Name of a pending operation in a [`Barrier`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(Cow<'static, str>);

impl Handle {
    /// The implicit handle standing for the downstream chain call.
    pub const DOWNSTREAM: Handle = Handle(Cow::Borrowed("downstream"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_downstream(&self) -> bool {
        *self == Self::DOWNSTREAM
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Handle {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for Handle {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Why a deferred operation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// The operation resolved with an error.
    Error(E),
    /// The operation panicked; the panic was contained at its task boundary.
    Panicked(String),
    /// The barrier's deadline passed first.
    TimedOut,
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// How a deferred operation resolved.
pub type OpResult<T, E> = Result<T, Failure<E>>;

pub(crate) enum Resolution<T, E> {
    Op(Handle, OpResult<T, E>),
    Downstream(Outcome),
}

/// Everything a barrier collected, handed to `post_process`.
#[derive(Debug)]
pub struct BarrierResults<T, E> {
    pub successes: HashMap<Handle, T>,
    pub failures: HashMap<Handle, Failure<E>>,
    pub downstream: Outcome,
}

/// Resolves a handle registered with [`Barrier::deferred`] from callback code.
///
/// Dropping it unresolved leaves the handle pending, which stalls the barrier
/// unless a deadline is set.
pub struct Resolver<T, E> {
    handle: Handle,
    tx: mpsc::UnboundedSender<Resolution<T, E>>,
}

impl<T, E> Resolver<T, E> {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(self, err: E) {
        self.resolve(Err(err));
    }

    pub fn resolve(self, result: Result<T, E>) {
        send(&self.tx, self.handle, result.map_err(Failure::Error));
    }
}

fn send<T, E>(tx: &mpsc::UnboundedSender<Resolution<T, E>>, handle: Handle, result: OpResult<T, E>) {
    if tx.send(Resolution::Op(handle.clone(), result)).is_err() {
        debug!(handle = %handle, "late resolution ignored: barrier already finished");
    }
}

/// A fan-out/fan-in synchronization point.
///
/// Operations are registered under a [`Handle`] and resolve into either
/// `successes` or `failures`. Once the downstream call has been registered
/// too, the barrier fires exactly once, when the pending set becomes empty.
///
/// All resolutions are funnelled through one channel and applied by the task
/// that owns the barrier, so bookkeeping needs no locking and tolerates any
/// resolution order.
///
/// # Examples
///
/// ```
/// use weft::aroundware::{Aroundware, Barrier, BarrierResults, Handle, OpResult};
/// use weft::middleware::Outcome;
///
/// #[derive(Default)]
/// struct Tally(u32);
///
/// #[async_trait::async_trait]
/// impl Aroundware for Tally {
///     type Value = u32;
///     type Error = String;
///
///     fn on_response(&mut self, _handle: &Handle, result: &OpResult<u32, String>) {
///         self.0 += result.as_ref().copied().unwrap_or(0);
///     }
///
///     fn post_process(self, results: BarrierResults<u32, String>) -> Outcome {
///         results.downstream
///     }
/// }
///
/// let mut tally = Tally::default();
/// let mut barrier: Barrier<u32, String> = Barrier::new();
/// let _resolver = barrier.deferred("a").unwrap();
/// assert!(barrier.is_pending(&Handle::from("a")));
///
/// assert_eq!(barrier.accept_response(&mut tally, "a".into(), Ok(7)), Ok(false));
/// assert_eq!(barrier.successes().get(&Handle::from("a")), Some(&7));
/// assert_eq!(tally.0, 7);
/// assert!(barrier.accept_response(&mut tally, "a".into(), Ok(8)).is_err());
/// ```
pub struct Barrier<T, E> {
    pending: HashSet<Handle>,
    expired: HashSet<Handle>,
    successes: HashMap<Handle, T>,
    failures: HashMap<Handle, Failure<E>>,
    downstream: Option<Outcome>,
    armed: bool,
    fired: bool,
    deadline: Option<Instant>,
    tx: mpsc::UnboundedSender<Resolution<T, E>>,
    rx: mpsc::UnboundedReceiver<Resolution<T, E>>,
}

impl<T, E> Barrier<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// A barrier that gives up on whatever is still pending at `deadline`.
    pub fn with_deadline(deadline: Option<Instant>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pending: HashSet::new(),
            expired: HashSet::new(),
            successes: HashMap::new(),
            failures: HashMap::new(),
            downstream: None,
            armed: false,
            fired: false,
            deadline,
            tx,
            rx,
        }
    }

    /// Spawns `op` on the runtime and tracks it under `handle`.
    ///
    /// An error output is recorded as [`Failure::Error`]; a panic is caught
    /// and recorded as [`Failure::Panicked`].
    pub fn enqueue<F>(&mut self, handle: impl Into<Handle>, op: F) -> Result<(), AroundwareError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = handle.into();
        self.track(&handle)?;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(op).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Failure::Error(err)),
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    warn!(handle = %handle, panic = %msg, "deferred operation panicked");
                    Err(Failure::Panicked(msg))
                }
            };
            send(&tx, handle, result);
        });
        Ok(())
    }

    /// Tracks `handle` and returns a [`Resolver`] for callback-driven code.
    pub fn deferred(&mut self, handle: impl Into<Handle>) -> Result<Resolver<T, E>, AroundwareError> {
        let handle = handle.into();
        self.track(&handle)?;
        Ok(Resolver {
            handle,
            tx: self.tx.clone(),
        })
    }

    /// Records the resolution of `handle` and passes it to `around`'s
    /// [`on_response`](Aroundware::on_response) setter.
    ///
    /// Returns `Ok(true)` if this resolution fired the barrier. A handle the
    /// deadline already gave up on keeps its [`Failure::TimedOut`]; its late
    /// resolution is dropped and `Ok(false)` returned.
    ///
    /// # Errors
    ///
    /// - [`AroundwareError::AlreadyFired`] after the barrier fired;
    /// - [`AroundwareError::ReservedHandle`] for [`Handle::DOWNSTREAM`]
    ///   (use [`accept_downstream`](Self::accept_downstream));
    /// - [`AroundwareError::UnknownHandle`] if `handle` is not pending,
    ///   including a second resolution of the same handle.
    pub fn accept_response<A>(
        &mut self,
        around: &mut A,
        handle: Handle,
        result: OpResult<T, E>,
    ) -> Result<bool, AroundwareError>
    where
        A: Aroundware<Value = T, Error = E>,
    {
        if !self.settle(&handle)? {
            return Ok(false);
        }
        around.on_response(&handle, &result);
        self.record(handle, result);
        self.check_complete()
    }

    /// Records the outcome of the downstream call.
    pub fn accept_downstream(&mut self, outcome: Outcome) -> Result<bool, AroundwareError> {
        if self.fired {
            return Err(AroundwareError::AlreadyFired);
        }
        if !self.pending.remove(&Handle::DOWNSTREAM) {
            return Err(AroundwareError::UnknownHandle(Handle::DOWNSTREAM));
        }
        self.downstream = Some(outcome);
        self.check_complete()
    }

    /// Waits until every operation enqueued so far has resolved, invoking
    /// `around`'s setter for each. Used from `pre_process` to gate the
    /// downstream call on those results.
    pub async fn perform<A>(&mut self, around: &mut A) -> Result<(), AroundwareError>
    where
        A: Aroundware<Value = T, Error = E>,
    {
        while !self.pending.is_empty() {
            self.step(around).await?;
        }
        Ok(())
    }

    pub fn is_pending(&self, handle: &Handle) -> bool {
        self.pending.contains(handle)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn successes(&self) -> &HashMap<Handle, T> {
        &self.successes
    }

    pub fn failures(&self) -> &HashMap<Handle, Failure<E>> {
        &self.failures
    }

    /// The downstream outcome, once it has arrived.
    pub fn downstream(&self) -> Option<&Outcome> {
        self.downstream.as_ref()
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }

    /// Registers the implicit downstream handle; from now on an empty pending
    /// set fires the barrier.
    pub(crate) fn arm(&mut self) -> Result<(), AroundwareError> {
        if self.fired {
            return Err(AroundwareError::AlreadyFired);
        }
        if !self.pending.insert(Handle::DOWNSTREAM) {
            return Err(AroundwareError::DuplicateHandle(Handle::DOWNSTREAM));
        }
        self.armed = true;
        Ok(())
    }

    /// Continuation for the downstream call, delivering into this barrier.
    pub(crate) fn downstream_completion(&self) -> Completion {
        let tx = self.tx.clone();
        Completion::new(move |outcome| {
            if tx.send(Resolution::Downstream(outcome)).is_err() {
                debug!("late downstream resolution ignored: barrier already finished");
            }
        })
    }

    /// Applies resolutions until the barrier fires.
    pub(crate) async fn wait<A>(&mut self, around: &mut A) -> Result<(), AroundwareError>
    where
        A: Aroundware<Value = T, Error = E>,
    {
        while !self.fired {
            self.step(around).await?;
        }
        Ok(())
    }

    pub(crate) fn into_results(self) -> BarrierResults<T, E> {
        BarrierResults {
            successes: self.successes,
            failures: self.failures,
            downstream: self.downstream.unwrap_or(Err(AppError::Dropped)),
        }
    }

    async fn step<A>(&mut self, around: &mut A) -> Result<(), AroundwareError>
    where
        A: Aroundware<Value = T, Error = E>,
    {
        let next = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    self.expire();
                    return Ok(());
                }
            },
            None => self.rx.recv().await,
        };

        // The barrier holds a sender itself, so the channel never closes.
        let Some(resolution) = next else {
            return Ok(());
        };

        match resolution {
            Resolution::Op(handle, result) => {
                self.accept_response(around, handle, result)?;
            }
            Resolution::Downstream(outcome) => {
                self.accept_downstream(outcome)?;
            }
        }
        Ok(())
    }

    fn track(&mut self, handle: &Handle) -> Result<(), AroundwareError> {
        if self.fired {
            return Err(AroundwareError::AlreadyFired);
        }
        if handle.is_downstream() {
            return Err(AroundwareError::ReservedHandle(handle.clone()));
        }
        if self.successes.contains_key(handle)
            || self.failures.contains_key(handle)
            || !self.pending.insert(handle.clone())
        {
            return Err(AroundwareError::DuplicateHandle(handle.clone()));
        }
        Ok(())
    }

    /// Removes `handle` from the pending set. `Ok(false)` means it already
    /// timed out and the resolution should be dropped.
    fn settle(&mut self, handle: &Handle) -> Result<bool, AroundwareError> {
        if self.fired {
            return Err(AroundwareError::AlreadyFired);
        }
        if handle.is_downstream() {
            return Err(AroundwareError::ReservedHandle(handle.clone()));
        }
        if self.expired.contains(handle) {
            debug!(handle = %handle, "late resolution ignored: handle already timed out");
            return Ok(false);
        }
        if !self.pending.remove(handle) {
            return Err(AroundwareError::UnknownHandle(handle.clone()));
        }
        Ok(true)
    }

    fn record(&mut self, handle: Handle, result: OpResult<T, E>) {
        match result {
            Ok(value) => {
                self.successes.insert(handle, value);
            }
            Err(failure) => {
                self.failures.insert(handle, failure);
            }
        }
    }

    fn check_complete(&mut self) -> Result<bool, AroundwareError> {
        if !self.armed || !self.pending.is_empty() {
            return Ok(false);
        }
        if self.fired {
            return Err(AroundwareError::DoubleCompletion);
        }
        self.fired = true;
        Ok(true)
    }

    fn expire(&mut self) {
        warn!(pending = self.pending.len(), "barrier deadline passed; giving up on pending operations");
        for handle in std::mem::take(&mut self.pending) {
            if handle.is_downstream() {
                self.downstream = Some(Err(AppError::new(
                    StatusCode::GatewayTimeout,
                    "downstream timed out",
                )));
            } else {
                self.failures.insert(handle.clone(), Failure::TimedOut);
                self.expired.insert(handle);
            }
        }
        if self.armed {
            self.fired = true;
        }
    }
}

impl<T, E> Default for Barrier<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Barrier<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("pending", &self.pending)
            .field("expired", &self.expired)
            .field("successes", &self.successes.len())
            .field("failures", &self.failures.len())
            .field("armed", &self.armed)
            .field("fired", &self.fired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::http::Response;

    type TestBarrier = Barrier<u32, String>;

    /// Remembers which handles reached its setter.
    #[derive(Default)]
    struct Seen(Vec<Handle>);

    #[async_trait]
    impl Aroundware for Seen {
        type Value = u32;
        type Error = String;

        fn on_response(&mut self, handle: &Handle, _result: &OpResult<u32, String>) {
            self.0.push(handle.clone());
        }

        fn post_process(self, results: BarrierResults<u32, String>) -> Outcome {
            results.downstream
        }
    }

    fn permutations(items: &[Handle]) -> Vec<Vec<Handle>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn fires_once_after_last_of_every_resolution_order() {
        let handles = [
            Handle::from("a"),
            Handle::from("b"),
            Handle::from("c"),
            Handle::DOWNSTREAM,
        ];
        let orders = permutations(&handles);
        assert_eq!(orders.len(), 24);

        for order in orders {
            let mut seen = Seen::default();
            let mut barrier = TestBarrier::new();
            let _resolvers: Vec<_> = ["a", "b", "c"]
                .into_iter()
                .map(|h| barrier.deferred(h).unwrap())
                .collect();
            barrier.arm().unwrap();

            let mut fired_at = Vec::new();
            for (i, handle) in order.iter().enumerate() {
                let fired = if handle.is_downstream() {
                    barrier
                        .accept_downstream(Ok(Response::new(StatusCode::Ok)))
                        .unwrap()
                } else if handle.as_str() == "b" {
                    barrier
                        .accept_response(&mut seen, handle.clone(), Err(Failure::Error("bad".into())))
                        .unwrap()
                } else {
                    barrier
                        .accept_response(&mut seen, handle.clone(), Ok(i as u32))
                        .unwrap()
                };
                if fired {
                    fired_at.push(i);
                }
            }

            assert_eq!(fired_at, [3], "order {order:?}");
            assert_eq!(seen.0.len(), 3);
            assert!(barrier.is_fired());
            assert_eq!(barrier.successes().len(), 2);
            assert_eq!(barrier.failures().len(), 1);
            assert!(barrier.downstream().is_some());
        }
    }

    #[test]
    fn second_resolution_of_a_handle_is_an_error() {
        let mut barrier = TestBarrier::new();
        let _a = barrier.deferred("a").unwrap();
        let _b = barrier.deferred("b").unwrap();
        barrier.arm().unwrap();
        let mut seen = Seen::default();

        assert_eq!(barrier.accept_response(&mut seen, "a".into(), Ok(1)), Ok(false));
        assert_eq!(
            barrier.accept_response(&mut seen, "a".into(), Ok(2)),
            Err(AroundwareError::UnknownHandle("a".into()))
        );
        assert_eq!(barrier.successes()[&Handle::from("a")], 1);
        assert_eq!(seen.0, [Handle::from("a")]);
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let mut barrier = TestBarrier::new();
        assert_eq!(
            barrier.accept_response(&mut Seen::default(), "ghost".into(), Ok(1)),
            Err(AroundwareError::UnknownHandle("ghost".into()))
        );
    }

    #[test]
    fn resolution_after_firing_is_rejected() {
        let mut barrier = TestBarrier::new();
        barrier.arm().unwrap();
        assert_eq!(barrier.accept_downstream(Ok(Response::new(StatusCode::Ok))), Ok(true));
        assert_eq!(
            barrier.accept_downstream(Ok(Response::new(StatusCode::Ok))),
            Err(AroundwareError::AlreadyFired)
        );
        assert_eq!(
            barrier.accept_response(&mut Seen::default(), "a".into(), Ok(1)),
            Err(AroundwareError::AlreadyFired)
        );
        assert!(matches!(barrier.deferred("late"), Err(AroundwareError::AlreadyFired)));
    }

    #[test]
    fn handle_registration_rules() {
        let mut barrier = TestBarrier::new();
        let mut seen = Seen::default();
        let _a = barrier.deferred("a").unwrap();
        assert!(matches!(
            barrier.deferred("a"),
            Err(AroundwareError::DuplicateHandle(_))
        ));
        assert!(matches!(
            barrier.deferred(Handle::DOWNSTREAM),
            Err(AroundwareError::ReservedHandle(_))
        ));
        assert_eq!(
            barrier.accept_response(&mut seen, Handle::DOWNSTREAM, Ok(1)),
            Err(AroundwareError::ReservedHandle(Handle::DOWNSTREAM))
        );
        barrier.accept_response(&mut seen, "a".into(), Ok(1)).unwrap();
        assert!(matches!(
            barrier.deferred("a"),
            Err(AroundwareError::DuplicateHandle(_))
        ));
    }

    #[test]
    fn pending_set_empty_before_arming_does_not_fire() {
        let mut barrier = TestBarrier::new();
        let _a = barrier.deferred("a").unwrap();
        assert_eq!(
            barrier.accept_response(&mut Seen::default(), "a".into(), Ok(1)),
            Ok(false)
        );
        assert!(!barrier.is_fired());
    }

    #[test]
    fn resolution_of_an_expired_handle_is_dropped() {
        let mut barrier = TestBarrier::new();
        let mut seen = Seen::default();
        let _slow = barrier.deferred("slow").unwrap();
        barrier.expire();
        assert_eq!(barrier.pending_len(), 0);
        assert!(!barrier.is_fired());

        assert_eq!(barrier.accept_response(&mut seen, "slow".into(), Ok(9)), Ok(false));
        assert_eq!(barrier.failures()[&Handle::from("slow")], Failure::TimedOut);
        assert!(barrier.successes().is_empty());
        assert!(seen.0.is_empty());

        assert_eq!(
            barrier.accept_response(&mut seen, "ghost".into(), Ok(1)),
            Err(AroundwareError::UnknownHandle("ghost".into()))
        );
        assert!(matches!(
            barrier.deferred("slow"),
            Err(AroundwareError::DuplicateHandle(_))
        ));
    }
}
