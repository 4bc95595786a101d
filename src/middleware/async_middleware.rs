use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

use super::{Completion, Middleware, Next, Outcome, Reply};
use crate::env::Env;

/// Middleware with code before and after the downstream call, whether the
/// downstream answers synchronously or later through its continuation.
///
/// `pre_process` runs on the way in and produces per-request
/// [`State`](Self::State); returning [`ControlFlow::Break`] answers
/// immediately and skips downstream. `post_process` runs exactly once with
/// that state and the downstream outcome. Across a chain, post-processing runs
/// in reverse declaration order.
///
/// # Examples
///
/// ```rust
/// use std::ops::ControlFlow;
/// use weft::env::Env;
/// use weft::middleware::{AsyncMiddleware, Outcome};
///
/// struct Server(&'static str);
///
/// impl AsyncMiddleware for Server {
///     type State = ();
///
///     fn pre_process(&self, _env: &mut Env) -> ControlFlow<Outcome, ()> {
///         ControlFlow::Continue(())
///     }
///
///     fn post_process(&self, _state: (), outcome: Outcome) -> Outcome {
///         outcome.map(|res| res.header("Server", self.0))
///     }
/// }
/// ```
pub trait AsyncMiddleware: Send + Sync + 'static {
    type State: Send + 'static;

    fn pre_process(&self, env: &mut Env) -> ControlFlow<Outcome, Self::State>;

    fn post_process(&self, state: Self::State, outcome: Outcome) -> Outcome;
}

/// Adapts an [`AsyncMiddleware`] into a chain [`Middleware`].
pub struct AsyncStage<M> {
    inner: Arc<M>,
}

impl<M: AsyncMiddleware> AsyncStage<M> {
    pub fn new(middleware: M) -> Self {
        Self {
            inner: Arc::new(middleware),
        }
    }
}

impl<M: AsyncMiddleware> Middleware for AsyncStage<M> {
    fn call(&self, mut env: Env, next: Next, done: Completion) -> Reply {
        let state = match self.inner.pre_process(&mut env) {
            ControlFlow::Continue(state) => state,
            ControlFlow::Break(outcome) => return Reply::Ready(outcome),
        };

        // Whichever path takes the state first runs post-processing.
        let slot = Arc::new(Mutex::new(Some(state)));

        let deferred_slot = Arc::clone(&slot);
        let middleware = Arc::clone(&self.inner);
        let wrapped = done.map(move |outcome| match take(&deferred_slot) {
            Some(state) => middleware.post_process(state, outcome),
            None => {
                error!("downstream completed after answering synchronously; skipping post-processing");
                outcome
            }
        });

        match next.call(env, wrapped) {
            Reply::Ready(outcome) => match take(&slot) {
                Some(state) => Reply::Ready(self.inner.post_process(state, outcome)),
                None => {
                    error!("downstream answered synchronously after completing; skipping post-processing");
                    Reply::Ready(outcome)
                }
            },
            Reply::Pending => Reply::Pending,
        }
    }
}

fn take<S>(slot: &Mutex<Option<S>>) -> Option<S> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::AppError;
    use crate::http::{Response, StatusCode};
    use crate::middleware::testing::{get, run};
    use crate::middleware::{Chain, handler_fn, middleware_fn, sync_fn};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        posts: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> (Self, Arc<AtomicUsize>) {
            let posts = Arc::new(AtomicUsize::new(0));
            let recorder = Self {
                name,
                log: Arc::clone(log),
                posts: Arc::clone(&posts),
            };
            (recorder, posts)
        }
    }

    impl AsyncMiddleware for Recorder {
        type State = String;

        fn pre_process(&self, env: &mut Env) -> ControlFlow<Outcome, String> {
            self.log.lock().unwrap().push(format!("pre {}", self.name));
            if env.query_param("deny") == Some(self.name) {
                return ControlFlow::Break(Err(AppError::bad_request("denied")));
            }
            ControlFlow::Continue(env.path().to_owned())
        }

        fn post_process(&self, path: String, outcome: Outcome) -> Outcome {
            self.posts.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("post {} {path}", self.name));
            outcome.map(|res| res.header("X-Seen", self.name))
        }
    }

    fn onion(log: &Log, endpoint: impl crate::middleware::Endpoint) -> (Chain, Arc<AtomicUsize>) {
        let (outer, outer_posts) = Recorder::new("outer", log);
        let (inner, _) = Recorder::new("inner", log);
        let chain = Chain::builder()
            .with_async(outer)
            .with_async(inner)
            .endpoint(endpoint);
        (chain, outer_posts)
    }

    #[tokio::test]
    async fn post_runs_once_for_synchronous_downstream() {
        let log = Log::default();
        let (chain, posts) = onion(&log, sync_fn(|_| Ok(Response::new(StatusCode::Ok))));
        let res = run(&chain, get("/a")).await.unwrap();

        assert_eq!(posts.load(Ordering::SeqCst), 1);
        assert_eq!(
            *log.lock().unwrap(),
            ["pre outer", "pre inner", "post inner /a", "post outer /a"]
        );
        let seen: Vec<_> = res.headers().get_all("x-seen").collect();
        assert_eq!(seen, ["inner", "outer"]);
    }

    #[tokio::test]
    async fn post_runs_once_for_deferred_downstream() {
        let log = Log::default();
        let (chain, posts) = onion(
            &log,
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(Response::new(StatusCode::Ok))
            }),
        );
        run(&chain, get("/b")).await.unwrap();

        assert_eq!(posts.load(Ordering::SeqCst), 1);
        assert_eq!(
            *log.lock().unwrap(),
            ["pre outer", "pre inner", "post inner /b", "post outer /b"]
        );
    }

    #[tokio::test]
    async fn hook_order_is_deterministic_across_runs() {
        let log = Log::default();
        let (chain, posts) = onion(&log, sync_fn(|_| Ok(Response::new(StatusCode::Ok))));
        let mut runs = Vec::new();
        for _ in 0..5 {
            log.lock().unwrap().clear();
            run(&chain, get("/d")).await.unwrap();
            runs.push(log.lock().unwrap().clone());
        }
        assert!(runs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(posts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn short_circuit_in_pre_skips_downstream_and_own_post() {
        let log = Log::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let (chain, outer_posts) = onion(
            &log,
            sync_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Response::new(StatusCode::Ok))
            }),
        );
        let err = run(&chain, get("/x?deny=inner")).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::BadRequest);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(outer_posts.load(Ordering::SeqCst), 1);
        assert_eq!(
            *log.lock().unwrap(),
            ["pre outer", "pre inner", "post outer /x"]
        );
    }

    #[tokio::test]
    async fn misbehaving_downstream_cannot_trigger_post_twice() {
        let log = Log::default();
        let (recorder, posts) = Recorder::new("only", &log);
        // Answers synchronously *and* fires its continuation.
        let chain = Chain::builder()
            .with_async(recorder)
            .with(middleware_fn(|_env, _next, done| {
                done.complete(Ok(Response::new(StatusCode::Ok)));
                Reply::Ready(Ok(Response::new(StatusCode::Ok)))
            }))
            .endpoint(sync_fn(|_| Ok(Response::new(StatusCode::Ok))));

        let (tx, _rx) = tokio::sync::oneshot::channel();
        let reply = chain.call(get("/"), Completion::new(move |o| drop(tx.send(o))));
        assert!(!reply.is_pending());
        assert_eq!(posts.load(Ordering::SeqCst), 1);
    }
}
