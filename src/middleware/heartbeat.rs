use super::{Completion, Middleware, Next, Reply};
use crate::env::Env;
use crate::http::{Response, StatusCode};

/// Answers a fixed status path with `200 OK` without touching the rest of
/// the chain, for load balancer health checks.
pub struct Heartbeat {
    path: String,
}

impl Heartbeat {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Middleware for Heartbeat {
    fn call(&self, env: Env, next: Next, done: Completion) -> Reply {
        if env.path() == self.path {
            return Response::new(StatusCode::Ok).body("OK").into();
        }
        next.call(env, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::{get, run};
    use crate::middleware::{Chain, sync_fn};

    #[tokio::test]
    async fn status_path_never_reaches_the_app() {
        let chain = Chain::builder()
            .with(Heartbeat::new("/status"))
            .endpoint(sync_fn(|_| Ok(Response::new(StatusCode::NotFound))));

        let res = run(&chain, get("/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::Ok);

        let res = run(&chain, get("/other")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NotFound);
    }
}
