use super::{Completion, Middleware, Next, Reply};
use crate::env::Env;
use crate::error::AppError;

/// Rejects requests missing a query parameter with a typed `400`, before
/// anything further down the chain runs.
pub struct RequiredParam {
    key: String,
    path: Option<String>,
}

impl RequiredParam {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path: None,
        }
    }

    /// Only checks requests for this exact path.
    #[must_use]
    pub fn only(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl Middleware for RequiredParam {
    fn call(&self, env: Env, next: Next, done: Completion) -> Reply {
        if self.path.as_deref().is_some_and(|path| path != env.path()) {
            return next.call(env, done);
        }
        let present = env
            .query_param(&self.key)
            .is_some_and(|value| !value.trim().is_empty());
        if !present {
            return AppError::bad_request(format!("{} identifier missing", self.key)).into();
        }
        next.call(env, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Response, StatusCode};
    use crate::middleware::testing::{get, run};
    use crate::middleware::{Chain, sync_fn};

    #[tokio::test]
    async fn missing_or_blank_param_is_rejected() {
        let chain = Chain::builder()
            .with(RequiredParam::new("id"))
            .endpoint(sync_fn(|env| {
                Ok(Response::new(StatusCode::Ok).body(env.query_param("id").unwrap_or("").to_owned()))
            }));

        let err = run(&chain, get("/u")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
        assert_eq!(err.public_message(), "id identifier missing");

        assert!(run(&chain, get("/u?id=")).await.is_err());
        assert!(run(&chain, get("/u?id=7")).await.is_ok());
    }

    #[tokio::test]
    async fn scoped_check_ignores_other_paths() {
        let chain = Chain::builder()
            .with(RequiredParam::new("id").only("/profile"))
            .endpoint(sync_fn(|_| Ok(Response::new(StatusCode::Ok))));

        assert!(run(&chain, get("/other")).await.is_ok());
        assert!(run(&chain, get("/profile")).await.is_err());
    }
}
