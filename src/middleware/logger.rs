use std::ops::ControlFlow;

use tokio::time::Instant;

use super::{AsyncMiddleware, Outcome};
use crate::env::Env;

/// Logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line once the downstream outcome is known,
/// in the format:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
///
/// Errors are logged with the status they will be answered with.
pub struct LoggerMiddleware;

/// What the logger remembers between its two hooks.
pub struct RequestLine {
    method: String,
    path: String,
    start: Instant,
}

impl AsyncMiddleware for LoggerMiddleware {
    type State = RequestLine;

    fn pre_process(&self, env: &mut Env) -> ControlFlow<Outcome, RequestLine> {
        ControlFlow::Continue(RequestLine {
            method: env.method().as_str().to_owned(),
            path: env.path().to_owned(),
            start: Instant::now(),
        })
    }

    fn post_process(&self, line: RequestLine, outcome: Outcome) -> Outcome {
        let duration = line.start.elapsed();
        let status = match &outcome {
            Ok(response) => response.status(),
            Err(err) => err.status(),
        };

        tracing::info!(
            "{} {} - {} ({:?})",
            line.method,
            line.path,
            status.as_u16(),
            duration
        );

        outcome
    }
}
