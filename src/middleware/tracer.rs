use std::ops::ControlFlow;

use super::{AsyncMiddleware, Outcome};
use crate::env::{Env, Trace};

/// Header carrying the request's trace marks.
pub const TRACE_HEADER: &str = "X-Trace";

/// Adds the request's [`Trace`] marks to the response as an `X-Trace` header.
///
/// Stages mark checkpoints with `env.trace().mark("name")`; the tracer adds a
/// final `total` mark on the way out.
pub struct TracerMiddleware;

impl AsyncMiddleware for TracerMiddleware {
    type State = Trace;

    fn pre_process(&self, env: &mut Env) -> ControlFlow<Outcome, Trace> {
        let trace = env.trace().clone();
        trace.mark("trace.start");
        ControlFlow::Continue(trace)
    }

    fn post_process(&self, trace: Trace, outcome: Outcome) -> Outcome {
        trace.mark("total");
        outcome.map(|mut response| {
            response.headers_mut().set(TRACE_HEADER, trace.render());
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::http::{Response, StatusCode};
    use crate::middleware::testing::{get, run};
    use crate::middleware::{Chain, handler_fn};

    #[tokio::test(start_paused = true)]
    async fn marks_from_downstream_are_reported() {
        let chain = Chain::builder()
            .with_async(TracerMiddleware)
            .endpoint(handler_fn(|env| async move {
                tokio::time::sleep(Duration::from_millis(4)).await;
                env.trace().mark("db");
                Ok(Response::new(StatusCode::Ok))
            }));

        let res = run(&chain, get("/")).await.unwrap();
        let header = res.headers().get(TRACE_HEADER).unwrap();
        assert_eq!(header, "trace.start: 0.00ms, db: 4.00ms, total: 4.00ms");
    }
}
