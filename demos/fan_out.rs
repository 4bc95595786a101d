//! Fan-out demo server.
//!
//! ```text
//! RUST_LOG=debug cargo run --example fan_out
//! curl -i localhost:8080/profile?id=7
//! curl -i localhost:8080/ticker
//! curl -i localhost:8080/status
//! ```

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use weft::aroundware::{Aroundware, AroundwareStage, Barrier, BarrierResults, Handle, OpResult};
use weft::http::{Response, StatusCode};
use weft::middleware::{Heartbeat, LoggerMiddleware, RequiredParam, TracerMiddleware, handler_fn};
use weft::{App, AppError, Chain, Env, Outcome, Server};

/// Looks up an account and its recent activity concurrently with the handler.
struct Profile {
    id: String,
}

#[async_trait]
impl Aroundware for Profile {
    type Value = String;
    type Error = String;

    async fn pre_process(
        &mut self,
        env: &mut Env,
        barrier: &mut Barrier<String, String>,
    ) -> Result<ControlFlow<Response>, AppError> {
        if !env.path().starts_with("/profile") {
            return Ok(ControlFlow::Continue(()));
        }
        let id = self.id.clone();
        barrier.enqueue("account", async move {
            sleep(Duration::from_millis(40)).await;
            Ok(format!("account-{id}"))
        })?;
        barrier.enqueue("activity", async {
            sleep(Duration::from_millis(15)).await;
            Err("activity service unavailable".to_owned())
        })?;
        Ok(ControlFlow::Continue(()))
    }

    fn on_response(&mut self, handle: &Handle, result: &OpResult<String, String>) {
        tracing::debug!(handle = %handle, ok = result.is_ok(), "lookup finished");
    }

    fn post_process(self, results: BarrierResults<String, String>) -> Outcome {
        let mut response = results.downstream?;
        if let Some(account) = results.successes.get(&Handle::from("account")) {
            response.add_header("X-Account", account.as_str());
        }
        for (handle, failure) in &results.failures {
            response.add_header("X-Degraded", format!("{handle}: {failure}"));
        }
        Ok(response)
    }
}

async fn endpoint(env: Env) -> Outcome {
    match env.path() {
        "/ticker" => {
            let stream = env.stream().clone();
            tokio::spawn(async move {
                for tick in 1..=5 {
                    sleep(Duration::from_millis(200)).await;
                    if stream.send_chunk(format!("tick {tick}\n")).is_err() {
                        return;
                    }
                }
                let _ = stream.close_chunked();
            });
            Ok(Response::chunked(StatusCode::Ok).header("Content-Type", "text/plain"))
        }
        "/profile" => {
            env.trace().mark("handler");
            sleep(Duration::from_millis(5)).await;
            Response::new(StatusCode::Ok)
                .json(&serde_json::json!({ "id": env.query_param("id") }))
                .map_err(AppError::internal)
        }
        _ => Err(AppError::new(StatusCode::NotFound, "no such resource")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let chain = Chain::builder()
        .with(Heartbeat::new("/status"))
        .with_async(LoggerMiddleware)
        .with_async(TracerMiddleware)
        .with(
            AroundwareStage::new(|env: &Env| Profile {
                id: env.query_param("id").unwrap_or_default().to_owned(),
            })
            .timeout(Duration::from_secs(2)),
        )
        .with(RequiredParam::new("id").only("/profile"))
        .endpoint(handler_fn(endpoint));

    let server = Server::bind("127.0.0.1:8080").await?;
    tracing::info!(address = %server.local_addr(), "demo ready");
    server.run(App::new(chain)).await?;
    Ok(())
}
