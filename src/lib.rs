//! # weft
//!
//! An async HTTP/1.1 request pipeline: pipelined keep-alive connections, a
//! continuation-passing middleware chain with pre/post hooks, barrier-based
//! "aroundware" for fanning out concurrent work, and chunked streaming
//! responses.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use weft::http::{Response, StatusCode};
//! use weft::middleware::{Chain, LoggerMiddleware, TracerMiddleware, handler_fn};
//! use weft::server::{App, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chain = Chain::builder()
//!         .with_async(LoggerMiddleware)
//!         .with_async(TracerMiddleware)
//!         .endpoint(handler_fn(|env| async move {
//!             env.trace().mark("handler");
//!             Ok(Response::new(StatusCode::Ok).body("Hello, World!"))
//!         }));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(App::new(chain)).await?;
//!     Ok(())
//! }
//! ```

pub mod aroundware;
pub mod env;
pub mod error;
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use env::Env;
pub use error::{AppError, ServerError};
pub use http::{Headers, Method, Response, StatusCode};
pub use middleware::{Chain, Outcome};
pub use server::{App, Server};
