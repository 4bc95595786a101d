//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and runs one [`Connection`] task per socket. Each
//! connection decodes pipelined HTTP/1.1 requests, services them one at a time
//! through the application's [`Chain`], and writes responses in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::middleware::Chain;

mod config;
mod connection;
mod hooks;
mod session;

pub use config::ServerConfig;
pub use connection::Connection;
pub use hooks::{DefaultHooks, RequestHooks};
pub use session::{Dispatcher, into_response};

/// Everything a connection needs to service requests: the chain, the
/// request hooks and the limits.
pub struct App {
    dispatcher: Dispatcher,
    hooks: Arc<dyn RequestHooks>,
    config: ServerConfig,
}

impl App {
    pub fn new(chain: Chain) -> Self {
        Self {
            dispatcher: Dispatcher::new(chain),
            hooks: Arc::new(DefaultHooks),
            config: ServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: impl RequestHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn hooks(&self) -> &dyn RequestHooks {
        self.hooks.as_ref()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The weft HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use weft::http::{Response, StatusCode};
/// use weft::middleware::{Chain, LoggerMiddleware, handler_fn};
/// use weft::server::{App, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let chain = Chain::builder()
///         .with_async(LoggerMiddleware)
///         .endpoint(handler_fn(|_env| async { Ok(Response::new(StatusCode::Ok).body("Hello!")) }));
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(App::new(chain)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, serving each on its own task. Accept
    /// errors are logged and the loop carries on.
    ///
    /// # Errors
    ///
    /// Does not currently return; the `Result` leaves room for graceful
    /// shutdown.
    pub async fn run(self, app: App) -> Result<(), ServerError> {
        let app = Arc::new(app);
        info!(address = %self.local_addr, "weft listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let app = Arc::clone(&app);

            tokio::spawn(async move {
                let conn = Connection::new(stream, Some(peer_addr), app);
                match conn.run().await {
                    Ok(()) => debug!(peer = %peer_addr, "connection closed"),
                    Err(e) => warn!(peer = %peer_addr, error = %e, "connection closed with error"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::http::{Response, StatusCode};
    use crate::middleware::sync_fn;

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        assert!(matches!(
            Server::bind(&addr).await,
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let chain = Chain::builder().endpoint(sync_fn(|env| {
            let peer = env.peer().map(|p| p.ip().to_string()).unwrap_or_default();
            Ok(Response::new(StatusCode::Ok).body(peer))
        }));
        tokio::spawn(server.run(App::new(chain)));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("127.0.0.1"));
    }
}
