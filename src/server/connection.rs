//! One client connection: decoding, pipelining, and ordered response writes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::App;
use super::hooks::guarded;
use super::session::into_response;
use crate::env::StreamFrame;
use crate::error::{AppError, ServerError};
use crate::http::request::Service;
use crate::http::{Method, ParseEvent, Request, RequestDecoder};
use crate::middleware::Outcome;

enum Phase {
    /// Waiting on the chain.
    Waiting(oneshot::Receiver<Outcome>),
    /// Head written; body frames come from the request's stream handle.
    Streaming(mpsc::UnboundedReceiver<StreamFrame>),
}

/// The request being serviced.
struct InFlight {
    request: Request,
    phase: Phase,
    keep_alive: bool,
}

enum Event {
    Resolved(Outcome),
    Frame(Option<StreamFrame>),
}

/// Drives one HTTP/1.1 connection until it closes.
///
/// Requests are decoded as bytes arrive and queued in arrival order. One
/// request at a time is serviced; the next is promoted once the current
/// response has been written in full, so responses leave in request order
/// however long each takes.
pub struct Connection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buf: BytesMut,
    peer: Option<SocketAddr>,
    app: Arc<App>,
    decoder: RequestDecoder,
    parsing: Option<Request>,
    queue: VecDeque<Request>,
    current: Option<InFlight>,
    next_seq: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: S, peer: Option<SocketAddr>, app: Arc<App>) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let config = app.config();
        Self {
            reader,
            writer,
            buf: BytesMut::with_capacity(config.read_buffer_capacity),
            peer,
            decoder: RequestDecoder::new(config.max_head_bytes, config.max_body_bytes),
            app,
            parsing: None,
            queue: VecDeque::new(),
            current: None,
            next_seq: 0,
        }
    }

    /// Serves requests until the peer disconnects or a response closes the
    /// connection.
    ///
    /// # Errors
    ///
    /// [`ServerError::Protocol`] when the peer sent malformed bytes (nothing
    /// is written back), [`ServerError::Io`] when the socket fails. Every live
    /// request is cancelled before returning.
    pub async fn run(mut self) -> Result<(), ServerError> {
        loop {
            if let Err(err) = self.receive() {
                warn!(peer = ?self.peer, error = %err, "aborting connection");
                self.cancel_all();
                return Err(err);
            }

            if self.current.is_none() {
                if let Some(request) = self.queue.pop_front() {
                    self.start(request)?;
                }
            }

            let can_read =
                self.current.is_none() || self.queue.len() < self.app.config().max_queued_requests;
            let serving = self.current.is_some();

            tokio::select! {
                read = self.reader.read_buf(&mut self.buf), if can_read => match read {
                    Ok(0) => {
                        debug!(peer = ?self.peer, "connection closed by peer");
                        self.cancel_all();
                        return Ok(());
                    }
                    Ok(n) => trace!(peer = ?self.peer, bytes = n, "read"),
                    Err(e) => {
                        self.cancel_all();
                        return Err(e.into());
                    }
                },
                event = next_event(&mut self.current), if serving => {
                    if !self.handle(event).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decodes whatever is buffered into requests.
    fn receive(&mut self) -> Result<(), ServerError> {
        while self.queue.len() < self.app.config().max_queued_requests.max(1) {
            let Some(event) = self.decoder.decode(&mut self.buf)? else {
                break;
            };
            match event {
                ParseEvent::Head(head) => {
                    let mut request = Request::new(self.next_seq, head, self.peer);
                    self.next_seq += 1;
                    debug!(
                        peer = ?self.peer,
                        seq = request.seq(),
                        method = %request.head().method(),
                        path = %request.head().path(),
                        "request received"
                    );
                    let hooks = self.app.hooks();
                    if let Some(env) = request.env_mut() {
                        if let Err(err) = guarded(|| hooks.on_headers(env)) {
                            request.fail(err);
                        }
                    }
                    self.parsing = Some(request);
                }
                ParseEvent::Body(chunk) => {
                    if let Some(request) = self.parsing.as_mut() {
                        body_chunk(self.app.as_ref(), request, &chunk);
                    }
                }
                ParseEvent::Complete => {
                    if let Some(mut request) = self.parsing.take() {
                        request.complete()?;
                        self.queue.push_back(request);
                    }
                }
            }
        }
        Ok(())
    }

    fn start(&mut self, mut request: Request) -> Result<(), ServerError> {
        let rx = match request.begin_service()? {
            Service::Dispatch(env) => self.app.dispatcher().dispatch(env),
            Service::Reject(err) => {
                let (tx, rx) = oneshot::channel();
                // The receiver is alive, so this cannot fail.
                let _ = tx.send(Err(err));
                rx
            }
        };
        self.current = Some(InFlight {
            request,
            phase: Phase::Waiting(rx),
            keep_alive: true,
        });
        Ok(())
    }

    /// Returns `false` once the connection is done.
    async fn handle(&mut self, event: Event) -> Result<bool, ServerError> {
        match event {
            Event::Resolved(outcome) => self.respond(outcome).await,
            Event::Frame(Some(StreamFrame::Data(bytes))) => {
                self.write(&bytes).await?;
                Ok(true)
            }
            Event::Frame(Some(StreamFrame::Close)) => self.finish().await,
            Event::Frame(None) => {
                warn!(peer = ?self.peer, "stream handle dropped without closing; closing connection");
                if let Some(flight) = self.current.as_mut() {
                    flight.keep_alive = false;
                }
                self.finish().await
            }
        }
    }

    async fn respond(&mut self, outcome: Outcome) -> Result<bool, ServerError> {
        let mut response = into_response(outcome);
        let Some(flight) = self.current.as_mut() else {
            return Ok(true);
        };

        // A HEAD response carries no body, so it never needs its own stream.
        let head_only = *flight.request.head().method() == Method::Head;
        let keep_alive = self.app.config().keep_alive
            && flight.request.head().is_keep_alive()
            && response.is_keep_alive()
            && (head_only || !response.is_close_delimited());
        response.set_keep_alive(keep_alive);
        flight.keep_alive = keep_alive;

        let mut streaming = response.is_streaming() && !head_only;
        if streaming {
            match flight.request.take_frames() {
                Some(frames) => flight.phase = Phase::Streaming(frames),
                None => {
                    flight.keep_alive = false;
                    streaming = false;
                }
            }
        }

        debug!(
            peer = ?self.peer,
            seq = flight.request.seq(),
            status = response.status().as_u16(),
            streaming,
            "writing response"
        );
        let bytes = if head_only {
            response.into_head_bytes()
        } else {
            response.into_bytes()
        };
        self.write(&bytes).await?;

        if streaming {
            Ok(true)
        } else {
            self.finish().await
        }
    }

    /// Completes the current response and decides whether to go on.
    async fn finish(&mut self) -> Result<bool, ServerError> {
        let Some(mut flight) = self.current.take() else {
            return Ok(true);
        };
        flight.request.responded()?;
        trace!(peer = ?self.peer, seq = flight.request.seq(), "response complete");

        if flight.keep_alive {
            return Ok(true);
        }

        debug!(peer = ?self.peer, "closing connection after response");
        self.cancel_all();
        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = ?self.peer, error = %e, "shutdown failed");
        }
        Ok(false)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        let written = async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(peer = ?self.peer, error = %e, "write failed");
            self.cancel_all();
            return Err(e.into());
        }
        Ok(())
    }

    /// Cancels the current, queued and partially read requests.
    fn cancel_all(&mut self) {
        let current = self.current.take().map(|flight| flight.request);
        let queued = std::mem::take(&mut self.queue);
        let parsing = self.parsing.take();

        let hooks = self.app.hooks();
        for request in current.into_iter().chain(queued).chain(parsing) {
            hooks.on_close(request.head());
            request.cancel();
        }
    }
}

fn body_chunk(app: &App, request: &mut Request, chunk: &Bytes) {
    if request.is_failed() {
        return;
    }
    let hooks = app.hooks();
    let result = match request.env_mut() {
        Some(env) => guarded(|| hooks.on_body(env, chunk)),
        None => Ok(()),
    };
    if let Err(err) = result {
        request.fail(err);
    }
}

async fn next_event(current: &mut Option<InFlight>) -> Event {
    match current {
        Some(InFlight {
            phase: Phase::Waiting(rx),
            ..
        }) => Event::Resolved(rx.await.unwrap_or(Err(AppError::Dropped))),
        Some(InFlight {
            phase: Phase::Streaming(frames),
            ..
        }) => Event::Frame(frames.recv().await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    use super::*;
    use crate::env::Env;
    use crate::http::{Response, StatusCode};
    use crate::middleware::{Chain, handler_fn, sync_fn};
    use crate::server::{RequestHooks, ServerConfig};

    fn serve(app: App) -> (DuplexStream, JoinHandle<Result<(), ServerError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(server, None, Arc::new(app));
        (client, tokio::spawn(conn.run()))
    }

    async fn exchange(client: &mut DuplexStream, raw: &str) -> String {
        client.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn positions(haystack: &str, needles: &[&str]) -> Vec<usize> {
        needles
            .iter()
            .map(|n| haystack.find(n).unwrap_or_else(|| panic!("`{n}` missing from {haystack:?}")))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn pipelined_responses_keep_arrival_order() {
        let app = App::new(Chain::builder().endpoint(handler_fn(|env: Env| async move {
            let delay: u64 = env.query_param("delay").unwrap_or("0").parse().unwrap_or(0);
            sleep(Duration::from_millis(delay)).await;
            Ok(Response::new(StatusCode::Ok).body(format!("<{}>", env.path())))
        })));
        let (mut client, task) = serve(app);

        let out = exchange(
            &mut client,
            "GET /first?delay=30 HTTP/1.1\r\nHost: t\r\n\r\n\
             GET /second?delay=1 HTTP/1.1\r\nHost: t\r\n\r\n\
             GET /third?delay=10 HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        )
        .await;

        let at = positions(&out, &["</first>", "</second>", "</third>"]);
        assert!(at.windows(2).all(|w| w[0] < w[1]), "{out}");
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 3);
        assert_eq!(out.matches("Connection: keep-alive").count(), 2);
        assert!(out.ends_with("Connection: close\r\nContent-Length: 8\r\n\r\n</third>"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_stream_wire_bytes() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|env: Env| {
            let stream = env.stream().clone();
            tokio::spawn(async move {
                for chunk in ["a", "b", "c"] {
                    sleep(Duration::from_millis(1)).await;
                    stream.send_chunk(chunk)?;
                }
                stream.close_chunked()
            });
            Ok(Response::chunked(StatusCode::Ok))
        })));
        let (mut client, task) = serve(app);

        let out = exchange(&mut client, "GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n").await;

        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\n\
             Transfer-Encoding: chunked\r\n\
             Connection: close\r\n\
             \r\n\
             1\r\na\r\n\
             1\r\nb\r\n\
             1\r\nc\r\n\
             0\r\n\r\n"
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn plain_stream_closes_the_connection() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|env: Env| {
            env.stream().send("raw ")?;
            env.stream().send("bytes")?;
            env.stream().close()?;
            Ok(Response::streaming(StatusCode::Ok))
        })));
        let (mut client, task) = serve(app);

        // Keep-alive requested, but an unframed stream can only end with the connection.
        let out = exchange(&mut client, "GET / HTTP/1.1\r\n\r\nGET /never HTTP/1.1\r\n\r\n").await;

        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nraw bytes"));
        assert_eq!(out.matches("HTTP/1.1").count(), 1);
        task.await.unwrap().unwrap();
    }

    struct RejectBad;

    impl RequestHooks for RejectBad {
        fn on_body(&self, env: &mut Env, chunk: &Bytes) -> Result<(), AppError> {
            if chunk.windows(3).any(|w| w == b"bad") {
                return Err(AppError::bad_request("body rejected"));
            }
            env.body_mut().extend_from_slice(chunk);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_body_hook_answers_error_and_connection_continues() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = App::new(Chain::builder().endpoint(sync_fn(move |env: Env| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(StatusCode::Ok).body(format!("served {}", env.path())))
        })))
        .with_hooks(RejectBad);
        let (mut client, task) = serve(app);

        let out = exchange(
            &mut client,
            "POST /upload HTTP/1.1\r\nContent-Length: 7\r\n\r\nbad bit\
             GET /next HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;

        let at = positions(&out, &["HTTP/1.1 400 Bad Request", "body rejected", "served /next"]);
        assert!(at.windows(2).all(|w| w[0] < w[1]), "{out}");
        assert!(!out.contains("/upload"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn protocol_error_aborts_without_response() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|_| Ok(Response::new(StatusCode::Ok)))));
        let (mut client, task) = serve(app);

        let out = exchange(&mut client, "\x01\x02 nonsense\r\n\r\n").await;

        assert!(out.is_empty());
        assert!(matches!(task.await.unwrap(), Err(ServerError::Protocol(_))));
    }

    struct CountCloses {
        env_hooks: Arc<AtomicUsize>,
        on_close: Arc<AtomicUsize>,
    }

    impl RequestHooks for CountCloses {
        fn on_headers(&self, env: &mut Env) -> Result<(), AppError> {
            let hits = Arc::clone(&self.env_hooks);
            env.on_close(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        }

        fn on_close(&self, _head: &crate::http::RequestHead) {
            self.on_close.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_live_requests() {
        let env_hooks = Arc::new(AtomicUsize::new(0));
        let on_close = Arc::new(AtomicUsize::new(0));
        let app = App::new(Chain::builder().endpoint(handler_fn(|_| async {
            sleep(Duration::from_secs(3600)).await;
            Ok(Response::new(StatusCode::Ok))
        })))
        .with_hooks(CountCloses {
            env_hooks: Arc::clone(&env_hooks),
            on_close: Arc::clone(&on_close),
        });
        let (mut client, task) = serve(app);

        client
            .write_all(b"GET /slow HTTP/1.1\r\n\r\n\
              GET /queued HTTP/1.1\r\n\r\n\
              POST /partial HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        drop(client);

        task.await.unwrap().unwrap();
        assert_eq!(env_hooks.load(Ordering::SeqCst), 3);
        assert_eq!(on_close.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http10_closes_after_response() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|_| Ok(Response::new(StatusCode::Ok).body("old")))));
        let (mut client, task) = serve(app);

        let out = exchange(&mut client, "GET / HTTP/1.0\r\n\r\n").await;

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("old"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn head_response_omits_body_and_keeps_connection() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|env: Env| {
            if env.path() == "/live" {
                let _ = env.stream().send("never written");
                return Ok(Response::streaming(StatusCode::Ok));
            }
            Ok(Response::new(StatusCode::Ok).body("payload"))
        })));
        let (mut client, task) = serve(app);

        let out = exchange(
            &mut client,
            "HEAD /a HTTP/1.1\r\n\r\nHEAD /live HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(out.contains("Connection: keep-alive\r\nContent-Length: 7\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(!out.contains("never written"));
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 3);
        assert_eq!(out.matches("payload").count(), 1);
        assert!(out.ends_with("payload"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn keep_alive_can_be_disabled_server_wide() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|_| Ok(Response::new(StatusCode::NoContent)))))
            .with_config(ServerConfig {
                keep_alive: false,
                ..ServerConfig::default()
            });
        let (mut client, task) = serve(app);

        let out = exchange(&mut client, "GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").await;

        assert_eq!(out, "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn application_error_keeps_connection_usable() {
        let app = App::new(Chain::builder().endpoint(sync_fn(|env: Env| {
            if env.path() == "/boom" {
                return Err(AppError::internal("secret detail"));
            }
            Ok(Response::new(StatusCode::Ok).body("fine"))
        })));
        let (mut client, task) = serve(app);

        let out = exchange(
            &mut client,
            "GET /boom HTTP/1.1\r\n\r\nGET /ok HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("secret"));
        assert!(out.ends_with("fine"));
        task.await.unwrap().unwrap();
    }
}
