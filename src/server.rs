//! The hyper-backed native server and its lifecycle.
//!
//! # Threads
//!
//! - The listener and every connection run on a multi-threaded tokio runtime.
//! - Each application call runs on tokio's blocking pool. A slow application
//!   holds a blocking thread, never a scheduler thread.
//! - [`Server::start`] puts the whole runtime on a dedicated OS thread so the
//!   caller's thread stays free to wait for signals.
//!
//! # Shutdown
//!
//! On SIGINT / SIGTERM (or [`Running::stop`]) the server:
//! 1. Stops `listener.accept()`. No new connections are made.
//! 2. Asks every live connection to shut down gracefully: responses already
//!    in progress finish, idle keep-alive connections close.
//! 3. Waits for the connection tasks, then returns.
//!
//! An application call that never returns keeps step 3 waiting; there is no
//! per-request timeout.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::adapter::{Exchange, State};
use crate::app::Application;
use crate::body::Framing;
use crate::config::Config;
use crate::env::RequestHead;
use crate::error::Error;
use crate::pump::ResponseSink;

/// Chunks that may sit between the application thread and the socket before
/// the application blocks.
const CHUNK_BUFFER: usize = 16;

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// The HTTP server.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Shorthand for `Server::new(Config::new(host, port))`.
    ///
    /// ```rust,no_run
    /// let server = bridle::Server::bind("127.0.0.1", 3000);
    /// ```
    pub fn bind(host: &str, port: u16) -> Self {
        Self::new(Config::new(host, port))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serves `app` on the current runtime until SIGINT or SIGTERM, then
    /// drains.
    pub async fn serve<A: Application>(self, app: A) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `signal` resolves, then drains.
    pub async fn serve_with_shutdown<A, F>(self, app: A, signal: F) -> Result<(), Error>
    where
        A: Application,
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.lookup().await?).await?;
        info!(addr = %listener.local_addr()?, "bridle listening");
        accept_loop(listener, Arc::new(app), signal).await
    }

    /// Starts serving on a dedicated thread and returns once the listener is
    /// bound.
    pub fn start<A: Application>(self, app: A) -> Result<Running, Error> {
        let addr = self.config.socket_addr()?;
        let control = Arc::new(Control::default());

        let thread = {
            let control = Arc::clone(&control);
            thread::Builder::new().name("bridle-listener".to_owned()).spawn(move || {
                let result = listen(addr, app, &control);
                if let Err(e) = &result {
                    error!(%addr, "listener stopped: {e}");
                }
                control.set(Phase::Stopped);
                result
            })?
        };

        match control.wait_listening() {
            Some(local_addr) => Ok(Running { local_addr, control, thread: Some(thread) }),
            None => match thread.join() {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) | Err(_) => Err(Error::ServerThread),
            },
        }
    }

    /// Starts the server, blocks the calling thread until SIGINT or SIGTERM,
    /// then stops it.
    pub fn run<A: Application>(self, app: A) -> Result<(), Error> {
        let running = self.start(app)?;
        let signals = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        signals.block_on(shutdown_signal());
        info!("shutdown signal received");
        running.stop()
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Phase {
    #[default]
    Starting,
    Listening(SocketAddr),
    Stopping,
    Stopped,
}

/// Start/stop handshake between the controlling thread and the listener.
#[derive(Default)]
struct Control {
    phase: Mutex<Phase>,
    changed: Condvar,
    stop: Notify,
}

impl Control {
    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, phase: Phase) {
        *self.lock() = phase;
        self.changed.notify_all();
    }

    /// Moves Starting to Listening. False when a stop came first.
    fn listening(&self, addr: SocketAddr) -> bool {
        let mut phase = self.lock();
        if *phase != Phase::Starting {
            return false;
        }
        *phase = Phase::Listening(addr);
        self.changed.notify_all();
        true
    }

    fn wait_listening(&self) -> Option<SocketAddr> {
        let phase = self
            .changed
            .wait_while(self.lock(), |p| *p == Phase::Starting)
            .unwrap_or_else(PoisonError::into_inner);
        match *phase {
            Phase::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    fn request_stop(&self) {
        {
            let mut phase = self.lock();
            if *phase != Phase::Stopped {
                *phase = Phase::Stopping;
            }
            self.changed.notify_all();
        }
        // Stores a permit if the accept loop is not parked yet.
        self.stop.notify_one();
    }
}

/// A server started with [`Server::start`]. Dropping it stops the server.
pub struct Running {
    local_addr: SocketAddr,
    control: Arc<Control>,
    thread: Option<JoinHandle<Result<(), Error>>>,
}

impl Running {
    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        matches!(*self.control.lock(), Phase::Listening(_))
    }

    /// Stops accepting, drains live connections and joins the listener thread.
    pub fn stop(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.control.request_stop();
        thread.join().map_err(|_| Error::ServerThread)?
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(addr = %self.local_addr, "server stopped with error: {e}");
        }
    }
}

fn listen<A: Application>(addr: SocketAddr, app: A, control: &Control) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bridle-worker")
        .build()?;
    runtime.block_on(bind_and_serve(addr, app, control))
}

async fn bind_and_serve<A: Application>(
    addr: SocketAddr,
    app: A,
    control: &Control,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    if !control.listening(local) {
        return Ok(());
    }
    info!(addr = %local, "bridle listening");
    accept_loop(listener, Arc::new(app), control.stop.notified()).await
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop<A, F>(listener: TcpListener, app: Arc<A>, shutdown: F) -> Result<(), Error>
where
    A: Application,
    F: Future<Output = ()>,
{
    // Flipped once on shutdown; every connection task watches it.
    let (drain_tx, drain_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            () = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutting down, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                tasks.spawn(serve_connection(stream, peer, Arc::clone(&app), drain_rx.clone()));
            }

            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    let _ = drain_tx.send(true);
    while tasks.join_next().await.is_some() {}

    info!("bridle stopped");
    Ok(())
}

async fn serve_connection<A: Application>(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    app: Arc<A>,
    mut drain: watch::Receiver<bool>,
) {
    let svc = service_fn(move |req| {
        let app = Arc::clone(&app);
        async move { serve_request(app, req, peer).await }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(%peer, "connection error: {e}");
                }
                break;
            }
            Ok(()) = drain.changed() => conn.as_mut().graceful_shutdown(),
        }
    }
}

// ── Request bridging ──────────────────────────────────────────────────────────

/// Buffers the body, then runs the exchange on the blocking pool and hands
/// hyper whatever head the application produced.
async fn serve_request<A: Application>(
    app: Arc<A>,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> Result<http::Response<ResponseBody>, Infallible> {
    let (parts, mut incoming) = req.into_parts();
    let head = RequestHead::from_parts(&parts, Some(peer));
    let mut exchange = Exchange::new(head, Framing::Verbatim);

    while let Some(frame) = incoming.frame().await {
        let outcome = match frame {
            // Trailers carry nothing the environment has a place for.
            Ok(frame) => frame.into_data().map_or(Ok(()), |data| exchange.on_body(&data)),
            Err(e) => Err(Error::RequestBody(e.into())),
        };
        if let Err(err) = outcome {
            exchange.fail(&err);
            return Ok(plain(StatusCode::BAD_REQUEST));
        }
    }
    if let Err(err) = exchange.on_end() {
        exchange.fail(&err);
        return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let (mut sink, head) = HyperSink::new(peer, &parts.method);
    let task = tokio::task::spawn_blocking(move || exchange.respond(app.as_ref(), &mut sink));

    match head.await {
        Ok(response) => Ok(response),
        // The sink went away without a head: the blocking task itself died.
        Err(_) => {
            match task.await {
                Ok(state) => error!(%peer, ?state, "exchange ended without a response"),
                Err(e) => error!(%peer, "exchange task failed: {e}"),
            }
            Ok(plain(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn plain(status: StatusCode) -> http::Response<ResponseBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = Full::new(Bytes::from_static(reason.as_bytes())).boxed_unsync();
    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    response
}

/// The blocking side of one response: the head goes back through a oneshot,
/// chunks through a bounded channel that hyper polls as the body.
///
/// HEAD requests and 1xx/204/304 answers never carry a body on the wire;
/// hyper drops the stream, so their chunks are discarded here instead.
struct HyperSink {
    peer: SocketAddr,
    head_only: bool,
    discard: bool,
    head: Option<oneshot::Sender<http::Response<ResponseBody>>>,
    stream: Option<ChunkStream>,
    chunks: Option<mpsc::Sender<Bytes>>,
}

impl HyperSink {
    fn new(
        peer: SocketAddr,
        method: &Method,
    ) -> (Self, oneshot::Receiver<http::Response<ResponseBody>>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
        let sink = Self {
            peer,
            head_only: *method == Method::HEAD,
            discard: false,
            head: Some(head_tx),
            stream: Some(ChunkStream(chunk_rx)),
            chunks: Some(chunk_tx),
        };
        (sink, head_rx)
    }
}

fn forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

impl ResponseSink for HyperSink {
    fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), Error> {
        let (Some(head), Some(stream)) = (self.head.take(), self.stream.take()) else {
            return Err(Error::State { event: "start", state: State::Responding });
        };
        self.discard = self.head_only || forbids_body(status);
        if self.discard {
            self.chunks = None;
        }
        let mut response = http::Response::new(stream.boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        head.send(response).map_err(|_| Error::Disconnected)
    }

    fn write(&mut self, chunk: Bytes) -> Result<(), Error> {
        if self.discard {
            return Ok(());
        }
        let chunks = self.chunks.as_ref().ok_or(Error::Disconnected)?;
        chunks.blocking_send(chunk).map_err(|_| Error::Disconnected)
    }

    fn finish(&mut self) {
        // Closing the channel ends the body stream.
        self.chunks = None;
        self.head = None;
    }

    fn report(&mut self, error: &Error) {
        error!(peer = %self.peer, "{error}");
    }
}

/// Response body fed by [`HyperSink`].
struct ChunkStream(mpsc::Receiver<Bytes>);

impl hyper::body::Body for ChunkStream {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        self.0.poll_recv(cx).map(|chunk| chunk.map(|c| Ok(Frame::data(c))))
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
