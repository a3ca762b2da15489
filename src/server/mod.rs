//! Loopback TCP coordinator for download processes.
//!
//! One server owns all running [`BookDownloader`]s. Clients connect over
//! localhost, issue newline-delimited JSON commands and receive progress
//! events. A `download` for a book that is already running attaches the
//! client to the existing download instead of starting a second one.
//!
//! Plain `GET` requests on the same port are answered with an HTTP 200 so
//! the port doubles as a health check endpoint.

pub mod client;
pub mod protocol;

pub use client::CoordinatorClient;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::book::Book;
use crate::config::EngineConfig;
use crate::download::{BookDownloader, DownloadControl, Outcome};
use crate::progress::{DownloadStatus, ProcessHandler, ProgressState, ProgressTracker};

use protocol::{Command, ERR_DOWNLOAD_FAILED, ERR_PARAM_NOT_PASSED, Event};

/// Errors raised while running or reaching the coordinator.
///
/// Constructed through the helper methods; no blanket `From` impls so
/// call sites stay explicit about which operation failed.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("connection failed: {source}")]
    Connection { source: std::io::Error },
}

impl ServerError {
    pub(crate) fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    pub(crate) fn connection(source: std::io::Error) -> Self {
        Self::Connection { source }
    }
}

/// Source of book metadata for `download` commands.
pub trait BookProvider: Send + Sync {
    fn book(&self, id: u64) -> Option<Book>;
}

/// Provider backed by a preloaded book list.
pub struct InMemoryBooks {
    books: HashMap<u64, Book>,
}

impl InMemoryBooks {
    #[must_use]
    pub fn new(books: impl IntoIterator<Item = Book>) -> Self {
        Self {
            books: books.into_iter().map(|book| (book.id, book)).collect(),
        }
    }
}

impl BookProvider for InMemoryBooks {
    fn book(&self, id: u64) -> Option<Book> {
        self.books.get(&id).cloned()
    }
}

/// Progress handler that fans events out to connected clients.
///
/// Attaching a subscriber replays the current state as an `init` event,
/// so a client that reconnects mid-download catches up losslessly.
pub struct SocketHandler {
    book_id: u64,
    tracker: ProgressTracker,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl SocketHandler {
    #[must_use]
    pub fn new(book_id: u64) -> Self {
        Self {
            book_id,
            tracker: ProgressTracker::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes a client and replays the current snapshot to it.
    pub fn attach(&self, tx: mpsc::UnboundedSender<Event>) {
        let snapshot = self.tracker.snapshot();
        if tx.send(Event::init_snapshot(self.book_id, &snapshot)).is_ok() {
            self.lock_subscribers().push(tx);
        }
    }

    fn broadcast(&self, event: Event) {
        // Disconnected clients are pruned on the next broadcast.
        self.lock_subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Event>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ProcessHandler for SocketHandler {
    fn init(&self, total_size: Option<u64>, status: DownloadStatus) {
        let state = self.tracker.init(total_size, status);
        self.broadcast(Event::init_snapshot(self.book_id, &state));
    }

    fn progress(&self, delta: u64) {
        self.tracker.progress(delta);
        self.broadcast(Event::Progress {
            book_id: self.book_id,
            delta,
        });
    }

    fn grow_total(&self, delta: u64) {
        self.tracker.grow_total(delta);
        self.broadcast(Event::GrowTotal {
            book_id: self.book_id,
            delta,
        });
    }

    fn set_status(&self, status: DownloadStatus) {
        self.tracker.set_status(status);
        self.broadcast(Event::SetStatus {
            book_id: self.book_id,
            status,
        });
    }

    fn finish(&self) {
        self.tracker.finish();
        self.broadcast(Event::SetStatus {
            book_id: self.book_id,
            status: DownloadStatus::Finished,
        });
    }

    fn error(&self, code: u8, message: &str) {
        self.broadcast(Event::Error {
            code,
            message: message.to_string(),
            book_id: Some(self.book_id),
        });
    }

    fn snapshot(&self) -> ProgressState {
        self.tracker.snapshot()
    }
}

struct RunningDownload {
    control: DownloadControl,
    handler: Arc<SocketHandler>,
}

struct ServerState {
    config: EngineConfig,
    running: Mutex<HashMap<u64, RunningDownload>>,
    /// Connected protocol clients (health probes excluded).
    clients: AtomicUsize,
    /// Bumped on every connect and abnormal disconnect; a pending grace
    /// timer fires only if its epoch is still current.
    grace_epoch: AtomicU64,
    shutdown: Notify,
}

impl ServerState {
    fn lock_running(&self) -> MutexGuard<'_, HashMap<u64, RunningDownload>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn terminate_all(&self) {
        let controls: Vec<(u64, DownloadControl)> = self
            .lock_running()
            .iter()
            .map(|(id, run)| (*id, run.control.clone()))
            .collect();
        for (id, control) in controls {
            info!(book_id = id, "terminating download");
            control.terminate().await;
        }
    }
}

/// Handle for stopping a running [`Server`] from the outside.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// Asks the server to terminate all downloads and stop accepting.
    pub fn shutdown(&self) {
        self.state.shutdown.notify_one();
    }

    /// Number of downloads currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state.lock_running().len()
    }
}

/// The coordinator server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    provider: Arc<dyn BookProvider>,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds the listener. Use port 0 to let the OS pick one.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub async fn bind(
        addr: &str,
        provider: Arc<dyn BookProvider>,
        config: EngineConfig,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self {
            listener,
            local_addr,
            provider,
            state: Arc::new(ServerState {
                config,
                running: Mutex::new(HashMap::new()),
                clients: AtomicUsize::new(0),
                grace_epoch: AtomicU64::new(0),
                shutdown: Notify::new(),
            }),
        })
    }

    /// The bound address, resolved after port 0 binds.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accepts connections until shut down, then drains all downloads.
    pub async fn run(self) {
        info!(addr = %self.local_addr, "coordinator listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let provider = Arc::clone(&self.provider);
                        let state = Arc::clone(&self.state);
                        tokio::spawn(handle_connection(stream, peer, provider, state));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                () = self.state.shutdown.notified() => break,
            }
        }
        info!("coordinator shutting down");
        self.state.terminate_all().await;
    }
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    provider: Arc<dyn BookProvider>,
    state: Arc<ServerState>,
) {
    let mut probe = [0u8; 4];
    let sniffed = match stream.peek(&mut probe).await {
        Ok(n) => &probe[..n],
        Err(e) => {
            debug!(error = %e, "connection dropped before first byte");
            return;
        }
    };
    if sniffed == b"GET " {
        serve_health_probe(stream).await;
        return;
    }

    state.clients.fetch_add(1, Ordering::SeqCst);
    // A reattaching client cancels any pending grace timer.
    state.grace_epoch.fetch_add(1, Ordering::SeqCst);
    debug!("client connected");

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if write_half
                .write_all(event.encode().as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let clean = serve_client(read_half, &tx, &provider, &state).await;

    drop(tx);
    let _ = writer.await;

    let remaining = state.clients.fetch_sub(1, Ordering::SeqCst) - 1;
    if clean {
        debug!("client disconnected");
        return;
    }

    warn!("client connection lost");
    if remaining == 0 {
        start_grace_timer(state);
    }
}

/// Reads and dispatches commands until the client goes away.
///
/// Returns `true` only when the client said `close` first. A plain EOF
/// looks the same whether the client exited cleanly without the goodbye
/// or was killed outright, so both count as an abnormal disconnect; a
/// read error does too.
async fn serve_client(
    read_half: OwnedReadHalf,
    tx: &mpsc::UnboundedSender<Event>,
    provider: &Arc<dyn BookProvider>,
    state: &Arc<ServerState>,
) -> bool {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Err(e) => {
                        debug!(error = %e, "rejected message");
                        let _ = tx.send(Event::protocol_error(&e));
                    }
                    Ok(Command::Close) => return true,
                    Ok(command) => dispatch_command(command, tx, provider, state).await,
                }
            }
            Ok(None) => return false,
            Err(e) => {
                debug!(error = %e, "read failed");
                return false;
            }
        }
    }
}

async fn dispatch_command(
    command: Command,
    tx: &mpsc::UnboundedSender<Event>,
    provider: &Arc<dyn BookProvider>,
    state: &Arc<ServerState>,
) {
    match command {
        // Handled by the read loop before dispatch.
        Command::Close => {}
        Command::Ping => {
            let _ = tx.send(Event::Pong);
        }
        Command::Download { book_id } => {
            start_or_attach(book_id, tx, provider, state);
        }
        Command::Terminate { book_id } => {
            // Clone the control out so the map lock is not held across
            // the drain. Terminating an idle book is a no-op.
            let control = state
                .lock_running()
                .get(&book_id)
                .map(|run| run.control.clone());
            if let Some(control) = control {
                info!(book_id, "terminate requested");
                control.terminate().await;
            }
        }
    }
}

fn start_or_attach(
    book_id: u64,
    tx: &mpsc::UnboundedSender<Event>,
    provider: &Arc<dyn BookProvider>,
    state: &Arc<ServerState>,
) {
    if let Some(run) = state.lock_running().get(&book_id) {
        debug!(book_id, "attaching to running download");
        run.handler.attach(tx.clone());
        return;
    }

    let Some(book) = provider.book(book_id) else {
        let _ = tx.send(Event::Error {
            code: ERR_PARAM_NOT_PASSED,
            message: format!("unknown book_id {book_id}"),
            book_id: Some(book_id),
        });
        return;
    };

    let handler = Arc::new(SocketHandler::new(book_id));
    let downloader = match BookDownloader::new(
        book,
        Arc::clone(&handler) as Arc<dyn ProcessHandler>,
        state.config.clone(),
    ) {
        Ok(downloader) => downloader,
        Err(e) => {
            warn!(book_id, error = %e, "download rejected");
            let _ = tx.send(Event::Error {
                code: ERR_DOWNLOAD_FAILED,
                message: e.to_string(),
                book_id: Some(book_id),
            });
            return;
        }
    };

    match state.lock_running().entry(book_id) {
        // Lost the construction race; the other download wins.
        Entry::Occupied(existing) => {
            existing.get().handler.attach(tx.clone());
            return;
        }
        Entry::Vacant(slot) => {
            slot.insert(RunningDownload {
                control: downloader.control(),
                handler: Arc::clone(&handler),
            });
        }
    }
    handler.attach(tx.clone());

    info!(book_id, "download started");
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let outcome = downloader.run().await;
        match outcome {
            Outcome::Finished(files) => {
                info!(book_id, chapters = files.len(), "download finished");
            }
            Outcome::Terminated => info!(book_id, "download terminated"),
            Outcome::Failed(e) => {
                warn!(book_id, error = %e, "download failed");
                handler.error(ERR_DOWNLOAD_FAILED, &e.to_string());
            }
        }
        state.lock_running().remove(&book_id);
    });
}

/// After an abnormal disconnect leaves the server without clients, the
/// downloads keep running for the grace period before everything is torn
/// down. Any reconnect cancels the timer.
fn start_grace_timer(state: Arc<ServerState>) {
    let grace = state.config.grace_period();
    let epoch = state.grace_epoch.load(Ordering::SeqCst);
    info!(grace_secs = grace.as_secs(), "no clients left, grace period started");
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if state.grace_epoch.load(Ordering::SeqCst) == epoch
            && state.clients.load(Ordering::SeqCst) == 0
        {
            info!("grace period expired, shutting down");
            state.terminate_all().await;
            state.shutdown.notify_one();
        }
    });
}

async fn serve_health_probe(mut stream: TcpStream) {
    // Consume the request head so the peer sees a graceful close.
    let mut buffer = [0u8; 1024];
    let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer).await;
    let body = "ok\n";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "health probe response failed");
    }
    let _ = stream.shutdown().await;
}
