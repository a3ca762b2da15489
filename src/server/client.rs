//! Client for the coordinator protocol.
//!
//! Owns one connection, sends commands and dispatches incoming events to
//! the [`ProcessHandler`] registered per book. The read loop runs as a
//! background task for the lifetime of the client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::progress::{DownloadStatus, ProcessHandler};

use super::ServerError;
use super::protocol::{Command, Event};

type HandlerMap = Arc<Mutex<HashMap<u64, Arc<dyn ProcessHandler>>>>;

/// Connection to a running coordinator.
pub struct CoordinatorClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    handlers: HandlerMap,
    pongs: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    reader: JoinHandle<()>,
}

impl CoordinatorClient {
    /// Connects and starts the background event reader.
    ///
    /// # Errors
    ///
    /// Fails when the coordinator cannot be reached.
    pub async fn connect(addr: &str) -> Result<Self, ServerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ServerError::connection)?;
        let (read_half, write_half) = stream.into_split();

        let handlers: HandlerMap = Arc::new(Mutex::new(HashMap::new()));
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();

        let dispatch_handlers = Arc::clone(&handlers);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match Event::parse(&line) {
                    Ok(event) => dispatch_event(event, &dispatch_handlers, &pong_tx),
                    Err(e) => warn!(error = %e, "unrecognized server event"),
                }
            }
            debug!("coordinator connection closed");
        });

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            handlers,
            pongs: tokio::sync::Mutex::new(pong_rx),
            reader,
        })
    }

    /// Requests the download of `book_id`, routing its events to `handler`.
    ///
    /// If the book is already downloading, the server replays the current
    /// state and the handler picks up from there.
    ///
    /// # Errors
    ///
    /// Fails when the connection is gone.
    pub async fn download(
        &self,
        book_id: u64,
        handler: Arc<dyn ProcessHandler>,
    ) -> Result<(), ServerError> {
        self.lock_handlers().insert(book_id, handler);
        self.send(Command::Download { book_id }).await
    }

    /// Asks the server to terminate the download of `book_id`. The
    /// terminal status arrives as an event once the download has unwound.
    ///
    /// # Errors
    ///
    /// Fails when the connection is gone.
    pub async fn terminate(&self, book_id: u64) -> Result<(), ServerError> {
        self.send(Command::Terminate { book_id }).await
    }

    /// Says goodbye so the server treats the disconnect as deliberate.
    ///
    /// Dropping the client without this looks like a crash to the server,
    /// which starts its reconnect grace timer once no clients remain.
    ///
    /// # Errors
    ///
    /// Fails when the connection is gone.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.send(Command::Close).await
    }

    /// Liveness check. Returns `true` when a `pong` arrives in time.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let mut pongs = self.pongs.lock().await;
        // Drop pongs left over from earlier timed-out pings.
        while pongs.try_recv().is_ok() {}
        if self.send(Command::Ping).await.is_err() {
            return false;
        }
        tokio::time::timeout(timeout, pongs.recv())
            .await
            .is_ok_and(|pong| pong.is_some())
    }

    async fn send(&self, command: Command) -> Result<(), ServerError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(command.encode().as_bytes())
            .await
            .map_err(ServerError::connection)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn ProcessHandler>>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for CoordinatorClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn dispatch_event(event: Event, handlers: &HandlerMap, pongs: &mpsc::UnboundedSender<()>) {
    let handler_for = |book_id: u64| -> Option<Arc<dyn ProcessHandler>> {
        let map = match handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&book_id).cloned()
    };

    match event {
        Event::Init {
            book_id,
            status,
            total_size,
            done_size,
        } => {
            if let Some(handler) = handler_for(book_id) {
                handler.init(total_size, status);
                if done_size > 0 {
                    handler.progress(done_size);
                }
            }
        }
        Event::Progress { book_id, delta } => {
            if let Some(handler) = handler_for(book_id) {
                handler.progress(delta);
            }
        }
        Event::GrowTotal { book_id, delta } => {
            if let Some(handler) = handler_for(book_id) {
                handler.grow_total(delta);
            }
        }
        Event::SetStatus { book_id, status } => {
            if let Some(handler) = handler_for(book_id) {
                if status == DownloadStatus::Finished {
                    handler.finish();
                } else {
                    handler.set_status(status);
                }
            }
        }
        Event::Error {
            code,
            message,
            book_id,
        } => {
            warn!(code, book_id, "server reported error: {message}");
            if let Some(handler) = book_id.and_then(&handler_for) {
                handler.error(code, &message);
            }
        }
        Event::Pong => {
            let _ = pongs.send(());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::book::{Book, Chapter};
    use crate::config::EngineConfig;
    use crate::progress::{ChannelHandler, ProgressEvent};
    use crate::server::{BookProvider, InMemoryBooks, Server};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn spawn_server(provider: Arc<dyn BookProvider>) -> String {
        let server = Server::bind("127.0.0.1:0", provider, EngineConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().to_string();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let addr = spawn_server(Arc::new(InMemoryBooks::new([]))).await;
        let client = CoordinatorClient::connect(&addr).await.unwrap();
        assert!(client.ping(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_download_events_reach_registered_handler() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/one.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 512]))
            .mount(&mock)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let book = Book {
            id: 10,
            title: "Remote".to_string(),
            author: "Author".to_string(),
            url: format!("{}/book/10", mock.uri()),
            dir_path: dir.path().join("remote"),
            preview: None,
            chapters: vec![Chapter {
                title: "One".to_string(),
                duration: 30.0,
                file_url: format!("{}/one.mp3", mock.uri()),
            }],
        };
        let addr = spawn_server(Arc::new(InMemoryBooks::new([book]))).await;

        let client = CoordinatorClient::connect(&addr).await.unwrap();
        let (handler, mut events) = ChannelHandler::new();
        client.download(10, Arc::new(handler)).await.unwrap();

        let mut bytes = 0u64;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                // init restarts accounting; preparation ticks are not
                // byte progress.
                ProgressEvent::Init { .. } => bytes = 0,
                ProgressEvent::Progress { delta } => bytes += delta,
                ProgressEvent::Finished => break,
                _ => {}
            }
        }
        assert_eq!(bytes, 512);
        assert!(dir.path().join("remote").join("01. One.mp3").exists());
    }

    #[tokio::test]
    async fn test_error_events_reach_registered_handler() {
        let addr = spawn_server(Arc::new(InMemoryBooks::new([]))).await;
        let client = CoordinatorClient::connect(&addr).await.unwrap();
        let (handler, mut events) = ChannelHandler::new();
        // Empty catalog, so the server rejects the download.
        client.download(77, Arc::new(handler)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ProgressEvent::Error { code, message } => {
                assert_eq!(code, crate::server::protocol::ERR_PARAM_NOT_PASSED);
                assert!(message.contains("77"), "{message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        client.close().await.unwrap();
    }
}
