//! Job status file coordination between a supervisor and download
//! subprocesses.
//!
//! Each scheduled book gets a status file at
//! `<jobs_dir>/<first 32 hex of sha256(book_url)>.abjob` holding the
//! latest [`ProgressState`] as JSON. The file is the whole contract:
//! the subprocess keeps it updated, the supervisor polls it, and either
//! side deleting it cancels the download. A subprocess whose file
//! vanishes tears down its partial output and exits.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::book::Book;
use crate::config::EngineConfig;
use crate::download::DownloadControl;
use crate::progress::{DownloadStatus, ProcessHandler, ProgressState, ProgressTracker};

/// Job status file extension.
pub const JOB_FILE_EXT: &str = "abjob";

/// Minimum delay between persisted progress updates. Status changes and
/// `init` bypass the throttle.
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Errors raised by job file handling and subprocess supervision.
///
/// Constructed through the helper methods; no blanket `From` impls so
/// call sites stay explicit about which operation failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job file i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("job file {path} holds invalid state: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("no jobs directory configured")]
    MissingJobsDir,
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn spawn(program: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }
}

/// Derives the status file path for a book URL.
///
/// The name is the first 32 hex characters of the URL's SHA-256, so it is
/// stable across runs and independent of the book title.
#[must_use]
pub fn job_file_path(jobs_dir: &Path, book_url: &str) -> PathBuf {
    let digest = Sha256::digest(book_url.as_bytes());
    let hex = hex::encode(digest);
    jobs_dir.join(format!("{}.{JOB_FILE_EXT}", &hex[..32]))
}

/// One job status file.
#[derive(Debug, Clone)]
pub struct JobFile {
    path: PathBuf,
}

impl JobFile {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn for_book(jobs_dir: &Path, book_url: &str) -> Self {
        Self::new(job_file_path(jobs_dir, book_url))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file currently exists. A read error counts as absent.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Writes `state` to the file, replacing any previous content.
    ///
    /// The write goes through a sibling temp file and a rename so a
    /// concurrent reader never sees a torn document.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] when the file cannot be written.
    pub async fn update(&self, state: &ProgressState) -> Result<(), JobError> {
        // ProgressState is plain data; serialization cannot fail.
        let body = serde_json::to_vec(state).unwrap_or_default();
        let tmp = self.path.with_extension(format!("{JOB_FILE_EXT}.tmp"));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| JobError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| JobError::io(&self.path, e))
    }

    /// Creates the file with an initial state. Same as [`Self::update`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] when the file cannot be written.
    pub async fn create(&self, state: &ProgressState) -> Result<(), JobError> {
        self.update(state).await
    }

    /// Reads the current state, `None` when the file is gone.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] for read failures other than absence and
    /// [`JobError::Parse`] for unreadable content.
    pub async fn load(&self) -> Result<Option<ProgressState>, JobError> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(JobError::io(&self.path, e)),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| JobError::parse(&self.path, e))
    }

    /// Deletes the file. Absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Io`] for other removal failures.
    pub async fn remove(&self) -> Result<(), JobError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::io(&self.path, e)),
        }
    }

    /// Time since the file was last written, `None` when it is gone.
    pub async fn age(&self) -> Option<Duration> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        let modified = meta.modified().ok()?;
        modified.elapsed().ok()
    }
}

/// Progress handler that persists snapshots to a job status file.
///
/// Writes happen on a background task fed over a channel, so the handler
/// callbacks stay synchronous. Progress deltas are throttled; lifecycle
/// transitions always flush.
pub struct JobFileHandler {
    tracker: ProgressTracker,
    tx: mpsc::UnboundedSender<ProgressState>,
    last_flush: Mutex<Instant>,
}

impl JobFileHandler {
    /// Starts the writer task for `file`. Must be called on a runtime.
    #[must_use]
    pub fn new(file: JobFile) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressState>();
        tokio::spawn(async move {
            let mut wrote = false;
            while let Some(mut state) = rx.recv().await {
                // Coalesce a backlog into its newest snapshot.
                while let Ok(next) = rx.try_recv() {
                    state = next;
                }
                // Deleting the file means cancel; recreating it here would
                // swallow that signal.
                if wrote && !file.exists().await {
                    debug!("job file gone, dropping update");
                    continue;
                }
                if let Err(e) = file.update(&state).await {
                    warn!(error = %e, "job file update failed");
                } else {
                    wrote = true;
                }
            }
        });
        Self {
            tracker: ProgressTracker::new(),
            tx,
            last_flush: Mutex::new(
                Instant::now()
                    .checked_sub(FLUSH_INTERVAL)
                    .unwrap_or_else(Instant::now),
            ),
        }
    }

    fn push(&self, state: ProgressState, force: bool) {
        let mut last = match self.last_flush.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if force || last.elapsed() >= FLUSH_INTERVAL {
            *last = Instant::now();
            let _ = self.tx.send(state);
        }
    }
}

impl ProcessHandler for JobFileHandler {
    fn init(&self, total_size: Option<u64>, status: DownloadStatus) {
        let state = self.tracker.init(total_size, status);
        self.push(state, true);
    }

    fn progress(&self, delta: u64) {
        let state = self.tracker.progress(delta);
        self.push(state, false);
    }

    fn grow_total(&self, delta: u64) {
        let state = self.tracker.grow_total(delta);
        self.push(state, false);
    }

    fn set_status(&self, status: DownloadStatus) {
        let state = self.tracker.set_status(status);
        self.push(state, true);
    }

    fn finish(&self) {
        let state = self.tracker.finish();
        self.push(state, true);
    }

    fn snapshot(&self) -> ProgressState {
        self.tracker.snapshot()
    }
}

/// Polls the job file from inside the downloading subprocess and
/// terminates the download when the file vanishes.
///
/// Returns once the download reaches a terminal state either way.
pub async fn watch_job_file(file: JobFile, control: DownloadControl, interval: Duration) {
    loop {
        tokio::select! {
            () = control.wait_done() => return,
            () = tokio::time::sleep(interval) => {}
        }
        if !file.exists().await {
            info!(path = %file.path().display(), "job file removed, terminating");
            control.terminate().await;
            return;
        }
    }
}

/// What the supervisor observed during a poll tick.
#[derive(Debug)]
pub enum JobUpdate {
    /// A subprocess was spawned for the book.
    Started { book_id: u64 },
    /// The persisted status changed while the subprocess runs.
    Status { book_id: u64, state: ProgressState },
    /// The job file disappeared; the download is being canceled.
    Canceled { book_id: u64 },
    /// The job file stopped updating; the supervisor canceled it.
    Stale { book_id: u64 },
    /// The subprocess exited with a finished status file.
    Finished { book_id: u64 },
    /// The subprocess exited without finishing.
    Failed { book_id: u64, detail: String },
}

struct RunningJob {
    book: Book,
    file: JobFile,
    child: Child,
    last_status: DownloadStatus,
    canceled: bool,
}

/// Schedules book downloads as `abdl download --job-file` subprocesses.
///
/// Drive it either with [`Supervisor::run`] or by calling
/// [`Supervisor::tick`] on your own cadence.
pub struct Supervisor {
    config: EngineConfig,
    jobs_dir: PathBuf,
    program: PathBuf,
    queue: VecDeque<Book>,
    running: Vec<RunningJob>,
}

impl Supervisor {
    /// Builds a supervisor spawning `program` (the `abdl` binary).
    ///
    /// # Errors
    ///
    /// Fails when the config names no jobs directory or it cannot be
    /// created.
    pub fn new(config: EngineConfig, program: PathBuf) -> Result<Self, JobError> {
        let jobs_dir = config.jobs_dir.clone().ok_or(JobError::MissingJobsDir)?;
        std::fs::create_dir_all(&jobs_dir).map_err(|e| JobError::io(&jobs_dir, e))?;
        Ok(Self {
            config,
            jobs_dir,
            program,
            queue: VecDeque::new(),
            running: Vec::new(),
        })
    }

    /// Queues a book for download.
    pub fn enqueue(&mut self, book: Book) {
        self.queue.push_back(book);
    }

    /// Number of live subprocesses.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Whether all queued work has drained.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    /// Polls on the configured interval until idle, forwarding updates.
    pub async fn run(&mut self, updates: &mpsc::UnboundedSender<JobUpdate>) {
        loop {
            for update in self.tick().await {
                let _ = updates.send(update);
            }
            if self.is_idle() {
                return;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// One poll tick: reap exited subprocesses, watch job files, spawn
    /// waiting entries up to the parallelism cap.
    #[instrument(skip(self), fields(running = self.running.len(), queued = self.queue.len()))]
    pub async fn tick(&mut self) -> Vec<JobUpdate> {
        let mut updates = Vec::new();

        let mut index = 0;
        while index < self.running.len() {
            let (update, exited) = self.poll_job(index).await;
            updates.extend(update);
            if exited {
                self.running.swap_remove(index);
            } else {
                index += 1;
            }
        }

        while self.running.len() < self.config.max_parallel_books {
            let Some(book) = self.queue.pop_front() else {
                break;
            };
            updates.push(self.spawn_job(book).await);
        }

        updates
    }

    /// Returns the update to surface (if any) and whether the slot is done.
    async fn poll_job(&mut self, index: usize) -> (Option<JobUpdate>, bool) {
        let job = &mut self.running[index];
        let book_id = job.book.id;

        match job.child.try_wait() {
            Ok(Some(exit)) => {
                let state = job.file.load().await.ok().flatten();
                if let Err(e) = job.file.remove().await {
                    warn!(book_id, error = %e, "job file cleanup failed");
                }
                // A canceled job already reported when its file vanished.
                if job.canceled {
                    return (None, true);
                }
                let update = match state {
                    Some(state) if state.status == DownloadStatus::Finished => {
                        info!(book_id, "subprocess finished");
                        JobUpdate::Finished { book_id }
                    }
                    Some(state) => JobUpdate::Failed {
                        book_id,
                        detail: format!("exited {exit} with status {}", state.status),
                    },
                    None => JobUpdate::Failed {
                        book_id,
                        detail: format!("exited {exit} without a job file"),
                    },
                };
                (Some(update), true)
            }
            Ok(None) => (self.watch_running(index).await, false),
            Err(e) => {
                warn!(book_id, error = %e, "subprocess wait failed");
                (None, false)
            }
        }
    }

    /// Checks a live subprocess's job file for cancellation, staleness
    /// and status changes.
    async fn watch_running(&mut self, index: usize) -> Option<JobUpdate> {
        let stale_after = self.config.stale_after();
        let job = &mut self.running[index];
        let book_id = job.book.id;

        if job.canceled {
            return None;
        }

        let Some(state) = job.file.load().await.ok().flatten() else {
            // The user deleted the file; the subprocess notices the same
            // absence and tears itself down.
            info!(book_id, "job file gone, download canceled");
            job.canceled = true;
            return Some(JobUpdate::Canceled { book_id });
        };

        if let Some(age) = job.file.age().await {
            if age >= stale_after && !state.status.is_terminal() {
                warn!(book_id, age_secs = age.as_secs(), "job file stale, canceling");
                if let Err(e) = job.file.remove().await {
                    warn!(book_id, error = %e, "stale job file removal failed");
                }
                job.canceled = true;
                return Some(JobUpdate::Stale { book_id });
            }
        }

        if state.status != job.last_status {
            debug!(book_id, status = %state.status, "job status changed");
            job.last_status = state.status;
            return Some(JobUpdate::Status { book_id, state });
        }
        None
    }

    async fn spawn_job(&mut self, book: Book) -> JobUpdate {
        let book_id = book.id;
        let file = JobFile::for_book(&self.jobs_dir, &book.url);
        let initial = ProgressState::default();
        if let Err(e) = file.create(&initial).await {
            return JobUpdate::Failed {
                book_id,
                detail: e.to_string(),
            };
        }

        // Book is plain data; serialization cannot fail.
        let descriptor = serde_json::to_string(&book).unwrap_or_default();
        let spawned = Command::new(&self.program)
            .arg("download")
            .arg("--book")
            .arg(&descriptor)
            .arg("--job-file")
            .arg(file.path())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::spawn(&self.program, e));

        match spawned {
            Ok(child) => {
                info!(book_id, path = %file.path().display(), "subprocess spawned");
                self.running.push(RunningJob {
                    book,
                    file,
                    child,
                    last_status: initial.status,
                    canceled: false,
                });
                JobUpdate::Started { book_id }
            }
            Err(e) => {
                let _ = file.remove().await;
                JobUpdate::Failed {
                    book_id,
                    detail: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    #[test]
    fn test_job_file_path_is_stable_and_url_derived() {
        let dir = Path::new("/var/jobs");
        let a = job_file_path(dir, "https://example.com/book/1");
        let b = job_file_path(dir, "https://example.com/book/1");
        let c = job_file_path(dir, "https://example.com/book/2");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let name = a.file_name().unwrap().to_str().unwrap();
        let (stem, ext) = name.split_once('.').unwrap();
        assert_eq!(ext, JOB_FILE_EXT);
        assert_eq!(stem.len(), 32);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_job_file_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = JobFile::for_book(dir.path(), "https://example.com/book/5");

        assert!(!file.exists().await);
        assert!(file.load().await.unwrap().is_none());

        let state = ProgressState {
            status: DownloadStatus::Downloading,
            total_size: Some(1000),
            done_size: 250,
        };
        file.create(&state).await.unwrap();
        assert_eq!(file.load().await.unwrap().unwrap(), state);

        let updated = ProgressState {
            done_size: 1000,
            status: DownloadStatus::Finished,
            ..state
        };
        file.update(&updated).await.unwrap();
        assert_eq!(file.load().await.unwrap().unwrap(), updated);

        file.remove().await.unwrap();
        assert!(!file.exists().await);
        // Removing again is a no-op.
        file.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_job_file_handler_persists_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let file = JobFile::new(dir.path().join("handler.abjob"));
        let handler = JobFileHandler::new(file.clone());

        handler.init(Some(500), DownloadStatus::Downloading);
        handler.progress(200);
        handler.finish();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = file.load().await.unwrap().unwrap();
        assert_eq!(state.status, DownloadStatus::Finished);
        assert_eq!(state.total_size, Some(500));
        assert_eq!(state.done_size, 500);
    }

    #[tokio::test]
    async fn test_watch_job_file_terminates_on_deletion() {
        use crate::download::{BookDownloader, Outcome};
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 1024])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let book = Book {
            id: 1,
            title: "Watched".to_string(),
            author: "A".to_string(),
            url: format!("{}/book/1", mock.uri()),
            dir_path: dir.path().join("watched"),
            preview: None,
            chapters: vec![crate::book::Chapter {
                title: "One".to_string(),
                duration: 10.0,
                file_url: format!("{}/one.mp3", mock.uri()),
            }],
        };

        let file = JobFile::for_book(dir.path(), &book.url);
        file.create(&ProgressState::default()).await.unwrap();

        let handler = Arc::new(JobFileHandler::new(file.clone()));
        let downloader =
            BookDownloader::new(book, handler, EngineConfig::default()).unwrap();
        let control = downloader.control();
        let watcher = tokio::spawn(watch_job_file(
            file.clone(),
            control,
            Duration::from_millis(20),
        ));
        let driver = tokio::spawn(downloader.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        file.remove().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Outcome::Terminated));
        watcher.await.unwrap();
        assert!(!dir.path().join("watched").exists());
    }

    /// Writes an executable shell script standing in for the subprocess.
    fn fake_program(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-abdl");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervised_book(id: u64) -> Book {
        Book {
            id,
            title: format!("Book {id}"),
            author: "A".to_string(),
            url: format!("https://example.com/book/{id}"),
            dir_path: PathBuf::from("/tmp/unused"),
            preview: None,
            chapters: Vec::new(),
        }
    }

    fn supervisor_config(jobs_dir: &Path) -> EngineConfig {
        EngineConfig {
            jobs_dir: Some(jobs_dir.to_path_buf()),
            poll_interval_ms: 20,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_supervisor_spawns_and_reports_cancel_on_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_program(dir.path(), "sleep 30");
        let mut supervisor =
            Supervisor::new(supervisor_config(dir.path()), program).unwrap();
        supervisor.enqueue(supervised_book(1));

        let updates = supervisor.tick().await;
        assert!(matches!(updates[..], [JobUpdate::Started { book_id: 1 }]));
        assert_eq!(supervisor.running_count(), 1);

        let file = JobFile::for_book(dir.path(), "https://example.com/book/1");
        assert!(file.exists().await);
        file.remove().await.unwrap();

        let updates = supervisor.tick().await;
        assert!(matches!(updates[..], [JobUpdate::Canceled { book_id: 1 }]));
    }

    #[tokio::test]
    async fn test_supervisor_reports_finished_exit() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_program(dir.path(), "exit 0");
        let mut supervisor =
            Supervisor::new(supervisor_config(dir.path()), program).unwrap();
        supervisor.enqueue(supervised_book(2));

        let updates = supervisor.tick().await;
        assert!(matches!(updates[..], [JobUpdate::Started { book_id: 2 }]));

        // Stand in for the subprocess's final write.
        let file = JobFile::for_book(dir.path(), "https://example.com/book/2");
        file.update(&ProgressState {
            status: DownloadStatus::Finished,
            total_size: Some(10),
            done_size: 10,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let updates = supervisor.tick().await;
        assert!(matches!(updates[..], [JobUpdate::Finished { book_id: 2 }]));
        assert!(supervisor.is_idle());
        assert!(!file.exists().await);
    }

    #[tokio::test]
    async fn test_supervisor_cancels_stale_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_program(dir.path(), "sleep 30");
        let config = EngineConfig {
            stale_after_secs: 0,
            ..supervisor_config(dir.path())
        };
        let mut supervisor = Supervisor::new(config, program).unwrap();
        supervisor.enqueue(supervised_book(3));

        let updates = supervisor.tick().await;
        assert!(matches!(updates[..], [JobUpdate::Started { book_id: 3 }]));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let updates = supervisor.tick().await;
        assert!(matches!(updates[..], [JobUpdate::Stale { book_id: 3 }]));
        let file = JobFile::for_book(dir.path(), "https://example.com/book/3");
        assert!(!file.exists().await);
    }

    #[tokio::test]
    async fn test_supervisor_caps_parallelism() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_program(dir.path(), "sleep 30");
        let config = EngineConfig {
            max_parallel_books: 2,
            ..supervisor_config(dir.path())
        };
        let mut supervisor = Supervisor::new(config, program).unwrap();
        for id in 1..=4 {
            supervisor.enqueue(supervised_book(id));
        }

        let updates = supervisor.tick().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(supervisor.running_count(), 2);

        let updates = supervisor.tick().await;
        assert!(updates.is_empty());
        assert_eq!(supervisor.running_count(), 2);
    }

    #[tokio::test]
    async fn test_supervisor_requires_jobs_dir() {
        let config = EngineConfig::default();
        let result = Supervisor::new(config, PathBuf::from("abdl"));
        assert!(matches!(result, Err(JobError::MissingJobsDir)));
    }
}
