//! CLI entry point for the audiobook downloader.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use audiobook_core::{
    Book, BookDownloader, ConsoleHandler, CoordinatorClient, EngineConfig, InMemoryBooks,
    JobFile, JobFileHandler, Outcome, ProcessHandler, Server, watch_job_file,
};
use clap::Parser;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, CliCommand};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(args.config.as_deref()).await?;

    match args.command {
        CliCommand::Serve { listen, books } => serve(&listen, &books, config).await,
        CliCommand::Download {
            book,
            job_file,
            concurrency,
            no_transcode,
        } => {
            let mut config = config;
            if let Some(limit) = concurrency {
                config.concurrency = usize::from(limit);
            }
            if no_transcode {
                config.transcode = false;
            }
            download(&book, job_file, config).await
        }
        CliCommand::Status { addr } => status(&addr).await,
    }
}

async fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("parsing config {}", path.display()))
}

async fn serve(listen: &str, books_path: &Path, config: EngineConfig) -> Result<()> {
    let body = tokio::fs::read(books_path)
        .await
        .with_context(|| format!("reading book catalog {}", books_path.display()))?;
    let books: Vec<Book> = serde_json::from_slice(&body)
        .with_context(|| format!("parsing book catalog {}", books_path.display()))?;
    info!(count = books.len(), "book catalog loaded");

    let server = Server::bind(listen, Arc::new(InMemoryBooks::new(books)), config).await?;
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });
    server.run().await;
    Ok(())
}

async fn download(descriptor: &str, job_file: Option<PathBuf>, config: EngineConfig) -> Result<()> {
    let book = parse_book(descriptor).await?;
    info!(book_id = book.id, title = %book.title, "download starting");

    let poll_interval = config.poll_interval();
    let (handler, job): (Arc<dyn ProcessHandler>, Option<JobFile>) = match job_file {
        Some(path) => {
            let file = JobFile::new(path);
            (Arc::new(JobFileHandler::new(file.clone())), Some(file))
        }
        None => (Arc::new(ConsoleHandler::new()), None),
    };

    let downloader = BookDownloader::new(book, handler, config)?;
    let control = downloader.control();

    if let Some(file) = job {
        // Subprocess mode: the supervisor (or user) cancels by deleting
        // the job file.
        tokio::spawn(watch_job_file(file, control, poll_interval));
    } else {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, terminating download");
                control.terminate().await;
            }
        });
    }

    match downloader.run().await {
        Outcome::Finished(files) => {
            for file in &files {
                info!(path = %file.path.display(), sha256 = %file.sha256, "chapter written");
            }
            info!(chapters = files.len(), "download finished");
            Ok(())
        }
        Outcome::Terminated => bail!("download terminated"),
        Outcome::Failed(e) => Err(e.into()),
    }
}

async fn parse_book(descriptor: &str) -> Result<Book> {
    let trimmed = descriptor.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).context("parsing inline book descriptor")
    } else {
        Book::load(Path::new(descriptor))
            .await
            .context("loading book descriptor")
    }
}

async fn status(addr: &str) -> Result<()> {
    let client = CoordinatorClient::connect(addr).await?;
    let alive = client.ping(Duration::from_secs(3)).await;
    // Say goodbye so the probe does not start the server's grace timer.
    let _ = client.close().await;
    if alive {
        println!("coordinator at {addr} is up");
        Ok(())
    } else {
        bail!("no response from coordinator at {addr}")
    }
}
