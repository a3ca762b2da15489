//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Download audiobooks from streaming sources into a local library.
///
/// Runs either as a long-lived coordinator serving download commands over
/// a local socket, or as a one-shot downloader for a single book.
#[derive(Parser, Debug)]
#[command(name = "abdl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a JSON engine configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the download coordinator
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7979")]
        listen: String,

        /// JSON file holding the available book descriptors
        #[arg(long)]
        books: PathBuf,
    },

    /// Download a single book
    Download {
        /// Book descriptor: inline JSON or a path to a JSON file
        #[arg(long)]
        book: String,

        /// Job status file for subprocess coordination
        #[arg(long)]
        job_file: Option<PathBuf>,

        /// Maximum concurrent segment fetches (1-64)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
        concurrency: Option<u8>,

        /// Keep the raw transport stream instead of transcoding to mp3
        #[arg(long)]
        no_transcode: bool,
    },

    /// Ping a running coordinator
    Status {
        /// Coordinator address
        #[arg(long, default_value = "127.0.0.1:7979")]
        addr: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_status_defaults() {
        let args = Args::try_parse_from(["abdl", "status"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        match args.command {
            CliCommand::Status { addr } => assert_eq!(addr, "127.0.0.1:7979"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_download_with_job_file() {
        let args = Args::try_parse_from([
            "abdl",
            "download",
            "--book",
            r#"{"id":1}"#,
            "--job-file",
            "/tmp/jobs/abc.abjob",
        ])
        .unwrap();
        match args.command {
            CliCommand::Download {
                book,
                job_file,
                concurrency,
                no_transcode,
            } => {
                assert_eq!(book, r#"{"id":1}"#);
                assert_eq!(job_file, Some(PathBuf::from("/tmp/jobs/abc.abjob")));
                assert_eq!(concurrency, None);
                assert!(!no_transcode);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_download_requires_book() {
        let result = Args::try_parse_from(["abdl", "download"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_download_concurrency_bounds() {
        let args =
            Args::try_parse_from(["abdl", "download", "--book", "{}", "-c", "64"]).unwrap();
        match args.command {
            CliCommand::Download { concurrency, .. } => assert_eq!(concurrency, Some(64)),
            other => panic!("unexpected command: {other:?}"),
        }

        let result = Args::try_parse_from(["abdl", "download", "--book", "{}", "-c", "0"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_verbose_flag_is_global() {
        let args = Args::try_parse_from(["abdl", "status", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_serve_requires_books() {
        let result = Args::try_parse_from(["abdl", "serve"]);
        assert!(result.is_err());

        let args =
            Args::try_parse_from(["abdl", "serve", "--books", "books.json"]).unwrap();
        match args.command {
            CliCommand::Serve { listen, books } => {
                assert_eq!(listen, "127.0.0.1:7979");
                assert_eq!(books, PathBuf::from("books.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["abdl", "--help"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }
}
