//! Wire protocol for the download coordinator.
//!
//! Newline-delimited JSON over a loopback TCP connection. Clients send
//! command objects (`{"command":"download","book_id":3}`), the server
//! answers with event objects tagged by an `event` field. Malformed input
//! is answered with an `error` event carrying a stable numeric code and
//! never closes the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::progress::{DownloadStatus, ProgressState};

/// The message was not a JSON object with a string `command`.
pub const ERR_INCORRECT_MESSAGE: u8 = 1;
/// The command name is not part of the protocol.
pub const ERR_UNKNOWN_COMMAND: u8 = 2;
/// A required parameter is missing or has the wrong type.
pub const ERR_PARAM_NOT_PASSED: u8 = 3;
/// A download failed after it was accepted.
pub const ERR_DOWNLOAD_FAILED: u8 = 4;

/// Client-to-server commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start (or re-attach to) the download of a book.
    Download { book_id: u64 },
    /// Terminate the download of a book and wait for it to unwind.
    Terminate { book_id: u64 },
    /// Liveness check, answered with `pong`.
    Ping,
    /// Goodbye before disconnecting. A connection that ends without one
    /// is treated as a crashed client.
    Close,
}

/// Protocol-level rejection of a client message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("incorrect message: {detail}")]
    IncorrectMessage { detail: String },

    #[error("unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("parameter not passed: {param}")]
    ParamNotPassed { param: String },
}

impl ProtocolError {
    /// Stable numeric code carried by the `error` event.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::IncorrectMessage { .. } => ERR_INCORRECT_MESSAGE,
            Self::UnknownCommand { .. } => ERR_UNKNOWN_COMMAND,
            Self::ParamNotPassed { .. } => ERR_PARAM_NOT_PASSED,
        }
    }
}

impl Command {
    /// Parses one line of client input.
    ///
    /// Parsing is done by hand over a `Value` rather than a tagged enum so
    /// the three failure modes (not a message, unknown command, missing
    /// parameter) stay distinguishable for their distinct error codes.
    ///
    /// # Errors
    ///
    /// Returns the [`ProtocolError`] matching what was wrong.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::IncorrectMessage {
                detail: e.to_string(),
            })?;
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::IncorrectMessage {
                detail: "not an object".to_string(),
            })?;
        let command = object
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::IncorrectMessage {
                detail: "missing command field".to_string(),
            })?;

        match command {
            "ping" => Ok(Self::Ping),
            "close" => Ok(Self::Close),
            "download" => Ok(Self::Download {
                book_id: require_book_id(object)?,
            }),
            "terminate" => Ok(Self::Terminate {
                book_id: require_book_id(object)?,
            }),
            other => Err(ProtocolError::UnknownCommand {
                name: other.to_string(),
            }),
        }
    }

    /// Serializes the command as one protocol line (newline included).
    #[must_use]
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Download { book_id } => {
                serde_json::json!({"command": "download", "book_id": book_id})
            }
            Self::Terminate { book_id } => {
                serde_json::json!({"command": "terminate", "book_id": book_id})
            }
            Self::Ping => serde_json::json!({"command": "ping"}),
            Self::Close => serde_json::json!({"command": "close"}),
        };
        let mut line = value.to_string();
        line.push('\n');
        line
    }
}

fn require_book_id(
    object: &serde_json::Map<String, Value>,
) -> Result<u64, ProtocolError> {
    object
        .get("book_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::ParamNotPassed {
            param: "book_id".to_string(),
        })
}

/// Server-to-client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Progress snapshot, sent on attach and whenever accounting restarts.
    /// `done_size` lets a late subscriber catch up losslessly.
    Init {
        book_id: u64,
        status: DownloadStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_size: Option<u64>,
        #[serde(default)]
        done_size: u64,
    },
    /// Newly downloaded bytes (delta, not cumulative).
    Progress { book_id: u64, delta: u64 },
    /// The known total grew (merged streams accumulate their total).
    GrowTotal { book_id: u64, delta: u64 },
    /// Status change.
    SetStatus {
        book_id: u64,
        status: DownloadStatus,
    },
    /// Protocol or download error. Does not close the connection.
    Error {
        code: u8,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        book_id: Option<u64>,
    },
    /// Answer to `ping`.
    Pong,
}

impl Event {
    /// Builds the `init` snapshot event for a book's current progress.
    #[must_use]
    pub fn init_snapshot(book_id: u64, state: &ProgressState) -> Self {
        Self::Init {
            book_id,
            status: state.status,
            total_size: state.total_size,
            done_size: state.done_size,
        }
    }

    /// Builds the `error` event for a rejected client message.
    #[must_use]
    pub fn protocol_error(error: &ProtocolError) -> Self {
        Self::Error {
            code: error.code(),
            message: error.to_string(),
            book_id: None,
        }
    }

    /// Serializes the event as one protocol line (newline included).
    #[must_use]
    pub fn encode(&self) -> String {
        // Event serialization cannot fail: no maps with non-string keys,
        // no non-finite floats.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Parses one line of server output.
    ///
    /// # Errors
    ///
    /// Returns the serde error for unrecognized lines.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
