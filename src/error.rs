use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Praetor library error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Setup { message: String },
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {status}")]
    CommandFailed { command: String, status: i32 },
    #[error("Request to {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("amtredird request failed: {message}")]
    Redirection { message: String },
    #[error("Failed to wait {seconds} seconds for {what}")]
    Timeout { what: String, seconds: u64 },
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("stage `{stage}` failed: {message}")]
    Stage { stage: String, message: String },
    #[error("{reason}")]
    Host { reason: String },
    #[error("Failed to send report: {message}")]
    Report { message: String },
}

impl Error {
    /// Setup problems are reported to stderr and exit the process with code 2.
    pub fn setup(message: impl Into<String>) -> Self {
        Error::Setup {
            message: message.into(),
        }
    }

    /// A per-host operational failure; moves the host into the failed set.
    pub fn host(reason: impl Into<String>) -> Self {
        Error::Host {
            reason: reason.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            context,
            path: path.into(),
            source,
        }
    }
}
