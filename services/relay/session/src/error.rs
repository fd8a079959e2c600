//! Server error types.

use relay_wire::WireError;
use std::io;
use thiserror::Error;

/// Errors surfaced by the session server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration or operation in the wrong server state
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A listener or UDP socket failed to bind
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        /// Address that failed to bind
        addr: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// Session capacity reached
    #[error("session capacity exceeded")]
    CapacityExceeded,

    /// Per-session read/write failure
    #[error("session i/o error: {0}")]
    SessionIo(#[from] io::Error),

    /// Error raised inside a preprocessor
    #[error("preprocess error: {0}")]
    PreProcess(#[from] WireError),

    /// Unrecoverable server fault
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result alias used throughout the server core.
pub type Result<T> = std::result::Result<T, ServerError>;
