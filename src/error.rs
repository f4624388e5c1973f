//! Error types and result handling for pg-logical-stream.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_logical_stream::{Error, Result};
//!
//! fn drop_missing_slot() -> Result<()> {
//!     Err(Error::SlotNotFound("orders_slot".to_string()))
//! }
//!
//! match drop_missing_slot() {
//!     Ok(()) => println!("Dropped"),
//!     Err(Error::SlotNotFound(slot)) => eprintln!("No such slot: {}", slot),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// SQLSTATE raised when an object such as a replication slot already exists.
pub const DUPLICATE_OBJECT: &str = "42710";

/// SQLSTATE raised when a replication slot does not exist.
pub const UNDEFINED_OBJECT: &str = "42704";

/// SQLSTATE raised when the output plugin library cannot be loaded.
pub const UNDEFINED_FILE: &str = "58P01";

/// SQLSTATE raised when a replication slot is held by another process.
pub const OBJECT_IN_USE: &str = "55006";

/// The main error type for pg-logical-stream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error not covered by a more specific variant.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Transport failure reaching the source, or the connection was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The source answered in an unexpected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The slot could not be created (it already exists, the plugin is unknown, ...).
    #[error("Failed to create replication slot '{slot}': {message}")]
    SlotCreation {
        /// Name of the slot that was requested
        slot: String,
        /// Reason reported by the source
        message: String,
    },

    /// An operation targeted a slot that does not exist.
    #[error("Replication slot '{0}' does not exist")]
    SlotNotFound(String),

    /// The server rejected a command with an error response.
    #[error("Server error [{code}]: {message}")]
    Server {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// A log position could not be parsed.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// An operation was requested in the wrong lifecycle state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// The streaming task panicked or was aborted.
    #[error("Task error: {0}")]
    Task(String),

    /// Graceful shutdown was requested (e.g., the record receiver was dropped).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the replication loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Returns the SQLSTATE code when the server rejected a command.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server { code, .. } => Some(code.as_str()),
            Error::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// Returns `true` if the source could not be reached or the connection dropped.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    pub(crate) fn connection(e: impl std::fmt::Display) -> Self {
        Error::Connection(e.to_string())
    }

    pub(crate) fn protocol(e: impl std::fmt::Display) -> Self {
        Error::Protocol(e.to_string())
    }

    /// Classifies an error from the regular (non-replication) client.
    pub(crate) fn from_client(e: tokio_postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            Error::Server {
                code: db.code().code().to_string(),
                message: db.message().to_string(),
            }
        } else if e.is_closed() || has_io_source(&e) {
            Error::Connection(e.to_string())
        } else {
            Error::Postgres(e)
        }
    }
}

fn has_io_source(e: &tokio_postgres::Error) -> bool {
    std::error::Error::source(e).map_or(false, |source| source.is::<std::io::Error>())
}

/// A convenient Result type alias for pg-logical-stream operations.
///
/// This is equivalent to `std::result::Result<T, pg_logical_stream::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
