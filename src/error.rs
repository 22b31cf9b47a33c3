//! Error types for the TDS client.

use thiserror::Error;

use crate::mssql::advisory_lock::AcquisitionOutcome;

/// Result type for all client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (unexpected token, invalid format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Login handshake failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server raised an error during execution.
    #[error("server error {number} (severity {class}, state {state}): {message}")]
    Server {
        number: i32,
        state: u8,
        class: u8,
        message: String,
        server: String,
        procedure: String,
        line: u32,
    },

    /// Value encoding or decoding failed.
    #[error("type error: {0}")]
    Type(String),

    /// Connection URL or configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection is closed or in an invalid state.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A stored procedure completed without sending its return status.
    ///
    /// The absence of a status token is never interpreted as success.
    #[error("procedure '{procedure}' completed without a return status")]
    UnknownStatus { procedure: String },

    /// An advisory lock descriptor failed client-side validation.
    #[error("lock validation error: {0}")]
    LockValidation(String),

    /// A blocking lock acquisition did not result in a grant.
    #[error("failed to acquire advisory lock '{resource}': {outcome}")]
    AcquisitionFailed {
        resource: String,
        outcome: AcquisitionOutcome,
    },

    /// An advisory lock release returned a failure status.
    ///
    /// The guard (if any) has still transitioned to released; retrying is
    /// the caller's decision.
    #[error("failed to release advisory lock '{resource}': status {status}")]
    ReleaseFailed { resource: String, status: i32 },
}
