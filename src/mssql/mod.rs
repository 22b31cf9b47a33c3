//! SQL Server wire protocol implementation.
//!
//! This module provides a lean TDS client that:
//! - Speaks a subset of TDS 7.4 with SQL authentication
//! - Executes batches, parameterized queries, and stored-procedure calls
//! - Exposes session-scoped advisory locks with RAII guards
//!
//! Architecture:
//! - `protocol`: Low-level wire encoding and token decoding
//! - `types`: TDS value encoding/decoding
//! - `pipeline`: Folds the token stream into structured results
//! - `connection`: Connection state machine and management
//! - `advisory_lock`: Named server-side locks and their guards
//! - `pool`: Connection pool

pub mod advisory_lock;
pub mod connection;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod types;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use advisory_lock::{
    AcquisitionOutcome, MssqlAdvisoryLock, MssqlAdvisoryLockGuard, MssqlAdvisoryLockMode,
    MssqlLockOwner, MssqlLockTimeout,
};
pub use connection::{MssqlConfig, MssqlConnection};
pub use pipeline::{ProcedureResult, QueryResult};
pub use pool::{MssqlPool, MssqlPoolConfig, PooledConnection};
pub use protocol::{MssqlColumn, RpcRequest};
pub use types::{DataType, MssqlValue};
