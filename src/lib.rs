//! A lightweight asynchronous SQL Server client.
//!
//! tdskit speaks a lean subset of the TDS wire protocol directly over TCP
//! and is built around three layers:
//!
//! - a connection type ([`MssqlConnection`]) with batch, parameterized
//!   query, and stored-procedure execution;
//! - a result pipeline that folds the server's token stream into
//!   [`QueryResult`]/[`ProcedureResult`], including the out-of-band
//!   procedure return status;
//! - session-scoped advisory locks ([`MssqlAdvisoryLock`]) with RAII
//!   guards, backed by `sp_getapplock`/`sp_releaseapplock`.

pub mod error;
pub mod mssql;

pub use error::{Error, Result};
pub use mssql::{
    AcquisitionOutcome, MssqlAdvisoryLock, MssqlAdvisoryLockGuard, MssqlAdvisoryLockMode,
    MssqlColumn, MssqlConfig, MssqlConnection, MssqlLockOwner, MssqlLockTimeout, MssqlPool,
    MssqlPoolConfig, MssqlValue, PooledConnection, ProcedureResult, QueryResult,
};
