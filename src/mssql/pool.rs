//! SQL Server connection pool.
//!
//! This module provides a connection pool built on top of the TDS
//! connection implementation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::mssql::connection::{MssqlConfig, MssqlConnection};
use crate::mssql::pipeline::{ProcedureResult, QueryResult};
use crate::mssql::types::MssqlValue;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct MssqlPoolConfig {
    /// Database connection URL
    pub url: String,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Maximum number of connections
    pub max_connections: u32,
}

impl MssqlPoolConfig {
    /// Create a new pool configuration.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            min_connections: 1,
            max_connections: 10,
        }
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection {
    /// The actual connection (None when returned to pool)
    conn: Option<MssqlConnection>,
    /// Reference back to the pool
    pool: Arc<MssqlPoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Direct access to the underlying connection, e.g. for taking an
    /// advisory lock on this session.
    pub fn connection(&mut self) -> Result<&mut MssqlConnection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Execute a SQL batch.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.connection()?.simple_query(sql).await
    }

    /// Execute a parameterized query.
    pub async fn query(&mut self, sql: &str, params: &[MssqlValue]) -> Result<QueryResult> {
        self.connection()?.query(sql, params).await
    }

    /// Invoke a stored procedure with positional parameters.
    pub async fn execute_procedure(
        &mut self,
        procedure: &str,
        params: &[MssqlValue],
    ) -> Result<ProcedureResult> {
        self.connection()?.execute_procedure(procedure, params).await
    }

    /// Begin a transaction.
    pub async fn begin(&mut self) -> Result<()> {
        self.connection()?.begin().await
    }

    /// Commit the transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.connection()?.commit().await
    }

    /// Rollback the transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.connection()?.rollback().await
    }

    /// Check if the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Only return healthy connections to the pool
            if !conn.is_closed() {
                let mut idle = self.pool.idle_connections.lock();
                idle.push(conn);
            }
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
struct MssqlPoolInner {
    /// Pool configuration
    config: MssqlPoolConfig,
    /// Idle connections waiting to be used
    idle_connections: Mutex<Vec<MssqlConnection>>,
    /// Semaphore to limit total connections
    semaphore: Arc<Semaphore>,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A SQL Server connection pool.
#[derive(Clone)]
pub struct MssqlPool {
    inner: Arc<MssqlPoolInner>,
}

impl MssqlPool {
    /// Create a new connection pool.
    pub async fn connect(config: MssqlPoolConfig) -> Result<Self> {
        let inner = Arc::new(MssqlPoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            idle_connections: Mutex::new(Vec::new()),
        });

        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.create_connection().await?;
            pool.inner.idle_connections.lock().push(conn);
        }

        Ok(pool)
    }

    /// Get a connection from the pool.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        // Acquire a permit (blocks if pool is exhausted)
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Protocol("pool closed".to_string()))?;

        // Try to get an idle connection
        let conn = {
            let mut idle = self.inner.idle_connections.lock();
            idle.pop()
        };

        let conn = match conn {
            Some(c) if !c.is_closed() => c,
            _ => self.create_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Execute a SQL batch on a pooled connection.
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let mut conn = self.acquire().await?;
        conn.simple_query(sql).await
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, sql: &str, params: &[MssqlValue]) -> Result<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.query(sql, params).await
    }

    /// Execute a statement without returning rows (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, sql: &str, params: &[MssqlValue]) -> Result<u64> {
        let result = self.query(sql, params).await?;
        Ok(result.rows_affected)
    }

    /// Close the pool and all idle connections.
    pub async fn close(&self) {
        let connections = {
            let mut idle = self.inner.idle_connections.lock();
            std::mem::take(&mut *idle)
        };

        for mut conn in connections {
            let _ = conn.close().await;
        }
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_connections.lock().len()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &MssqlPoolConfig {
        &self.inner.config
    }

    /// Create a new connection with the pool's configuration.
    async fn create_connection(&self) -> Result<MssqlConnection> {
        let config = MssqlConfig::from_url(&self.inner.config.url)?;
        MssqlConnection::connect_with_config(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config() {
        let config = MssqlPoolConfig::new("mssql://localhost/test")
            .min_connections(2)
            .max_connections(20);

        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 20);
    }
}
