//! Session-scoped advisory locks backed by SQL Server's `sp_getapplock` /
//! `sp_releaseapplock`.
//!
//! Advisory locks are cooperative: they don't block access to any database
//! object; instead, all participants must explicitly acquire the same named
//! lock. The server is the sole source of truth for lock state: the client
//! never infers lock status from anything other than the explicit return
//! status of the lock procedures.

use std::fmt;

use crate::error::{Error, Result};
use crate::mssql::connection::MssqlConnection;
use crate::mssql::protocol::RpcRequest;
use crate::mssql::types::MssqlValue;

/// Procedure used to request a named lock.
const GET_APPLOCK: &str = "sp_getapplock";

/// Procedure used to release a named lock.
const RELEASE_APPLOCK: &str = "sp_releaseapplock";

/// The server limits resource names to 255 characters.
const MAX_RESOURCE_LEN: usize = 255;

// ============================================================================
// Lock Descriptor
// ============================================================================

/// The lock mode for an advisory lock.
///
/// Maps to the `@LockMode` parameter of `sp_getapplock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MssqlAdvisoryLockMode {
    /// A shared lock, compatible with other `Shared` and `Update` locks.
    Shared,

    /// An update lock, compatible with `Shared` but not with other `Update`
    /// or `Exclusive`.
    Update,

    /// An exclusive lock, incompatible with all other lock modes.
    #[default]
    Exclusive,
}

impl MssqlAdvisoryLockMode {
    fn as_str(&self) -> &'static str {
        match self {
            MssqlAdvisoryLockMode::Shared => "Shared",
            MssqlAdvisoryLockMode::Update => "Update",
            MssqlAdvisoryLockMode::Exclusive => "Exclusive",
        }
    }

    /// Whether two concurrent holders with these modes can coexist on the
    /// same resource.
    ///
    /// This table documents the server's behavior for tests and callers;
    /// enforcement is entirely server-side and the client never consults it
    /// when acquiring.
    pub fn compatible_with(self, other: MssqlAdvisoryLockMode) -> bool {
        use MssqlAdvisoryLockMode::*;
        matches!((self, other), (Shared, Shared) | (Shared, Update) | (Update, Shared))
    }
}

/// The owner scope of an advisory lock: the `@LockOwner` parameter.
///
/// A `Session` lock is held until explicitly released or the session ends;
/// a `Transaction` lock is released automatically at transaction end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MssqlLockOwner {
    #[default]
    Session,
    Transaction,
}

impl MssqlLockOwner {
    fn as_str(&self) -> &'static str {
        match self {
            MssqlLockOwner::Session => "Session",
            MssqlLockOwner::Transaction => "Transaction",
        }
    }
}

/// How long `sp_getapplock` should wait for the lock: the `@LockTimeout`
/// parameter in milliseconds, with −1 meaning "wait forever" and 0 meaning
/// "no wait".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MssqlLockTimeout {
    #[default]
    WaitForever,
    NoWait,
    Millis(u32),
}

impl MssqlLockTimeout {
    fn as_millis(&self) -> i32 {
        match self {
            MssqlLockTimeout::WaitForever => -1,
            MssqlLockTimeout::NoWait => 0,
            MssqlLockTimeout::Millis(ms) => (*ms).min(i32::MAX as u32) as i32,
        }
    }
}

// ============================================================================
// Acquisition Outcome
// ============================================================================

/// The outcome of a lock acquisition attempt, mapped from the return
/// status of `sp_getapplock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    /// Status 0: the lock was granted synchronously.
    Granted,
    /// Status 1: the lock was granted after waiting for other holders.
    GrantedAfterWait,
    /// Status −1: the request timed out.
    TimedOut,
    /// Status −2: the request was cancelled.
    Cancelled,
    /// Status −3: the request was chosen as a deadlock victim.
    DeadlockVictim,
    /// Status ≤ −999: parameter validation or other call error.
    ValidationError,
}

impl AcquisitionOutcome {
    /// Map a return status to an outcome.
    ///
    /// The mapping is pure and total. Codes outside the documented set are
    /// placed in the server's call-error bucket rather than guessed at.
    pub fn from_status(status: i32) -> Self {
        match status {
            0 => AcquisitionOutcome::Granted,
            1 => AcquisitionOutcome::GrantedAfterWait,
            -1 => AcquisitionOutcome::TimedOut,
            -2 => AcquisitionOutcome::Cancelled,
            -3 => AcquisitionOutcome::DeadlockVictim,
            _ => AcquisitionOutcome::ValidationError,
        }
    }

    /// Whether this outcome means the lock is now held.
    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            AcquisitionOutcome::Granted | AcquisitionOutcome::GrantedAfterWait
        )
    }
}

impl fmt::Display for AcquisitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcquisitionOutcome::Granted => "granted",
            AcquisitionOutcome::GrantedAfterWait => "granted after wait",
            AcquisitionOutcome::TimedOut => "timed out",
            AcquisitionOutcome::Cancelled => "request cancelled",
            AcquisitionOutcome::DeadlockVictim => "deadlock victim",
            AcquisitionOutcome::ValidationError => "validation or call error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Advisory Lock
// ============================================================================

/// A session-scoped advisory lock descriptor.
///
/// The descriptor is immutable and cheap to clone; it has no server-side
/// identity until acquired, and the same descriptor can be reused across
/// attempts and connections.
///
/// # Resource Name
///
/// SQL Server limits resource names to 255 characters; names are validated
/// at construction. The name is sent as an RPC parameter, so SQL injection
/// is not possible.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(conn: &mut tdskit::MssqlConnection) -> tdskit::Result<()> {
/// use tdskit::MssqlAdvisoryLock;
///
/// let lock = MssqlAdvisoryLock::new("my_app_lock")?;
/// let guard = lock.acquire_guard(conn).await?;
///
/// // ... do work on the connection through the guard ...
///
/// guard.release_now().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MssqlAdvisoryLock {
    resource: String,
    mode: MssqlAdvisoryLockMode,
    owner: MssqlLockOwner,
    timeout: MssqlLockTimeout,
}

impl MssqlAdvisoryLock {
    /// Create a new advisory lock with the given resource name and the
    /// default [`Exclusive`][MssqlAdvisoryLockMode::Exclusive] mode.
    pub fn new(resource: impl Into<String>) -> Result<Self> {
        Self::with_mode(resource, MssqlAdvisoryLockMode::default())
    }

    /// Create a new advisory lock with the given resource name and mode.
    pub fn with_mode(resource: impl Into<String>, mode: MssqlAdvisoryLockMode) -> Result<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(Error::LockValidation(
                "resource name must not be empty".to_string(),
            ));
        }
        let len = resource.encode_utf16().count();
        if len > MAX_RESOURCE_LEN {
            return Err(Error::LockValidation(format!(
                "resource name is {len} characters; the server limit is {MAX_RESOURCE_LEN}"
            )));
        }

        Ok(Self {
            resource,
            mode,
            owner: MssqlLockOwner::default(),
            timeout: MssqlLockTimeout::default(),
        })
    }

    /// Set the owner scope.
    pub fn owner(mut self, owner: MssqlLockOwner) -> Self {
        self.owner = owner;
        self
    }

    /// Set the acquisition timeout used by [`acquire`][Self::acquire].
    pub fn timeout(mut self, timeout: MssqlLockTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the resource name of this lock.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the lock mode.
    pub fn mode(&self) -> &MssqlAdvisoryLockMode {
        &self.mode
    }

    /// Attempt to acquire the lock, waiting up to the configured timeout.
    ///
    /// Returns the server's decision. Only [`Granted`] and
    /// [`GrantedAfterWait`] mean the lock is held; every other outcome
    /// leaves the connection unlocked and immediately usable.
    ///
    /// A missing return status is a protocol error, never a silent grant.
    ///
    /// Note on cancellation: if this future is dropped mid-flight, the
    /// server may still grant the lock with no client-side record of it.
    /// Releasing it (or closing the connection) is then the caller's
    /// responsibility.
    ///
    /// [`Granted`]: AcquisitionOutcome::Granted
    /// [`GrantedAfterWait`]: AcquisitionOutcome::GrantedAfterWait
    pub async fn acquire(&self, conn: &mut MssqlConnection) -> Result<AcquisitionOutcome> {
        let request = self.acquire_request(self.timeout);
        let result = conn.execute_procedure_request(&request).await?;
        let status = result.return_status.ok_or_else(|| Error::UnknownStatus {
            procedure: GET_APPLOCK.to_string(),
        })?;
        Ok(AcquisitionOutcome::from_status(status))
    }

    /// Try to acquire the lock without waiting.
    ///
    /// Returns `Ok(None)` when the lock is simply not available (the
    /// underlying status is a timeout); a non-blocking probe failing to
    /// obtain the lock is an expected outcome, not an error. Other
    /// non-success outcomes are returned as data.
    pub async fn try_acquire(
        &self,
        conn: &mut MssqlConnection,
    ) -> Result<Option<AcquisitionOutcome>> {
        let request = self.acquire_request(MssqlLockTimeout::NoWait);
        let result = conn.execute_procedure_request(&request).await?;
        let status = result.return_status.ok_or_else(|| Error::UnknownStatus {
            procedure: GET_APPLOCK.to_string(),
        })?;

        match AcquisitionOutcome::from_status(status) {
            AcquisitionOutcome::TimedOut => Ok(None),
            outcome => Ok(Some(outcome)),
        }
    }

    /// Release the lock.
    ///
    /// The release procedure is invoked exactly once; a failure status maps
    /// to [`Error::ReleaseFailed`] and whether to retry is the caller's
    /// decision.
    pub async fn release(&self, conn: &mut MssqlConnection) -> Result<()> {
        let result = conn
            .execute_procedure_request(&self.release_request())
            .await?;

        match result.return_status {
            Some(0) => Ok(()),
            Some(status) => Err(Error::ReleaseFailed {
                resource: self.resource.clone(),
                status,
            }),
            None => Err(Error::UnknownStatus {
                procedure: RELEASE_APPLOCK.to_string(),
            }),
        }
    }

    /// Acquire the lock and wrap the connection in a guard that releases
    /// it on scope exit.
    ///
    /// Non-success outcomes become [`Error::AcquisitionFailed`]; the borrow
    /// ends with the error, so the connection stays usable.
    pub async fn acquire_guard<'c>(
        &self,
        conn: &'c mut MssqlConnection,
    ) -> Result<MssqlAdvisoryLockGuard<'_, 'c>> {
        let outcome = self.acquire(&mut *conn).await?;
        if outcome.is_granted() {
            Ok(MssqlAdvisoryLockGuard::new(self, conn))
        } else {
            Err(Error::AcquisitionFailed {
                resource: self.resource.clone(),
                outcome,
            })
        }
    }

    /// Non-blocking variant of [`acquire_guard`][Self::acquire_guard].
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere.
    pub async fn try_acquire_guard<'c>(
        &self,
        conn: &'c mut MssqlConnection,
    ) -> Result<Option<MssqlAdvisoryLockGuard<'_, 'c>>> {
        match self.try_acquire(&mut *conn).await? {
            Some(outcome) if outcome.is_granted() => {
                Ok(Some(MssqlAdvisoryLockGuard::new(self, conn)))
            }
            Some(outcome) => Err(Error::AcquisitionFailed {
                resource: self.resource.clone(),
                outcome,
            }),
            None => Ok(None),
        }
    }

    /// Build the `sp_getapplock` invocation for this lock.
    pub(crate) fn acquire_request(&self, timeout: MssqlLockTimeout) -> RpcRequest {
        RpcRequest::new(GET_APPLOCK)
            .param(self.resource.as_str())
            .param(self.mode.as_str())
            .param(self.owner.as_str())
            .param(MssqlValue::Int(timeout.as_millis()))
    }

    /// Build the `sp_releaseapplock` invocation for this lock.
    ///
    /// Explicit and implicit release both go through this builder, so the
    /// two paths produce identical invocations.
    pub(crate) fn release_request(&self) -> RpcRequest {
        RpcRequest::new(RELEASE_APPLOCK)
            .param(self.resource.as_str())
            .param(self.owner.as_str())
    }
}

// ============================================================================
// Lock Guard
// ============================================================================

/// A held advisory lock.
///
/// The guard holds the exclusive borrow of the connection, so nothing else
/// can issue commands on the session while the lock is held; run work under
/// the lock through [`connection`][Self::connection]. Constructed only from
/// a successful acquisition.
///
/// Dropping the guard queues the release invocation on the connection,
/// which runs it before the next command; call
/// [`release_now`][Self::release_now] to release immediately and observe
/// the result.
pub struct MssqlAdvisoryLockGuard<'l, 'c> {
    lock: &'l MssqlAdvisoryLock,
    conn: Option<&'c mut MssqlConnection>,
}

impl<'l, 'c> MssqlAdvisoryLockGuard<'l, 'c> {
    fn new(lock: &'l MssqlAdvisoryLock, conn: &'c mut MssqlConnection) -> Self {
        Self {
            lock,
            conn: Some(conn),
        }
    }

    /// The lock this guard holds.
    pub fn lock(&self) -> &MssqlAdvisoryLock {
        self.lock
    }

    /// The connection the lock is held on, for running work under the lock.
    pub fn connection(&mut self) -> &mut MssqlConnection {
        // The Option is emptied only by release_now and drop, both of which
        // consume the guard.
        match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => unreachable!("guard used after release"),
        }
    }

    /// Release the lock immediately.
    ///
    /// The guard is consumed and the connection borrow returned regardless
    /// of the result; a failed server-side release is reported, not
    /// retried, and the client no longer considers the lock held.
    pub async fn release_now(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.lock.release(conn).await,
            None => Ok(()),
        }
    }
}

impl Drop for MssqlAdvisoryLockGuard<'_, '_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(
                resource = %self.lock.resource,
                "advisory lock guard dropped; queueing release"
            );
            conn.defer_lock_release(self.lock.release_request());
        }
    }
}
