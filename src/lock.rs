//! Advisory-lock arbitration for job claims.
//!
//! A claim is a session-scoped Postgres advisory lock keyed by the job's id.
//! The lock is strictly advisory: nothing in storage stops a caller that skips
//! the arbiter from mutating a "locked" row, so every code path that executes a
//! job must claim it here first. Session scoping is the crash-safety story: if
//! the holding connection dies, Postgres releases the lock and the job becomes
//! reclaimable by any polling worker.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// The two-integer advisory-lock key derived from a job id.
///
/// `pg_advisory_lock` and friends take either one 64-bit key or two 32-bit
/// ones; the two-integer form is used so that the components can be matched
/// against `pg_locks.classid`/`objid` for ownership queries. A v4 UUID is
/// already uniformly distributed, so the first eight bytes are used directly
/// with no further hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockKey {
    /// Upper half; matches `pg_locks.classid`.
    pub classid: u32,
    /// Lower half; matches `pg_locks.objid`.
    pub objid: u32,
}

impl From<Uuid> for LockKey {
    fn from(id: Uuid) -> Self {
        let bytes = id.as_bytes();
        Self {
            classid: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            objid: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

impl LockKey {
    /// The signed forms expected by the `pg_*_advisory_lock(int, int)` family.
    fn as_signed(self) -> (i32, i32) {
        (self.classid as i32, self.objid as i32)
    }

    /// The unsigned forms used to match `pg_locks` oid columns.
    fn as_oid_pair(self) -> (i64, i64) {
        (i64::from(self.classid), i64::from(self.objid))
    }
}

/// Wraps the store's advisory-lock primitive for job claims.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockArbiter;

impl LockArbiter {
    /// Create a new arbiter.
    pub fn new() -> Self {
        Self
    }

    /// Attempt a non-blocking claim of `job_id` on this connection's session.
    ///
    /// Returns `true` iff this session became the exclusive holder. Losing the
    /// race is the expected case under contention and costs one round trip.
    pub async fn try_claim(
        &self,
        conn: &mut PgConnection,
        job_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let (classid, objid) = LockKey::from(job_id).as_signed();
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1, $2)")
            .bind(classid)
            .bind(objid)
            .fetch_one(&mut *conn)
            .await
    }

    /// Release a claim held by this connection's session.
    ///
    /// A release of a lock this session does not hold is a no-op (Postgres
    /// emits a warning and returns false; both are ignored).
    pub async fn release(&self, conn: &mut PgConnection, job_id: Uuid) -> Result<(), sqlx::Error> {
        let (classid, objid) = LockKey::from(job_id).as_signed();
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1, $2)")
            .bind(classid)
            .bind(objid)
            .fetch_one(&mut *conn)
            .await?;
        Ok(())
    }

    /// Whether any session currently holds the claim on `job_id`.
    pub async fn is_locked(&self, pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
        let (classid, objid) = LockKey::from(job_id).as_oid_pair();
        sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND objsubid = 2
                  AND classid = $1::bigint::oid
                  AND objid = $2::bigint::oid
            )
            ",
        )
        .bind(classid)
        .bind(objid)
        .fetch_one(pool)
        .await
    }

    /// Whether this connection's session holds the claim on `job_id`.
    pub async fn owns(&self, conn: &mut PgConnection, job_id: Uuid) -> Result<bool, sqlx::Error> {
        let (classid, objid) = LockKey::from(job_id).as_oid_pair();
        sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND objsubid = 2
                  AND classid = $1::bigint::oid
                  AND objid = $2::bigint::oid
                  AND pid = pg_backend_pid()
            )
            ",
        )
        .bind(classid)
        .bind(objid)
        .fetch_one(&mut *conn)
        .await
    }

    /// Administrative escape hatch: terminate the holder's database session.
    ///
    /// A normal release only works from the holding session. When the true
    /// holder is an unresponsive process, the only safe way to free the claim
    /// is to kill its backend, which releases every lock the session held.
    /// Returns the number of backends terminated (0 if nothing held the lock).
    pub async fn force_release(&self, pool: &PgPool, job_id: Uuid) -> Result<u64, sqlx::Error> {
        let (classid, objid) = LockKey::from(job_id).as_oid_pair();
        let terminated = sqlx::query_scalar::<_, bool>(
            r"
            SELECT pg_terminate_backend(pid) FROM pg_locks
            WHERE locktype = 'advisory'
              AND objsubid = 2
              AND classid = $1::bigint::oid
              AND objid = $2::bigint::oid
              AND pid <> pg_backend_pid()
            ",
        )
        .bind(classid)
        .bind(objid)
        .fetch_all(pool)
        .await?;

        Ok(terminated.into_iter().filter(|ok| *ok).count() as u64)
    }
}
