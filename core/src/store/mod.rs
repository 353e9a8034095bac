//! Content store interface
//!
//! The workflow engine talks to the hierarchical content store through two
//! seams:
//! - [`ContentHandle`]: the variants and requests of one document handle,
//!   buffered in a session until `save()`
//! - [`LockManager`]: lease-based path locks used by the cluster task queue
//!
//! [`memory`] provides an in-memory implementation of both.

pub mod memory;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::StoreResult;
use crate::model::{DocumentVariant, PublicationRequest, VariantState};

pub use memory::{HandleSession, NodeEvent, NodeView, Repository, Session};

// ============================================================================
// CONTENT HANDLE
// ============================================================================

/// A checked-in snapshot of a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Position in the variant's version history, starting at 1
    pub index: usize,
    pub created: DateTime<Utc>,
    pub content: Map<String, Value>,
}

/// Access to one document handle inside a store session.
///
/// Mutations are buffered until [`save`](ContentHandle::save); a failed save
/// leaves the buffered changes in place for the caller to discard with
/// `refresh(false)`.
pub trait ContentHandle {
    /// Absolute path of the handle node
    fn path(&self) -> &str;

    /// Current name of the handle node
    fn name(&self) -> StoreResult<String>;

    /// Store clock, used for audit timestamps
    fn now(&self) -> DateTime<Utc>;

    fn variants(&self) -> StoreResult<Vec<DocumentVariant>>;

    fn variant(&self, state: VariantState) -> StoreResult<Option<DocumentVariant>> {
        Ok(self.variants()?.into_iter().find(|v| v.state == state))
    }

    /// Requests in store order
    fn requests(&self) -> StoreResult<Vec<PublicationRequest>>;

    /// Add a variant; returns the assigned id.
    fn add_variant(&mut self, variant: DocumentVariant) -> StoreResult<String>;

    fn update_variant(&mut self, variant: &DocumentVariant) -> StoreResult<()>;

    fn remove_variant(&mut self, id: &str) -> StoreResult<()>;

    fn set_holder(&mut self, id: &str, holder: Option<&str>) -> StoreResult<()>;

    /// Append a request; returns the assigned id.
    fn add_request(&mut self, request: PublicationRequest) -> StoreResult<String>;

    fn update_request(&mut self, request: &PublicationRequest) -> StoreResult<()>;

    fn remove_request(&mut self, id: &str) -> StoreResult<()>;

    /// Rename the handle and every variant under it.
    fn rename(&mut self, new_name: &str) -> StoreResult<()>;

    /// Snapshot the current content of a variant into its version history.
    fn checkin(&mut self, id: &str) -> StoreResult<Version>;

    fn versions(&self, id: &str) -> StoreResult<Vec<Version>>;

    /// Persist buffered changes; fails with `Conflict` on concurrent modification.
    fn save(&mut self) -> StoreResult<()>;

    /// Reload from the store, keeping or discarding buffered changes.
    fn refresh(&mut self, keep_changes: bool) -> StoreResult<()>;
}

// ============================================================================
// LEASE LOCKS
// ============================================================================

/// Status of a lease
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Lease is held
    Active,

    /// Lease timed out and was reclaimed
    Expired,

    /// Lease was released by its owner
    Released,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseStatus::Active => write!(f, "active"),
            LeaseStatus::Expired => write!(f, "expired"),
            LeaseStatus::Released => write!(f, "released"),
        }
    }
}

/// A time-limited lock on a store path.
///
/// The token identifies this particular acquisition; renewing or releasing
/// requires presenting it, so a holder whose lease was reclaimed cannot
/// disturb the next owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    /// Unique token of this acquisition
    pub token: Uuid,

    /// Locked path
    pub path: String,

    /// Identity of the holder (cluster node id)
    pub owner: String,

    pub acquired_at: DateTime<Utc>,

    /// Point after which the lease may be reclaimed
    pub expires_at: DateTime<Utc>,

    /// Lease length in seconds
    pub lease_seconds: u64,

    pub status: LeaseStatus,

    /// Number of times this lease has been refreshed
    pub renewal_count: u32,
}

impl Lease {
    pub fn new(path: &str, owner: &str, lease_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4(),
            path: path.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + lease_duration(lease_seconds),
            lease_seconds,
            status: LeaseStatus::Active,
            renewal_count: 0,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LeaseStatus::Active && !self.is_expired_at(now)
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (now < self.expires_at).then(|| self.expires_at - now)
    }

    /// Push the expiry out by one lease length from `now`.
    pub fn renew(&mut self, now: DateTime<Utc>) {
        self.expires_at = now + lease_duration(self.lease_seconds);
        self.renewal_count += 1;
        self.status = LeaseStatus::Active;
    }

    pub fn mark_expired(&mut self) {
        self.status = LeaseStatus::Expired;
    }

    pub fn mark_released(&mut self) {
        self.status = LeaseStatus::Released;
    }
}

fn lease_duration(seconds: u64) -> Duration {
    Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX / 1000))
}

/// Lease-based locking on store paths.
///
/// Locks take effect immediately and are not part of any session.
pub trait LockManager: Send + Sync {
    /// Non-blocking acquire. A timed-out lease is reclaimed first; a live one
    /// fails with `AlreadyLocked`.
    fn try_lock(&self, path: &str, lease_seconds: u64, owner: &str) -> StoreResult<Lease>;

    /// Extend a held lease; fails with `LockLost` if the token no longer holds the lock.
    fn refresh_lease(&self, lease: &Lease) -> StoreResult<Lease>;

    /// Release a held lease; fails with `LockLost` if the token no longer holds the lock.
    fn unlock(&self, lease: &Lease) -> StoreResult<()>;

    fn is_locked(&self, path: &str) -> bool;

    fn get_lock(&self, path: &str) -> Option<Lease>;

    /// Reclaim a timed-out lease. Returns `true` if the path is no longer
    /// locked afterwards, `false` while the current lease is still live.
    fn expire_lock(&self, path: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry_window() {
        let now = Utc::now();
        let lease = Lease::new("/update", "node-a", 120, now);

        assert!(lease.is_valid_at(now + Duration::seconds(119)));
        assert!(lease.is_expired_at(now + Duration::seconds(120)));
        assert_eq!(
            lease.time_remaining(now + Duration::seconds(20)),
            Some(Duration::seconds(100))
        );
        assert_eq!(lease.time_remaining(now + Duration::seconds(130)), None);
    }

    #[test]
    fn test_lease_renewal() {
        let now = Utc::now();
        let mut lease = Lease::new("/update", "node-a", 120, now);
        lease.renew(now + Duration::seconds(60));

        assert_eq!(lease.renewal_count, 1);
        assert_eq!(lease.expires_at, now + Duration::seconds(180));
        assert_eq!(lease.status.to_string(), "active");
    }
}
