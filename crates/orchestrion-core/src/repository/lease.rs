//! Named, time-bounded leases shared between engine nodes.

use chrono::{DateTime, Utc};
use orchestrion_types::error::RepositoryError;

pub trait LeaseRepository: Send + Sync {
    /// Take `name` for `owner` until `until`. Succeeds when the lease is
    /// free, expired at `now`, or already held by `owner`.
    fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Release `name` if `owner` holds it.
    fn release_lease(
        &self,
        name: &str,
        owner: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
