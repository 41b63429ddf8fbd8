//! Distributed semaphore acquisition over the backend's compare-and-swap.
//!
//! Acquires are linearizable per key: every mutation reads the current
//! record, rewrites the lease set and swaps it back, retrying on divergence
//! with jittered backoff.

use std::time::{Duration, SystemTime};

use rand::Rng;
use uuid::Uuid;

use appgate_common::errors::{Error, Result};
use appgate_common::semaphore::{
    AcquireSemaphoreRequest, SemaphoreLease, SemaphoreLeaseRef, SemaphoreV3,
};

use crate::backend::Item;
use crate::keyspace;
use crate::service::PresenceService;

/// How many times a semaphore mutation retries on contention.
pub const MAX_ATTEMPTS: usize = 6;

/// Base backoff; attempt `i` sleeps `jitter(BASE_BACKOFF * i)`.
pub const BASE_BACKOFF: Duration = Duration::from_millis(400);

/// Uniform jitter over `[d/2, d]`.
fn jitter(d: Duration) -> Duration {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return d;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

/// Selects semaphores for [`PresenceService::get_semaphores`].
#[derive(Debug, Clone, Default)]
pub struct SemaphoreFilter {
    /// Semaphore family; empty matches all.
    pub kind: String,
    /// Semaphore name; empty matches all within the family.
    pub name: String,
}

impl PresenceService {
    /// Acquire a lease, retrying CAS conflicts with backoff. A semaphore at
    /// capacity fails with `LimitExceeded`; exhausted retries do too.
    pub async fn acquire_semaphore(
        &self,
        req: &AcquireSemaphoreRequest,
    ) -> Result<SemaphoreLeaseRef> {
        req.check()?;
        if req.expires <= SystemTime::now() {
            return Err(Error::bad_parameter("semaphore lease expiry is in the past"));
        }
        let lease_id = Uuid::new_v4().to_string();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_acquire(req, &lease_id).await {
                Ok(lease) => return Ok(lease),
                Err(err) if err.is_compare_failed() || err.is_already_exists() => {
                    tracing::debug!(
                        kind = %req.kind,
                        name = %req.name,
                        attempt,
                        "semaphore acquire contended, retrying"
                    );
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(jitter(BASE_BACKOFF * attempt as u32)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::limit_exceeded(format!(
            "too many retries acquiring semaphore {}/{}",
            req.kind, req.name
        )))
    }

    async fn try_acquire(
        &self,
        req: &AcquireSemaphoreRequest,
        lease_id: &str,
    ) -> Result<SemaphoreLeaseRef> {
        let key = keyspace::semaphore_key(&req.kind, &req.name);
        let lease = SemaphoreLease {
            lease_id: lease_id.to_string(),
            holder: req.holder.clone(),
            expires: req.expires,
        };

        match self.backend().get(&key).await {
            Ok(existing) => {
                // Rewrite the current record with the expired leases dropped
                // and the new lease appended, then swap it in.
                let mut sem: SemaphoreV3 = Self::unmarshal(&existing)?;
                sem.remove_expired_leases(SystemTime::now());
                if sem.spec.leases.len() >= req.max_leases {
                    return Err(Error::limit_exceeded(format!(
                        "semaphore {}/{} is at capacity ({} leases)",
                        req.kind, req.name, req.max_leases
                    )));
                }
                sem.add_lease(lease)?;
                let expires = semaphore_expiry(&sem);
                let replace = Item::new(key, Self::marshal(&sem)?, expires);
                self.backend().compare_and_swap(existing, replace).await?;
            }
            Err(err) if err.is_not_found() => {
                // First holder initializes the record; a concurrent init
                // surfaces as AlreadyExists and is retried by the caller.
                let mut sem = SemaphoreV3::new(&req.kind, &req.name);
                sem.add_lease(lease)?;
                let expires = semaphore_expiry(&sem);
                let item = Item::new(key, Self::marshal(&sem)?, expires);
                self.backend().create(item).await?;
            }
            Err(err) => return Err(err),
        }

        Ok(SemaphoreLeaseRef {
            kind: req.kind.clone(),
            name: req.name.clone(),
            lease_id: lease_id.to_string(),
            expires: req.expires,
        })
    }

    /// Move a held lease's expiry forward.
    pub async fn keep_alive_semaphore_lease(&self, lease: &SemaphoreLeaseRef) -> Result<()> {
        self.mutate_semaphore(&lease.kind, &lease.name, |sem| {
            sem.refresh_lease(&lease.lease_id, lease.expires)
        })
        .await
    }

    /// Release a held lease.
    pub async fn cancel_semaphore_lease(&self, lease: &SemaphoreLeaseRef) -> Result<()> {
        self.mutate_semaphore(&lease.kind, &lease.name, |sem| {
            sem.remove_lease(&lease.lease_id)
        })
        .await
    }

    /// Read-modify-CAS a semaphore record with the standard retry policy.
    async fn mutate_semaphore<F>(&self, kind: &str, name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut SemaphoreV3) -> Result<()>,
    {
        let key = keyspace::semaphore_key(kind, name);
        for attempt in 1..=MAX_ATTEMPTS {
            let existing = self.backend().get(&key).await?;
            let mut sem: SemaphoreV3 = Self::unmarshal(&existing)?;
            sem.remove_expired_leases(SystemTime::now());
            mutate(&mut sem)?;
            let expires = semaphore_expiry(&sem);
            let replace = Item::new(key.clone(), Self::marshal(&sem)?, expires);
            match self.backend().compare_and_swap(existing, replace).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_compare_failed() => {
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(jitter(BASE_BACKOFF * attempt as u32)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::limit_exceeded(format!(
            "too many retries updating semaphore {kind}/{name}"
        )))
    }

    /// Semaphores matching the filter.
    pub async fn get_semaphores(&self, filter: &SemaphoreFilter) -> Result<Vec<SemaphoreV3>> {
        if !filter.kind.is_empty() && !filter.name.is_empty() {
            let key = keyspace::semaphore_key(&filter.kind, &filter.name);
            return match self.backend().get(&key).await {
                Ok(item) => Ok(vec![Self::unmarshal(&item)?]),
                Err(err) if err.is_not_found() => Ok(vec![]),
                Err(err) => Err(err),
            };
        }
        self.range_records(&keyspace::semaphores_prefix(&filter.kind))
            .await
    }

    /// Delete a semaphore record outright.
    pub async fn delete_semaphore(&self, kind: &str, name: &str) -> Result<()> {
        if kind.is_empty() || name.is_empty() {
            return Err(Error::bad_parameter("semaphore kind and name are required"));
        }
        self.backend()
            .delete(&keyspace::semaphore_key(kind, name))
            .await
    }
}

/// A semaphore record lives as long as its longest lease.
fn semaphore_expiry(sem: &SemaphoreV3) -> Option<SystemTime> {
    sem.spec.leases.iter().map(|l| l.expires).max()
}
