//! Distributed semaphore records.
//!
//! A semaphore is a named multi-lease counter used for admission control.
//! The acquisition algorithm lives with the presence service; this module
//! holds the stored record and its lease arithmetic.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::resource::{Kind, Metadata, Resource};

/// A single lease on a semaphore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreLease {
    /// Unique lease id.
    pub lease_id: String,
    /// Who holds the lease.
    pub holder: String,
    /// When the lease expires.
    pub expires: SystemTime,
}

/// The specification of a [`SemaphoreV3`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreSpecV3 {
    /// Active and expired leases; expired leases are pruned on access.
    #[serde(default)]
    pub leases: Vec<SemaphoreLease>,
}

/// A distributed semaphore record. The metadata name is the semaphore name;
/// the sub-kind (e.g. `connection`) is carried in `sub_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreV3 {
    /// Wire kind, always `semaphore`.
    pub kind: Kind,
    /// The semaphore family, e.g. `connection`.
    pub sub_kind: String,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Lease state.
    pub spec: SemaphoreSpecV3,
}

/// Parameters for acquiring a semaphore lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireSemaphoreRequest {
    /// Semaphore family.
    pub kind: String,
    /// Semaphore name.
    pub name: String,
    /// Maximum number of concurrently held leases.
    pub max_leases: usize,
    /// Who is asking.
    pub holder: String,
    /// Requested lease expiry.
    pub expires: SystemTime,
}

impl AcquireSemaphoreRequest {
    /// Validate the request.
    pub fn check(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::bad_parameter("semaphore kind is missing"));
        }
        if self.name.is_empty() {
            return Err(Error::bad_parameter("semaphore name is missing"));
        }
        if self.holder.is_empty() {
            return Err(Error::bad_parameter("semaphore holder is missing"));
        }
        Ok(())
    }
}

/// Identifies a lease for keep-alive and cancel operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreLeaseRef {
    /// Semaphore family.
    pub kind: String,
    /// Semaphore name.
    pub name: String,
    /// The lease id being refreshed or released.
    pub lease_id: String,
    /// New expiry, for keep-alives.
    pub expires: SystemTime,
}

impl SemaphoreV3 {
    /// Build an empty semaphore for `kind/name`.
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: Kind::Semaphore,
            sub_kind: kind.to_string(),
            version: "v3".to_string(),
            metadata: Metadata {
                name: name.to_string(),
                ..Default::default()
            },
            spec: SemaphoreSpecV3::default(),
        }
    }

    /// Drop all leases that expired at or before `now`.
    pub fn remove_expired_leases(&mut self, now: SystemTime) {
        self.spec.leases.retain(|lease| lease.expires > now);
    }

    /// The number of leases that are still live at `now`.
    pub fn active_lease_count(&self, now: SystemTime) -> usize {
        self.spec
            .leases
            .iter()
            .filter(|lease| lease.expires > now)
            .count()
    }

    /// Append a lease.
    ///
    /// Fails with `AlreadyExists` when the lease id is already present.
    pub fn add_lease(&mut self, lease: SemaphoreLease) -> Result<()> {
        if self.spec.leases.iter().any(|l| l.lease_id == lease.lease_id) {
            return Err(Error::already_exists(format!(
                "lease {} already present on semaphore {}/{}",
                lease.lease_id, self.sub_kind, self.metadata.name
            )));
        }
        self.spec.leases.push(lease);
        Ok(())
    }

    /// Update the expiry of an existing lease.
    pub fn refresh_lease(&mut self, lease_id: &str, expires: SystemTime) -> Result<()> {
        match self
            .spec
            .leases
            .iter_mut()
            .find(|l| l.lease_id == lease_id)
        {
            Some(lease) => {
                lease.expires = expires;
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "lease {lease_id} not found on semaphore {}/{}",
                self.sub_kind, self.metadata.name
            ))),
        }
    }

    /// Remove a lease by id.
    pub fn remove_lease(&mut self, lease_id: &str) -> Result<()> {
        let before = self.spec.leases.len();
        self.spec.leases.retain(|l| l.lease_id != lease_id);
        if self.spec.leases.len() == before {
            return Err(Error::not_found(format!(
                "lease {lease_id} not found on semaphore {}/{}",
                self.sub_kind, self.metadata.name
            )));
        }
        Ok(())
    }
}

impl Resource for SemaphoreV3 {
    fn kind(&self) -> Kind {
        Kind::Semaphore
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lease(id: &str, expires_in: Duration) -> SemaphoreLease {
        SemaphoreLease {
            lease_id: id.to_string(),
            holder: "holder".to_string(),
            expires: SystemTime::now() + expires_in,
        }
    }

    #[test]
    fn expired_leases_are_pruned() {
        let mut sem = SemaphoreV3::new("connection", "alice");
        sem.add_lease(lease("live", Duration::from_secs(60))).unwrap();
        sem.spec.leases.push(SemaphoreLease {
            lease_id: "dead".to_string(),
            holder: "holder".to_string(),
            expires: SystemTime::now() - Duration::from_secs(1),
        });

        assert_eq!(sem.active_lease_count(SystemTime::now()), 1);
        sem.remove_expired_leases(SystemTime::now());
        assert_eq!(sem.spec.leases.len(), 1);
        assert_eq!(sem.spec.leases[0].lease_id, "live");
    }

    #[test]
    fn duplicate_lease_id_is_rejected() {
        let mut sem = SemaphoreV3::new("connection", "alice");
        sem.add_lease(lease("a", Duration::from_secs(60))).unwrap();
        let err = sem.add_lease(lease("a", Duration::from_secs(60))).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn refresh_and_remove() {
        let mut sem = SemaphoreV3::new("connection", "alice");
        sem.add_lease(lease("a", Duration::from_secs(1))).unwrap();

        let later = SystemTime::now() + Duration::from_secs(120);
        sem.refresh_lease("a", later).unwrap();
        assert_eq!(sem.spec.leases[0].expires, later);

        assert!(sem.refresh_lease("missing", later).unwrap_err().is_not_found());
        sem.remove_lease("a").unwrap();
        assert!(sem.remove_lease("a").unwrap_err().is_not_found());
    }

    #[test]
    fn acquire_request_validation() {
        let req = AcquireSemaphoreRequest {
            kind: "connection".to_string(),
            name: String::new(),
            max_leases: 5,
            holder: "h".to_string(),
            expires: SystemTime::now(),
        };
        assert!(req.check().unwrap_err().is_bad_parameter());
    }
}
