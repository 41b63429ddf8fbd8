//! Keep-alive messages refreshing heartbeated records.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// The kinds of records a keep-alive can refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveKind {
    /// SSH node heartbeat.
    Node,
    /// Application server heartbeat.
    App,
    /// Database server heartbeat.
    Database,
    /// Kubernetes server heartbeat.
    Kube,
    /// Windows desktop service heartbeat.
    WindowsDesktop,
}

/// A TTL-refresh message, identified by the lease id returned on the initial
/// upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAlive {
    /// Which record family the lease belongs to.
    pub kind: KeepAliveKind,
    /// Backend lease id from the initial upsert.
    pub lease_id: i64,
    /// Name of the record being refreshed.
    pub name: String,
    /// Namespace of the record being refreshed.
    pub namespace: String,
    /// Advertising host, for kinds keyed by host id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_id: String,
    /// The new expiry.
    pub expires: SystemTime,
}

impl KeepAlive {
    /// Validate the keep-alive before dispatch.
    pub fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::bad_parameter("keep-alive is missing a name"));
        }
        if self.lease_id == 0 {
            return Err(Error::bad_parameter("keep-alive is missing a lease id"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn check_rejects_missing_fields() {
        let ka = KeepAlive {
            kind: KeepAliveKind::App,
            lease_id: 0,
            name: "web".to_string(),
            namespace: "default".to_string(),
            host_id: "h1".to_string(),
            expires: SystemTime::now() + Duration::from_secs(60),
        };
        assert!(ka.check().unwrap_err().is_bad_parameter());

        let ka = KeepAlive { lease_id: 7, ..ka };
        assert!(ka.check().is_ok());
    }
}
