//! Heartbeated server records and the other presence-store citizens.
//!
//! A "server" here is a live advertisement that a specific host provides a
//! specific resource: an application, a database, a kubernetes cluster, an
//! SSH node or a windows desktop service. The records are created on first
//! upsert, refreshed by keep-alives and forgotten by the store after their
//! TTL elapses.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::app::AppV3;
use crate::errors::{Error, Result};
use crate::labels::{combine_labels, CommandLabel};
use crate::resource::{Kind, Metadata, Resource, ResourceWithLabels};
use crate::utils::deduplicate_by;

/// Certificate-authority rotation state carried by heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotation {
    /// Rotation state, e.g. `in_progress`; empty when idle.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// Rotation phase within the state.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
}

// === Application servers ===

/// The specification of an [`AppServerV3`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppServerSpecV3 {
    /// Id of the advertising host.
    pub host_id: String,
    /// Hostname of the advertising host.
    pub hostname: String,
    /// CA rotation state of the host.
    #[serde(default)]
    pub rotation: Rotation,
    /// Proxies this host is connected through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_ids: Vec<String>,
    /// Agent version string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// The application this host proxies.
    pub app: AppV3,
}

/// A live, heartbeated binding of a host to an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppServerV3 {
    /// Wire kind, always `app_server`.
    pub kind: Kind,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata; the name equals the application name.
    pub metadata: Metadata,
    /// Server specification.
    pub spec: AppServerSpecV3,
}

impl AppServerV3 {
    /// Build a new app server, validating and filling defaults.
    pub fn new(metadata: Metadata, spec: AppServerSpecV3) -> Result<Self> {
        let mut server = Self {
            kind: Kind::AppServer,
            version: crate::app::V3.to_string(),
            metadata,
            spec,
        };
        server.check_and_set_defaults()?;
        Ok(server)
    }

    /// Validate the record and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::AppServer;
        if self.version.is_empty() {
            self.version = crate::app::V3.to_string();
        }
        self.metadata.check_and_set_defaults()?;
        if self.spec.host_id.is_empty() {
            return Err(Error::bad_parameter(format!(
                "app server {:?} is missing a host id",
                self.metadata.name
            )));
        }
        self.spec.app.check_and_set_defaults()?;
        Ok(())
    }

    /// The dedup key used by unified listings: `(name, public_addr, host_id)`.
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.metadata.name.clone(),
            self.spec.app.spec.public_addr.clone(),
            self.spec.host_id.clone(),
        )
    }
}

impl Resource for AppServerV3 {
    fn kind(&self) -> Kind {
        Kind::AppServer
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

impl ResourceWithLabels for AppServerV3 {
    fn all_labels(&self) -> BTreeMap<String, String> {
        self.spec.app.all_labels()
    }

    fn search_fields(&self) -> Vec<String> {
        vec![
            self.metadata.name.clone(),
            self.spec.app.metadata.description.clone(),
            self.spec.app.spec.public_addr.clone(),
            self.spec.hostname.clone(),
        ]
    }

    fn pagination_key(&self) -> String {
        format!("{}/{}", self.spec.host_id, self.metadata.name)
    }
}

// === Nodes ===

/// The specification of a [`ServerV2`] node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSpecV2 {
    /// Network address of the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
    /// Hostname reported by the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Labels computed by periodically running commands.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cmd_labels: BTreeMap<String, CommandLabel>,
    /// CA rotation state of the node.
    #[serde(default)]
    pub rotation: Rotation,
    /// Proxies this node is connected through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_ids: Vec<String>,
}

/// An SSH node record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerV2 {
    /// Wire kind, always `node`.
    pub kind: Kind,
    /// Schema version, always `v2`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Node specification.
    pub spec: ServerSpecV2,
}

impl ServerV2 {
    /// Build a new node record.
    pub fn new(metadata: Metadata, spec: ServerSpecV2) -> Result<Self> {
        let mut server = Self {
            kind: Kind::Node,
            version: "v2".to_string(),
            metadata,
            spec,
        };
        server.check_and_set_defaults()?;
        Ok(server)
    }

    /// Validate the record and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::Node;
        if self.version.is_empty() {
            self.version = "v2".to_string();
        }
        self.metadata.check_and_set_defaults()
    }
}

impl Resource for ServerV2 {
    fn kind(&self) -> Kind {
        Kind::Node
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

impl ResourceWithLabels for ServerV2 {
    fn all_labels(&self) -> BTreeMap<String, String> {
        combine_labels(&self.metadata.labels, &self.spec.cmd_labels)
    }

    fn search_fields(&self) -> Vec<String> {
        vec![
            self.metadata.name.clone(),
            self.spec.hostname.clone(),
            self.spec.addr.clone(),
        ]
    }
}

// === Database servers ===

/// A database known to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseV3 {
    /// Wire kind, always `db`.
    pub kind: String,
    /// Schema version.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Database specification.
    pub spec: DatabaseSpecV3,
}

/// The specification of a [`DatabaseV3`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSpecV3 {
    /// Wire protocol, e.g. `postgres`.
    pub protocol: String,
    /// Address the database runs at.
    pub uri: String,
}

/// The specification of a [`DatabaseServerV3`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseServerSpecV3 {
    /// Id of the advertising host.
    pub host_id: String,
    /// Hostname of the advertising host.
    pub hostname: String,
    /// CA rotation state of the host.
    #[serde(default)]
    pub rotation: Rotation,
    /// Proxies this host is connected through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_ids: Vec<String>,
    /// The database this host proxies.
    pub database: DatabaseV3,
}

/// A live, heartbeated binding of a host to a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseServerV3 {
    /// Wire kind, always `db_server`.
    pub kind: Kind,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Server specification.
    pub spec: DatabaseServerSpecV3,
}

impl DatabaseServerV3 {
    /// Build a new database server record.
    pub fn new(metadata: Metadata, spec: DatabaseServerSpecV3) -> Result<Self> {
        let mut server = Self {
            kind: Kind::DatabaseServer,
            version: "v3".to_string(),
            metadata,
            spec,
        };
        server.check_and_set_defaults()?;
        Ok(server)
    }

    /// Validate the record and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::DatabaseServer;
        if self.version.is_empty() {
            self.version = "v3".to_string();
        }
        self.metadata.check_and_set_defaults()?;
        if self.spec.host_id.is_empty() {
            return Err(Error::bad_parameter(format!(
                "database server {:?} is missing a host id",
                self.metadata.name
            )));
        }
        Ok(())
    }
}

impl Resource for DatabaseServerV3 {
    fn kind(&self) -> Kind {
        Kind::DatabaseServer
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

impl ResourceWithLabels for DatabaseServerV3 {
    fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.metadata.labels.clone();
        labels.extend(self.spec.database.metadata.labels.clone());
        labels
    }

    fn search_fields(&self) -> Vec<String> {
        vec![
            self.metadata.name.clone(),
            self.spec.database.metadata.description.clone(),
            self.spec.database.spec.protocol.clone(),
            self.spec.database.spec.uri.clone(),
            self.spec.hostname.clone(),
        ]
    }

    fn pagination_key(&self) -> String {
        format!("{}/{}", self.spec.host_id, self.metadata.name)
    }
}

// === Kube servers ===

/// A kubernetes cluster known to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeClusterV3 {
    /// Wire kind, always `kube_cluster`.
    pub kind: String,
    /// Schema version.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
}

/// The specification of a [`KubeServerV3`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeServerSpecV3 {
    /// Id of the advertising host.
    pub host_id: String,
    /// Hostname of the advertising host.
    pub hostname: String,
    /// CA rotation state of the host.
    #[serde(default)]
    pub rotation: Rotation,
    /// Proxies this host is connected through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_ids: Vec<String>,
    /// The kubernetes cluster this host serves.
    pub cluster: KubeClusterV3,
}

/// A live, heartbeated binding of a host to a kubernetes cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeServerV3 {
    /// Wire kind, always `kube_server`.
    pub kind: Kind,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Server specification.
    pub spec: KubeServerSpecV3,
}

impl KubeServerV3 {
    /// Build a new kube server record.
    pub fn new(metadata: Metadata, spec: KubeServerSpecV3) -> Result<Self> {
        let mut server = Self {
            kind: Kind::KubeServer,
            version: "v3".to_string(),
            metadata,
            spec,
        };
        server.check_and_set_defaults()?;
        Ok(server)
    }

    /// Validate the record and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::KubeServer;
        if self.version.is_empty() {
            self.version = "v3".to_string();
        }
        self.metadata.check_and_set_defaults()?;
        if self.spec.host_id.is_empty() {
            return Err(Error::bad_parameter(format!(
                "kube server {:?} is missing a host id",
                self.metadata.name
            )));
        }
        Ok(())
    }
}

impl Resource for KubeServerV3 {
    fn kind(&self) -> Kind {
        Kind::KubeServer
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

impl ResourceWithLabels for KubeServerV3 {
    fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.metadata.labels.clone();
        labels.extend(self.spec.cluster.metadata.labels.clone());
        labels
    }

    fn search_fields(&self) -> Vec<String> {
        vec![self.metadata.name.clone(), self.spec.hostname.clone()]
    }

    fn pagination_key(&self) -> String {
        format!("{}/{}", self.spec.host_id, self.metadata.name)
    }
}

// === Windows desktop services ===

/// The specification of a [`WindowsDesktopServiceV3`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowsDesktopServiceSpecV3 {
    /// Network address of the service.
    pub addr: String,
    /// Agent version string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// A windows desktop service record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowsDesktopServiceV3 {
    /// Wire kind, always `windows_desktop_service`.
    pub kind: Kind,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Service specification.
    pub spec: WindowsDesktopServiceSpecV3,
}

impl WindowsDesktopServiceV3 {
    /// Build a new desktop service record.
    pub fn new(metadata: Metadata, spec: WindowsDesktopServiceSpecV3) -> Result<Self> {
        let mut server = Self {
            kind: Kind::WindowsDesktopService,
            version: "v3".to_string(),
            metadata,
            spec,
        };
        server.check_and_set_defaults()?;
        Ok(server)
    }

    /// Validate the record and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::WindowsDesktopService;
        if self.version.is_empty() {
            self.version = "v3".to_string();
        }
        self.metadata.check_and_set_defaults()?;
        if self.spec.addr.is_empty() {
            return Err(Error::bad_parameter(format!(
                "windows desktop service {:?} is missing an addr",
                self.metadata.name
            )));
        }
        Ok(())
    }
}

impl Resource for WindowsDesktopServiceV3 {
    fn kind(&self) -> Kind {
        Kind::WindowsDesktopService
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

impl ResourceWithLabels for WindowsDesktopServiceV3 {
    fn search_fields(&self) -> Vec<String> {
        vec![self.metadata.name.clone(), self.spec.addr.clone()]
    }
}

/// Remove duplicate desktop services keyed by name, preserving first-seen
/// order.
pub fn deduplicate_desktop_services(
    services: Vec<WindowsDesktopServiceV3>,
) -> Vec<WindowsDesktopServiceV3> {
    deduplicate_by(services, |svc| svc.metadata.name.clone())
}

// === Tunnel connections, remote clusters, reverse tunnels, trusted clusters ===

/// The specification of a [`TunnelConnectionV2`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConnectionSpecV2 {
    /// Name of the cluster the tunnel belongs to.
    pub cluster_name: String,
    /// Name of the proxy terminating the tunnel.
    pub proxy_name: String,
    /// Last heartbeat observed over the tunnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<SystemTime>,
}

/// A reverse-tunnel connection advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConnectionV2 {
    /// Wire kind, always `tunnel_connection`.
    pub kind: Kind,
    /// Schema version, always `v2`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Connection specification.
    pub spec: TunnelConnectionSpecV2,
}

impl TunnelConnectionV2 {
    /// Build a new tunnel connection record.
    pub fn new(metadata: Metadata, spec: TunnelConnectionSpecV2) -> Result<Self> {
        let mut conn = Self {
            kind: Kind::TunnelConnection,
            version: "v2".to_string(),
            metadata,
            spec,
        };
        conn.metadata.check_and_set_defaults()?;
        if conn.spec.cluster_name.is_empty() {
            return Err(Error::bad_parameter(
                "tunnel connection is missing a cluster name",
            ));
        }
        Ok(conn)
    }
}

impl Resource for TunnelConnectionV2 {
    fn kind(&self) -> Kind {
        Kind::TunnelConnection
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

/// The specification of a [`ReverseTunnelV2`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReverseTunnelSpecV2 {
    /// Name of the cluster the tunnel reaches.
    pub cluster_name: String,
    /// Addresses to dial to reach the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dial_addrs: Vec<String>,
}

/// A reverse tunnel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseTunnelV2 {
    /// Wire kind, always `reverse_tunnel`.
    pub kind: Kind,
    /// Schema version, always `v2`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Tunnel specification.
    pub spec: ReverseTunnelSpecV2,
}

impl ReverseTunnelV2 {
    /// Build a new reverse tunnel record.
    pub fn new(metadata: Metadata, spec: ReverseTunnelSpecV2) -> Result<Self> {
        let mut tunnel = Self {
            kind: Kind::ReverseTunnel,
            version: "v2".to_string(),
            metadata,
            spec,
        };
        tunnel.metadata.check_and_set_defaults()?;
        Ok(tunnel)
    }
}

impl Resource for ReverseTunnelV2 {
    fn kind(&self) -> Kind {
        Kind::ReverseTunnel
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

/// Connection status of a [`RemoteClusterV3`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteClusterStatusV3 {
    /// `online` or `offline`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection: String,
    /// Last heartbeat received from the remote cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<SystemTime>,
}

/// A remote (leaf) cluster record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteClusterV3 {
    /// Wire kind, always `remote_cluster`.
    pub kind: Kind,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Connection status.
    #[serde(default)]
    pub status: RemoteClusterStatusV3,
}

impl RemoteClusterV3 {
    /// Build a new remote cluster record.
    pub fn new(metadata: Metadata) -> Result<Self> {
        let mut cluster = Self {
            kind: Kind::RemoteCluster,
            version: "v3".to_string(),
            metadata,
            status: RemoteClusterStatusV3::default(),
        };
        cluster.metadata.check_and_set_defaults()?;
        Ok(cluster)
    }
}

impl Resource for RemoteClusterV3 {
    fn kind(&self) -> Kind {
        Kind::RemoteCluster
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

/// The specification of a [`TrustedClusterV2`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustedClusterSpecV2 {
    /// Whether the trust relationship is active.
    #[serde(default)]
    pub enabled: bool,
    /// Join token presented to the root cluster.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Address of the root cluster proxy.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_address: String,
    /// Address of the root cluster reverse-tunnel listener.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reverse_tunnel_address: String,
}

/// A trusted cluster definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedClusterV2 {
    /// Wire kind, always `trusted_cluster`.
    pub kind: Kind,
    /// Schema version, always `v2`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Trust specification.
    pub spec: TrustedClusterSpecV2,
}

impl TrustedClusterV2 {
    /// Build a new trusted cluster record.
    pub fn new(metadata: Metadata, spec: TrustedClusterSpecV2) -> Result<Self> {
        let mut cluster = Self {
            kind: Kind::TrustedCluster,
            version: "v2".to_string(),
            metadata,
            spec,
        };
        cluster.metadata.check_and_set_defaults()?;
        Ok(cluster)
    }
}

impl Resource for TrustedClusterV2 {
    fn kind(&self) -> Kind {
        Kind::TrustedCluster
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
    use crate::app::AppSpecV3;

    fn test_app(name: &str) -> AppV3 {
        AppV3::new(
            Metadata {
                name: name.to_string(),
                ..Default::default()
            },
            AppSpecV3 {
                uri: "http://backend:8080".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn app_server_requires_host_id() {
        let err = AppServerV3::new(
            Metadata {
                name: "web".to_string(),
                ..Default::default()
            },
            AppServerSpecV3 {
                host_id: String::new(),
                hostname: "host-1".to_string(),
                rotation: Rotation::default(),
                proxy_ids: vec![],
                version: String::new(),
                app: test_app("web"),
            },
        )
        .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[test]
    fn app_server_pagination_key_includes_host() {
        let server = AppServerV3::new(
            Metadata {
                name: "web".to_string(),
                ..Default::default()
            },
            AppServerSpecV3 {
                host_id: "h1".to_string(),
                hostname: "host-1".to_string(),
                rotation: Rotation::default(),
                proxy_ids: vec![],
                version: String::new(),
                app: test_app("web"),
            },
        )
        .unwrap();
        assert_eq!(server.pagination_key(), "h1/web");
    }

    #[test]
    fn desktop_dedup_by_name() {
        let mk = |name: &str, addr: &str| {
            WindowsDesktopServiceV3::new(
                Metadata {
                    name: name.to_string(),
                    ..Default::default()
                },
                WindowsDesktopServiceSpecV3 {
                    addr: addr.to_string(),
                    version: String::new(),
                },
            )
            .unwrap()
        };
        let out = deduplicate_desktop_services(vec![
            mk("a", "10.0.0.1:3389"),
            mk("a", "10.0.0.2:3389"),
            mk("b", "10.0.0.3:3389"),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].spec.addr, "10.0.0.1:3389");
    }

    #[test]
    fn record_serde_round_trip() {
        let server = AppServerV3::new(
            Metadata {
                name: "web".to_string(),
                ..Default::default()
            },
            AppServerSpecV3 {
                host_id: "h1".to_string(),
                hostname: "host-1".to_string(),
                rotation: Rotation::default(),
                proxy_ids: vec!["p1".to_string()],
                version: "1.0.0".to_string(),
                app: test_app("web"),
            },
        )
        .unwrap();
        let json = serde_json::to_vec(&server).unwrap();
        let parsed: AppServerV3 = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, server);
    }
}
