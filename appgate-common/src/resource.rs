//! The tagged, versioned resource model.
//!
//! Every record stored in the presence backend carries the same envelope:
//! a kind, a schema version, metadata (name, namespace, labels, expiry) and
//! a monotonic resource id used for compare-and-swap.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// The namespace resources land in when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource kinds known to the presence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// A proxied application record.
    App,
    /// A heartbeated binding of a host to an application.
    AppServer,
    /// A heartbeated binding of a host to a database.
    DatabaseServer,
    /// A heartbeated binding of a host to a kubernetes cluster.
    KubeServer,
    /// An SSH node.
    Node,
    /// A windows desktop service.
    WindowsDesktopService,
    /// A reverse-tunnel connection advertisement.
    TunnelConnection,
    /// A remote (leaf) cluster.
    RemoteCluster,
    /// A reverse tunnel definition.
    ReverseTunnel,
    /// A trusted cluster definition.
    TrustedCluster,
    /// A distributed semaphore.
    Semaphore,
    /// An RBAC role.
    Role,
}

impl Kind {
    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::App => "app",
            Kind::AppServer => "app_server",
            Kind::DatabaseServer => "db_server",
            Kind::KubeServer => "kube_server",
            Kind::Node => "node",
            Kind::WindowsDesktopService => "windows_desktop_service",
            Kind::TunnelConnection => "tunnel_connection",
            Kind::RemoteCluster => "remote_cluster",
            Kind::ReverseTunnel => "reverse_tunnel",
            Kind::TrustedCluster => "trusted_cluster",
            Kind::Semaphore => "semaphore",
            Kind::Role => "role",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Metadata common to every resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Resource name, unique per kind within a cluster.
    pub name: String,
    /// Namespace the resource lives in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Static labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// When the backend may forget this resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<SystemTime>,
    /// Monotonic id assigned by the backend, used for CAS.
    #[serde(default)]
    pub resource_id: i64,
}

impl Metadata {
    /// Validate the metadata and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::bad_parameter("missing resource name"));
        }
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        for key in self.labels.keys() {
            if !is_valid_label_key(key) {
                return Err(Error::bad_parameter(format!("invalid label key {key:?}")));
            }
        }
        Ok(())
    }
}

/// True if `key` matches `^[A-Za-z0-9_./:*-]+$`.
pub fn is_valid_label_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '*' | '-'))
}

/// Behavior shared by every stored record.
pub trait Resource {
    /// The kind of this resource.
    fn kind(&self) -> Kind;

    /// The schema version, e.g. `v3`.
    fn version(&self) -> &str;

    /// Shared metadata.
    fn metadata(&self) -> &Metadata;

    /// Mutable access to the shared metadata.
    fn metadata_mut(&mut self) -> &mut Metadata;

    /// The resource name.
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// When the backend may forget this resource.
    fn expiry(&self) -> Option<SystemTime> {
        self.metadata().expires
    }

    /// Set the resource expiry.
    fn set_expiry(&mut self, expires: Option<SystemTime>) {
        self.metadata_mut().expires = expires;
    }

    /// The backend-assigned monotonic id.
    fn resource_id(&self) -> i64 {
        self.metadata().resource_id
    }

    /// Record the backend-assigned monotonic id.
    fn set_resource_id(&mut self, id: i64) {
        self.metadata_mut().resource_id = id;
    }
}

/// Resources that can be filtered, searched and paginated.
pub trait ResourceWithLabels: Resource {
    /// The combined view of static and dynamic labels.
    fn all_labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone()
    }

    /// The field values a search matches against, kind-specific.
    fn search_fields(&self) -> Vec<String>;

    /// True iff every search value is a case-folded substring of some field.
    fn match_search(&self, values: &[String]) -> bool {
        if values.is_empty() {
            return true;
        }
        let mut fields = self.search_fields();
        for (k, v) in self.all_labels() {
            fields.push(k);
            fields.push(v);
        }
        crate::utils::match_search(&fields, values)
    }

    /// The opaque token the store hands out to resume listing after this
    /// resource.
    fn pagination_key(&self) -> String {
        self.name().to_string()
    }
}

/// A requested sort order for a unified listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    /// Field to sort by; empty means no sort.
    pub field: String,
    /// Descending instead of ascending.
    pub is_desc: bool,
}

impl SortBy {
    /// True if no sort was requested.
    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }
}

/// Sort field: the resource name.
pub const SORT_FIELD_NAME: &str = "name";
/// Sort field: the resource description.
pub const SORT_FIELD_DESCRIPTION: &str = "description";
/// Sort field: the hostname of the advertising host.
pub const SORT_FIELD_HOSTNAME: &str = "hostname";
/// Sort field: the published address.
pub const SORT_FIELD_ADDRESS: &str = "address";

/// Order two field values honoring the requested direction.
pub fn order(a: &str, b: &str, is_desc: bool) -> std::cmp::Ordering {
    if is_desc {
        b.cmp(a)
    } else {
        a.cmp(b)
    }
}
