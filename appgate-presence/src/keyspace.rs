//! The fixed key layout of the presence store. The layout is part of the
//! external contract: storage drivers and migration tooling depend on it.

use crate::backend::Key;

/// `/appServers/<namespace>/<host_id>/<name>`
pub const APP_SERVERS_PREFIX: &str = "appServers";
/// `/databaseServers/<namespace>/<host_id>/<name>`
pub const DB_SERVERS_PREFIX: &str = "databaseServers";
/// `/kubeServers/<host_id>/<name>`
pub const KUBE_SERVERS_PREFIX: &str = "kubeServers";
/// `/nodes/<namespace>/<name>`
pub const NODES_PREFIX: &str = "nodes";
/// `/windowsDesktopServices/<name>`
pub const WINDOWS_DESKTOP_SERVICES_PREFIX: &str = "windowsDesktopServices";
/// `/apps/<name>`, the dynamically registered applications.
pub const APPS_PREFIX: &str = "apps";
/// `/semaphores/<kind>/<name>`
pub const SEMAPHORES_PREFIX: &str = "semaphores";
/// `/trustedclusters/<name>`
pub const TRUSTED_CLUSTERS_PREFIX: &str = "trustedclusters";
/// `/tunnelConnections/<cluster>/<name>`
pub const TUNNEL_CONNECTIONS_PREFIX: &str = "tunnelConnections";
/// `/remoteClusters/<name>`
pub const REMOTE_CLUSTERS_PREFIX: &str = "remoteClusters";
/// `/reverseTunnels/<name>`
pub const REVERSE_TUNNELS_PREFIX: &str = "reverseTunnels";
/// `/hostuser_interaction_time/<name>`
pub const HOST_USER_INTERACTION_PREFIX: &str = "hostuser_interaction_time";

/// Key of one app server record.
pub fn app_server_key(namespace: &str, host_id: &str, name: &str) -> Key {
    Key::new(&[APP_SERVERS_PREFIX, namespace, host_id, name])
}

/// Prefix of all app servers in a namespace.
pub fn app_servers_prefix(namespace: &str) -> Key {
    Key::new(&[APP_SERVERS_PREFIX, namespace])
}

/// Key of one database server record.
pub fn db_server_key(namespace: &str, host_id: &str, name: &str) -> Key {
    Key::new(&[DB_SERVERS_PREFIX, namespace, host_id, name])
}

/// Prefix of all database servers in a namespace.
pub fn db_servers_prefix(namespace: &str) -> Key {
    Key::new(&[DB_SERVERS_PREFIX, namespace])
}

/// Key of one kube server record.
pub fn kube_server_key(host_id: &str, name: &str) -> Key {
    Key::new(&[KUBE_SERVERS_PREFIX, host_id, name])
}

/// Prefix of all kube servers.
pub fn kube_servers_prefix() -> Key {
    Key::new(&[KUBE_SERVERS_PREFIX])
}

/// Key of one node record.
pub fn node_key(namespace: &str, name: &str) -> Key {
    Key::new(&[NODES_PREFIX, namespace, name])
}

/// Prefix of all nodes in a namespace.
pub fn nodes_prefix(namespace: &str) -> Key {
    Key::new(&[NODES_PREFIX, namespace])
}

/// Key of one windows desktop service record.
pub fn windows_desktop_service_key(name: &str) -> Key {
    Key::new(&[WINDOWS_DESKTOP_SERVICES_PREFIX, name])
}

/// Prefix of all windows desktop services.
pub fn windows_desktop_services_prefix() -> Key {
    Key::new(&[WINDOWS_DESKTOP_SERVICES_PREFIX])
}

/// Key of one dynamically registered application.
pub fn app_key(name: &str) -> Key {
    Key::new(&[APPS_PREFIX, name])
}

/// Prefix of all dynamically registered applications.
pub fn apps_prefix() -> Key {
    Key::new(&[APPS_PREFIX])
}

/// Key of one semaphore.
pub fn semaphore_key(kind: &str, name: &str) -> Key {
    Key::new(&[SEMAPHORES_PREFIX, kind, name])
}

/// Prefix of all semaphores of a kind, or of all semaphores when empty.
pub fn semaphores_prefix(kind: &str) -> Key {
    if kind.is_empty() {
        Key::new(&[SEMAPHORES_PREFIX])
    } else {
        Key::new(&[SEMAPHORES_PREFIX, kind])
    }
}

/// Key of one trusted cluster.
pub fn trusted_cluster_key(name: &str) -> Key {
    Key::new(&[TRUSTED_CLUSTERS_PREFIX, name])
}

/// Prefix of all trusted clusters.
pub fn trusted_clusters_prefix() -> Key {
    Key::new(&[TRUSTED_CLUSTERS_PREFIX])
}

/// Key of one tunnel connection.
pub fn tunnel_connection_key(cluster: &str, name: &str) -> Key {
    Key::new(&[TUNNEL_CONNECTIONS_PREFIX, cluster, name])
}

/// Prefix of one cluster's tunnel connections, or of all when empty.
pub fn tunnel_connections_prefix(cluster: &str) -> Key {
    if cluster.is_empty() {
        Key::new(&[TUNNEL_CONNECTIONS_PREFIX])
    } else {
        Key::new(&[TUNNEL_CONNECTIONS_PREFIX, cluster])
    }
}

/// Key of one remote cluster.
pub fn remote_cluster_key(name: &str) -> Key {
    Key::new(&[REMOTE_CLUSTERS_PREFIX, name])
}

/// Prefix of all remote clusters.
pub fn remote_clusters_prefix() -> Key {
    Key::new(&[REMOTE_CLUSTERS_PREFIX])
}

/// Key of one reverse tunnel.
pub fn reverse_tunnel_key(name: &str) -> Key {
    Key::new(&[REVERSE_TUNNELS_PREFIX, name])
}

/// Prefix of all reverse tunnels.
pub fn reverse_tunnels_prefix() -> Key {
    Key::new(&[REVERSE_TUNNELS_PREFIX])
}

/// Key of one host-user interaction timestamp.
pub fn host_user_interaction_key(name: &str) -> Key {
    Key::new(&[HOST_USER_INTERACTION_PREFIX, name])
}
