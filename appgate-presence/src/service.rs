//! The presence service: heartbeated registration, per-kind CRUD and
//! keep-alive dispatch over the [`Backend`] contract.
//!
//! Records are stored as JSON. The backend-assigned resource id and expiry
//! are authoritative and written back into records on read.

use std::sync::Arc;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use appgate_common::app::AppV3;
use appgate_common::errors::{Error, Result};
use appgate_common::keepalive::{KeepAlive, KeepAliveKind};
use appgate_common::resource::{Kind, Resource};
use appgate_common::server::{
    AppServerV3, DatabaseServerV3, KubeServerV3, RemoteClusterV3, ReverseTunnelV2, ServerV2,
    TrustedClusterV2, TunnelConnectionV2, WindowsDesktopServiceV3,
};

use crate::backend::{Backend, Item, Key, Lease};
use crate::events::{AnyResource, ResourceEvent, ResourceHeader};
use crate::keyspace;

const EVENTS_CAPACITY: usize = 1024;

/// The presence service.
pub struct PresenceService {
    backend: Arc<dyn Backend>,
    events: broadcast::Sender<ResourceEvent>,
}

impl PresenceService {
    /// Build a presence service over a backend.
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Arc::new(Self { backend, events })
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Subscribe to the mutation event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ResourceEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn marshal<T: Serialize>(record: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(record)
            .map_err(|e| Error::Internal(anyhow::anyhow!("marshaling record: {e}")))
    }

    pub(crate) fn unmarshal<T: DeserializeOwned + Resource>(item: &Item) -> Result<T> {
        let mut record: T = serde_json::from_slice(&item.value)
            .map_err(|e| Error::bad_parameter(format!("malformed record at {}: {e}", item.key)))?;
        record.set_resource_id(item.resource_id);
        if item.expires.is_some() {
            record.set_expiry(item.expires);
        }
        Ok(record)
    }

    pub(crate) async fn range_records<T: DeserializeOwned + Resource>(
        &self,
        prefix: &Key,
    ) -> Result<Vec<T>> {
        let items = self
            .backend
            .get_range(prefix, &prefix.range_end(), 0)
            .await?;
        items.iter().map(Self::unmarshal).collect()
    }

    fn keep_alive_for(
        kind: KeepAliveKind,
        record: &impl Resource,
        host_id: &str,
        lease: &Lease,
    ) -> Option<KeepAlive> {
        record.expiry().map(|expires| KeepAlive {
            kind,
            lease_id: lease.id,
            name: record.name().to_string(),
            namespace: record.metadata().namespace.clone(),
            host_id: host_id.to_string(),
            expires,
        })
    }

    // === Application servers ===

    /// Register or refresh an application server heartbeat.
    pub async fn upsert_application_server(
        &self,
        mut server: AppServerV3,
    ) -> Result<Option<KeepAlive>> {
        server.check_and_set_defaults()?;
        let key = keyspace::app_server_key(
            &server.metadata.namespace,
            &server.spec.host_id,
            &server.metadata.name,
        );
        let item = Item::new(key, Self::marshal(&server)?, server.expiry());
        let lease = self.backend.put(item).await?;
        let keep_alive =
            Self::keep_alive_for(KeepAliveKind::App, &server, &server.spec.host_id, &lease);
        self.emit(ResourceEvent::Put(AnyResource::AppServer(server)));
        Ok(keep_alive)
    }

    /// All application servers in a namespace.
    pub async fn get_application_servers(&self, namespace: &str) -> Result<Vec<AppServerV3>> {
        if namespace.is_empty() {
            return Err(Error::bad_parameter("missing namespace"));
        }
        self.range_records(&keyspace::app_servers_prefix(namespace))
            .await
    }

    /// Delete one application server.
    pub async fn delete_application_server(
        &self,
        namespace: &str,
        host_id: &str,
        name: &str,
    ) -> Result<()> {
        if namespace.is_empty() || host_id.is_empty() || name.is_empty() {
            return Err(Error::bad_parameter(
                "namespace, host id and name are required",
            ));
        }
        self.backend
            .delete(&keyspace::app_server_key(namespace, host_id, name))
            .await?;
        self.emit(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::AppServer,
            namespace: namespace.to_string(),
            host_id: host_id.to_string(),
            name: name.to_string(),
        }));
        Ok(())
    }

    /// Delete every application server in a namespace.
    pub async fn delete_all_application_servers(&self, namespace: &str) -> Result<()> {
        if namespace.is_empty() {
            return Err(Error::bad_parameter("missing namespace"));
        }
        let prefix = keyspace::app_servers_prefix(namespace);
        self.backend.delete_range(&prefix, &prefix.range_end()).await
    }

    // === Nodes ===

    /// Register or refresh a node heartbeat.
    pub async fn upsert_node(&self, mut node: ServerV2) -> Result<Option<KeepAlive>> {
        node.check_and_set_defaults()?;
        let key = keyspace::node_key(&node.metadata.namespace, &node.metadata.name);
        let item = Item::new(key, Self::marshal(&node)?, node.expiry());
        let lease = self.backend.put(item).await?;
        let keep_alive = Self::keep_alive_for(KeepAliveKind::Node, &node, "", &lease);
        self.emit(ResourceEvent::Put(AnyResource::Node(node)));
        Ok(keep_alive)
    }

    /// All nodes in a namespace.
    pub async fn get_nodes(&self, namespace: &str) -> Result<Vec<ServerV2>> {
        if namespace.is_empty() {
            return Err(Error::bad_parameter("missing namespace"));
        }
        self.range_records(&keyspace::nodes_prefix(namespace)).await
    }

    /// Delete one node.
    pub async fn delete_node(&self, namespace: &str, name: &str) -> Result<()> {
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::bad_parameter("namespace and name are required"));
        }
        self.backend
            .delete(&keyspace::node_key(namespace, name))
            .await?;
        self.emit(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::Node,
            namespace: namespace.to_string(),
            host_id: String::new(),
            name: name.to_string(),
        }));
        Ok(())
    }

    /// Delete every node in a namespace.
    pub async fn delete_all_nodes(&self, namespace: &str) -> Result<()> {
        if namespace.is_empty() {
            return Err(Error::bad_parameter("missing namespace"));
        }
        let prefix = keyspace::nodes_prefix(namespace);
        self.backend.delete_range(&prefix, &prefix.range_end()).await
    }

    // === Database servers ===

    /// Register or refresh a database server heartbeat.
    pub async fn upsert_database_server(
        &self,
        mut server: DatabaseServerV3,
    ) -> Result<Option<KeepAlive>> {
        server.check_and_set_defaults()?;
        let key = keyspace::db_server_key(
            &server.metadata.namespace,
            &server.spec.host_id,
            &server.metadata.name,
        );
        let item = Item::new(key, Self::marshal(&server)?, server.expiry());
        let lease = self.backend.put(item).await?;
        let keep_alive =
            Self::keep_alive_for(KeepAliveKind::Database, &server, &server.spec.host_id, &lease);
        self.emit(ResourceEvent::Put(AnyResource::DatabaseServer(server)));
        Ok(keep_alive)
    }

    /// All database servers in a namespace.
    pub async fn get_database_servers(&self, namespace: &str) -> Result<Vec<DatabaseServerV3>> {
        if namespace.is_empty() {
            return Err(Error::bad_parameter("missing namespace"));
        }
        self.range_records(&keyspace::db_servers_prefix(namespace))
            .await
    }

    /// Delete one database server.
    pub async fn delete_database_server(
        &self,
        namespace: &str,
        host_id: &str,
        name: &str,
    ) -> Result<()> {
        if namespace.is_empty() || host_id.is_empty() || name.is_empty() {
            return Err(Error::bad_parameter(
                "namespace, host id and name are required",
            ));
        }
        self.backend
            .delete(&keyspace::db_server_key(namespace, host_id, name))
            .await?;
        self.emit(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::DatabaseServer,
            namespace: namespace.to_string(),
            host_id: host_id.to_string(),
            name: name.to_string(),
        }));
        Ok(())
    }

    // === Kube servers ===

    /// Register or refresh a kube server heartbeat.
    pub async fn upsert_kube_server(&self, mut server: KubeServerV3) -> Result<Option<KeepAlive>> {
        server.check_and_set_defaults()?;
        let key = keyspace::kube_server_key(&server.spec.host_id, &server.metadata.name);
        let item = Item::new(key, Self::marshal(&server)?, server.expiry());
        let lease = self.backend.put(item).await?;
        let keep_alive =
            Self::keep_alive_for(KeepAliveKind::Kube, &server, &server.spec.host_id, &lease);
        self.emit(ResourceEvent::Put(AnyResource::KubeServer(server)));
        Ok(keep_alive)
    }

    /// All kube servers.
    pub async fn get_kube_servers(&self) -> Result<Vec<KubeServerV3>> {
        self.range_records(&keyspace::kube_servers_prefix()).await
    }

    /// Delete one kube server.
    pub async fn delete_kube_server(&self, host_id: &str, name: &str) -> Result<()> {
        if host_id.is_empty() || name.is_empty() {
            return Err(Error::bad_parameter("host id and name are required"));
        }
        self.backend
            .delete(&keyspace::kube_server_key(host_id, name))
            .await?;
        self.emit(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::KubeServer,
            namespace: String::new(),
            host_id: host_id.to_string(),
            name: name.to_string(),
        }));
        Ok(())
    }

    // === Windows desktop services ===

    /// Register or refresh a windows desktop service heartbeat.
    pub async fn upsert_windows_desktop_service(
        &self,
        mut service: WindowsDesktopServiceV3,
    ) -> Result<Option<KeepAlive>> {
        service.check_and_set_defaults()?;
        let key = keyspace::windows_desktop_service_key(&service.metadata.name);
        let item = Item::new(key, Self::marshal(&service)?, service.expiry());
        let lease = self.backend.put(item).await?;
        let keep_alive = Self::keep_alive_for(KeepAliveKind::WindowsDesktop, &service, "", &lease);
        self.emit(ResourceEvent::Put(AnyResource::WindowsDesktopService(service)));
        Ok(keep_alive)
    }

    /// All windows desktop services.
    pub async fn get_windows_desktop_services(&self) -> Result<Vec<WindowsDesktopServiceV3>> {
        self.range_records(&keyspace::windows_desktop_services_prefix())
            .await
    }

    /// Delete one windows desktop service.
    pub async fn delete_windows_desktop_service(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        self.backend
            .delete(&keyspace::windows_desktop_service_key(name))
            .await?;
        self.emit(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::WindowsDesktopService,
            namespace: String::new(),
            host_id: String::new(),
            name: name.to_string(),
        }));
        Ok(())
    }

    // === Dynamically registered applications ===

    /// Create a new application; fails when one with the name exists.
    pub async fn create_app(&self, mut app: AppV3) -> Result<()> {
        app.check_and_set_defaults()?;
        let key = keyspace::app_key(&app.metadata.name);
        let item = Item::new(key, Self::marshal(&app)?, app.expiry());
        self.backend.create(item).await?;
        self.emit(ResourceEvent::Put(AnyResource::App(app)));
        Ok(())
    }

    /// Update an existing application.
    pub async fn update_app(&self, mut app: AppV3) -> Result<()> {
        app.check_and_set_defaults()?;
        let key = keyspace::app_key(&app.metadata.name);
        let item = Item::new(key, Self::marshal(&app)?, app.expiry());
        self.backend.update(item).await?;
        self.emit(ResourceEvent::Put(AnyResource::App(app)));
        Ok(())
    }

    /// One application by name.
    pub async fn get_app(&self, name: &str) -> Result<AppV3> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        let item = self.backend.get(&keyspace::app_key(name)).await?;
        Self::unmarshal(&item)
    }

    /// All registered applications.
    pub async fn get_apps(&self) -> Result<Vec<AppV3>> {
        self.range_records(&keyspace::apps_prefix()).await
    }

    /// Delete one application.
    pub async fn delete_app(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        self.backend.delete(&keyspace::app_key(name)).await?;
        self.emit(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::App,
            namespace: String::new(),
            host_id: String::new(),
            name: name.to_string(),
        }));
        Ok(())
    }

    // === Tunnel connections ===

    /// Register or refresh a tunnel connection.
    pub async fn upsert_tunnel_connection(&self, conn: TunnelConnectionV2) -> Result<()> {
        let key =
            keyspace::tunnel_connection_key(&conn.spec.cluster_name, &conn.metadata.name);
        let item = Item::new(key, Self::marshal(&conn)?, conn.expiry());
        self.backend.put(item).await?;
        Ok(())
    }

    /// Tunnel connections of one cluster, or all when `cluster` is empty.
    pub async fn get_tunnel_connections(&self, cluster: &str) -> Result<Vec<TunnelConnectionV2>> {
        self.range_records(&keyspace::tunnel_connections_prefix(cluster))
            .await
    }

    /// Delete one tunnel connection.
    pub async fn delete_tunnel_connection(&self, cluster: &str, name: &str) -> Result<()> {
        if cluster.is_empty() || name.is_empty() {
            return Err(Error::bad_parameter("cluster and name are required"));
        }
        self.backend
            .delete(&keyspace::tunnel_connection_key(cluster, name))
            .await
    }

    /// Delete every tunnel connection of a cluster.
    pub async fn delete_tunnel_connections(&self, cluster: &str) -> Result<()> {
        if cluster.is_empty() {
            return Err(Error::bad_parameter("missing cluster"));
        }
        let prefix = keyspace::tunnel_connections_prefix(cluster);
        self.backend.delete_range(&prefix, &prefix.range_end()).await
    }

    // === Remote clusters ===

    /// Create a remote cluster record.
    pub async fn create_remote_cluster(&self, cluster: RemoteClusterV3) -> Result<()> {
        let key = keyspace::remote_cluster_key(&cluster.metadata.name);
        let item = Item::new(key, Self::marshal(&cluster)?, cluster.expiry());
        self.backend.create(item).await?;
        Ok(())
    }

    /// Update a remote cluster record.
    pub async fn update_remote_cluster(&self, cluster: RemoteClusterV3) -> Result<()> {
        let key = keyspace::remote_cluster_key(&cluster.metadata.name);
        let item = Item::new(key, Self::marshal(&cluster)?, cluster.expiry());
        self.backend.update(item).await?;
        Ok(())
    }

    /// One remote cluster by name.
    pub async fn get_remote_cluster(&self, name: &str) -> Result<RemoteClusterV3> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        let item = self.backend.get(&keyspace::remote_cluster_key(name)).await?;
        Self::unmarshal(&item)
    }

    /// All remote clusters.
    pub async fn get_remote_clusters(&self) -> Result<Vec<RemoteClusterV3>> {
        self.range_records(&keyspace::remote_clusters_prefix()).await
    }

    /// Delete one remote cluster.
    pub async fn delete_remote_cluster(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        self.backend.delete(&keyspace::remote_cluster_key(name)).await
    }

    // === Reverse tunnels ===

    /// Register or replace a reverse tunnel.
    pub async fn upsert_reverse_tunnel(&self, tunnel: ReverseTunnelV2) -> Result<()> {
        let key = keyspace::reverse_tunnel_key(&tunnel.metadata.name);
        let item = Item::new(key, Self::marshal(&tunnel)?, tunnel.expiry());
        self.backend.put(item).await?;
        Ok(())
    }

    /// All reverse tunnels.
    pub async fn get_reverse_tunnels(&self) -> Result<Vec<ReverseTunnelV2>> {
        self.range_records(&keyspace::reverse_tunnels_prefix()).await
    }

    /// Delete one reverse tunnel.
    pub async fn delete_reverse_tunnel(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        self.backend.delete(&keyspace::reverse_tunnel_key(name)).await
    }

    // === Trusted clusters ===

    /// Register or replace a trusted cluster.
    pub async fn upsert_trusted_cluster(&self, cluster: TrustedClusterV2) -> Result<()> {
        let key = keyspace::trusted_cluster_key(&cluster.metadata.name);
        let item = Item::new(key, Self::marshal(&cluster)?, cluster.expiry());
        self.backend.put(item).await?;
        Ok(())
    }

    /// One trusted cluster by name.
    pub async fn get_trusted_cluster(&self, name: &str) -> Result<TrustedClusterV2> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        let item = self
            .backend
            .get(&keyspace::trusted_cluster_key(name))
            .await?;
        Self::unmarshal(&item)
    }

    /// All trusted clusters.
    pub async fn get_trusted_clusters(&self) -> Result<Vec<TrustedClusterV2>> {
        self.range_records(&keyspace::trusted_clusters_prefix()).await
    }

    /// Delete one trusted cluster.
    pub async fn delete_trusted_cluster(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        self.backend.delete(&keyspace::trusted_cluster_key(name)).await
    }

    // === Host-user interaction time ===

    /// Record when a host user was last interactive.
    pub async fn record_host_user_interaction_time(
        &self,
        name: &str,
        when: SystemTime,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        let item = Item::new(
            keyspace::host_user_interaction_key(name),
            Self::marshal(&when)?,
            None,
        );
        self.backend.put(item).await?;
        Ok(())
    }

    /// When a host user was last interactive.
    pub async fn get_host_user_interaction_time(&self, name: &str) -> Result<SystemTime> {
        if name.is_empty() {
            return Err(Error::bad_parameter("missing name"));
        }
        let item = self
            .backend
            .get(&keyspace::host_user_interaction_key(name))
            .await?;
        serde_json::from_slice(&item.value)
            .map_err(|e| Error::bad_parameter(format!("malformed timestamp: {e}")))
    }

    // === Keep-alives ===

    /// Refresh the TTL of a heartbeated record.
    pub async fn keep_alive_server(&self, keep_alive: &KeepAlive) -> Result<()> {
        keep_alive.check()?;
        let key = match keep_alive.kind {
            KeepAliveKind::App => keyspace::app_server_key(
                &keep_alive.namespace,
                &keep_alive.host_id,
                &keep_alive.name,
            ),
            KeepAliveKind::Node => keyspace::node_key(&keep_alive.namespace, &keep_alive.name),
            KeepAliveKind::Database => keyspace::db_server_key(
                &keep_alive.namespace,
                &keep_alive.host_id,
                &keep_alive.name,
            ),
            KeepAliveKind::Kube => {
                keyspace::kube_server_key(&keep_alive.host_id, &keep_alive.name)
            }
            KeepAliveKind::WindowsDesktop => {
                keyspace::windows_desktop_service_key(&keep_alive.name)
            }
        };
        let lease = Lease {
            id: keep_alive.lease_id,
            key,
        };
        self.backend.keep_alive(&lease, keep_alive.expires).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use appgate_common::app::AppSpecV3;
    use appgate_common::resource::Metadata;
    use appgate_common::server::AppServerSpecV3;
    use std::time::Duration;

    fn service() -> Arc<PresenceService> {
        PresenceService::new(Arc::new(MemoryBackend::new()))
    }

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

    fn app_server(name: &str, host_id: &str, ttl: Duration) -> AppServerV3 {
        AppServerV3::new(
            Metadata {
                name: name.to_string(),
                expires: Some(SystemTime::now() + ttl),
                ..Default::default()
            },
            AppServerSpecV3 {
                host_id: host_id.to_string(),
                hostname: format!("{host_id}.example.com"),
                rotation: Default::default(),
                proxy_ids: vec![],
                version: String::new(),
                app: test_app(name),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn app_server_upsert_and_list() {
        let presence = service();

        let keep_alive = presence
            .upsert_application_server(app_server("a", "h1", Duration::from_secs(3600)))
            .await
            .unwrap()
            .expect("expiring upsert must return a keep-alive");
        assert!(keep_alive.lease_id > 0);
        assert_eq!(keep_alive.kind, KeepAliveKind::App);
        assert_eq!(keep_alive.name, "a");

        let servers = presence.get_application_servers("default").await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].metadata.name, "a");
        assert_eq!(servers[0].spec.host_id, "h1");
        assert!(servers[0].resource_id() > 0);

        // Empty name is rejected before it reaches the backend.
        let err = presence
            .delete_application_server("default", "h1", "")
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());

        presence
            .delete_application_server("default", "h1", "a")
            .await
            .unwrap();
        assert!(presence
            .get_application_servers("default")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn keep_alive_refreshes_expiry() {
        let presence = service();
        let mut keep_alive = presence
            .upsert_application_server(app_server("a", "h1", Duration::from_secs(60)))
            .await
            .unwrap()
            .unwrap();

        keep_alive.expires = SystemTime::now() + Duration::from_secs(600);
        presence.keep_alive_server(&keep_alive).await.unwrap();

        let servers = presence.get_application_servers("default").await.unwrap();
        assert_eq!(servers[0].expiry(), Some(keep_alive.expires));
    }

    #[tokio::test]
    async fn expired_servers_disappear_from_listings() {
        let presence = service();
        let mut server = app_server("a", "h1", Duration::from_secs(60));
        server.metadata.expires = Some(SystemTime::now() - Duration::from_secs(1));
        presence.upsert_application_server(server).await.unwrap();

        assert!(presence
            .get_application_servers("default")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn app_crud_and_events() {
        let presence = service();
        let mut events = presence.subscribe();

        presence.create_app(test_app("web")).await.unwrap();
        assert!(presence
            .create_app(test_app("web"))
            .await
            .unwrap_err()
            .is_already_exists());

        let mut updated = test_app("web");
        updated
            .metadata
            .labels
            .insert("env".to_string(), "prod".to_string());
        presence.update_app(updated).await.unwrap();

        let fetched = presence.get_app("web").await.unwrap();
        assert_eq!(fetched.metadata.labels.get("env").unwrap(), "prod");

        presence.delete_app("web").await.unwrap();
        assert!(presence.get_app("web").await.unwrap_err().is_not_found());

        // create + update + delete made it onto the stream in order.
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(match event {
                ResourceEvent::Put(r) => format!("put:{}", r.name()),
                ResourceEvent::Delete(h) => format!("del:{}", h.name),
            });
        }
        assert_eq!(names, vec!["put:web", "put:web", "del:web"]);
    }

    #[tokio::test]
    async fn host_user_interaction_round_trip() {
        let presence = service();
        let when = SystemTime::now();
        presence
            .record_host_user_interaction_time("bob", when)
            .await
            .unwrap();
        assert_eq!(
            presence.get_host_user_interaction_time("bob").await.unwrap(),
            when
        );
    }
}
