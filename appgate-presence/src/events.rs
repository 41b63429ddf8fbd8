//! The resource event stream.
//!
//! The presence service broadcasts an event for every mutation. A
//! [`ResourceWatcher`] turns that firehose into what reconcilers want: an
//! initial snapshot, then batches of updates for the kinds it cares about,
//! and an explicit resync marker when it fell behind.

use std::collections::BTreeMap;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use appgate_common::app::AppV3;
use appgate_common::resource::{Kind, Resource, ResourceWithLabels};
use appgate_common::server::{
    AppServerV3, DatabaseServerV3, KubeServerV3, ServerV2, WindowsDesktopServiceV3,
};

/// A resource carried by an event or a unified listing.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyResource {
    /// A dynamically registered application.
    App(AppV3),
    /// An application server heartbeat.
    AppServer(AppServerV3),
    /// A node heartbeat.
    Node(ServerV2),
    /// A database server heartbeat.
    DatabaseServer(DatabaseServerV3),
    /// A kube server heartbeat.
    KubeServer(KubeServerV3),
    /// A windows desktop service heartbeat.
    WindowsDesktopService(WindowsDesktopServiceV3),
}

impl AnyResource {
    /// The resource kind.
    pub fn kind(&self) -> Kind {
        match self {
            AnyResource::App(_) => Kind::App,
            AnyResource::AppServer(_) => Kind::AppServer,
            AnyResource::Node(_) => Kind::Node,
            AnyResource::DatabaseServer(_) => Kind::DatabaseServer,
            AnyResource::KubeServer(_) => Kind::KubeServer,
            AnyResource::WindowsDesktopService(_) => Kind::WindowsDesktopService,
        }
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        match self {
            AnyResource::App(r) => r.name(),
            AnyResource::AppServer(r) => r.name(),
            AnyResource::Node(r) => r.name(),
            AnyResource::DatabaseServer(r) => r.name(),
            AnyResource::KubeServer(r) => r.name(),
            AnyResource::WindowsDesktopService(r) => r.name(),
        }
    }

    /// The backend-assigned monotonic id.
    pub fn resource_id(&self) -> i64 {
        match self {
            AnyResource::App(r) => r.resource_id(),
            AnyResource::AppServer(r) => r.resource_id(),
            AnyResource::Node(r) => r.resource_id(),
            AnyResource::DatabaseServer(r) => r.resource_id(),
            AnyResource::KubeServer(r) => r.resource_id(),
            AnyResource::WindowsDesktopService(r) => r.resource_id(),
        }
    }

    /// The combined label view.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        match self {
            AnyResource::App(r) => r.all_labels(),
            AnyResource::AppServer(r) => r.all_labels(),
            AnyResource::Node(r) => r.all_labels(),
            AnyResource::DatabaseServer(r) => r.all_labels(),
            AnyResource::KubeServer(r) => r.all_labels(),
            AnyResource::WindowsDesktopService(r) => r.all_labels(),
        }
    }

    /// True iff every search value matches some field (see
    /// [`ResourceWithLabels::match_search`]).
    pub fn match_search(&self, values: &[String]) -> bool {
        match self {
            AnyResource::App(r) => r.match_search(values),
            AnyResource::AppServer(r) => r.match_search(values),
            AnyResource::Node(r) => r.match_search(values),
            AnyResource::DatabaseServer(r) => r.match_search(values),
            AnyResource::KubeServer(r) => r.match_search(values),
            AnyResource::WindowsDesktopService(r) => r.match_search(values),
        }
    }

    /// The token listings hand out to resume after this resource.
    pub fn pagination_key(&self) -> String {
        match self {
            AnyResource::App(r) => r.pagination_key(),
            AnyResource::AppServer(r) => r.pagination_key(),
            AnyResource::Node(r) => r.pagination_key(),
            AnyResource::DatabaseServer(r) => r.pagination_key(),
            AnyResource::KubeServer(r) => r.pagination_key(),
            AnyResource::WindowsDesktopService(r) => r.pagination_key(),
        }
    }
}

/// Identifies a deleted resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHeader {
    /// The resource kind.
    pub kind: Kind,
    /// Namespace, empty for unnamespaced kinds.
    pub namespace: String,
    /// Advertising host, empty for kinds not keyed by host.
    pub host_id: String,
    /// The resource name.
    pub name: String,
}

/// One presence-store mutation.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// A resource was written.
    Put(AnyResource),
    /// A resource was deleted.
    Delete(ResourceHeader),
}

/// What a [`ResourceWatcher`] delivers.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    /// The snapshot taken when the watcher started.
    Init(Vec<AnyResource>),
    /// A batch of mutations, in order.
    Batch(Vec<ResourceEvent>),
    /// The watcher lagged behind; consumers must refetch.
    Resync,
}

const WATCHER_QUEUE: usize = 16;
const MAX_BATCH: usize = 100;

/// Tails the event stream for a set of kinds.
pub struct ResourceWatcher {
    rx: mpsc::Receiver<WatcherEvent>,
    handle: JoinHandle<()>,
}

impl ResourceWatcher {
    /// Start a watcher delivering `init` first, then batches of events whose
    /// kind is in `kinds`.
    pub fn new(
        kinds: Vec<Kind>,
        init: Vec<AnyResource>,
        mut events: broadcast::Receiver<ResourceEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WATCHER_QUEUE);
        let handle = tokio::spawn(async move {
            if tx.send(WatcherEvent::Init(init)).await.is_err() {
                return;
            }
            loop {
                let first = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if tx.send(WatcherEvent::Resync).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                let mut batch = Vec::new();
                if event_matches(&first, &kinds) {
                    batch.push(first);
                }
                // Drain whatever is already queued into the same batch.
                while batch.len() < MAX_BATCH {
                    match events.try_recv() {
                        Ok(event) => {
                            if event_matches(&event, &kinds) {
                                batch.push(event);
                            }
                        }
                        Err(_) => break,
                    }
                }
                if batch.is_empty() {
                    continue;
                }
                if tx.send(WatcherEvent::Batch(batch)).await.is_err() {
                    return;
                }
            }
        });
        Self { rx, handle }
    }

    /// The next watcher event; `None` once the stream closed.
    pub async fn next(&mut self) -> Option<WatcherEvent> {
        self.rx.recv().await
    }
}

impl Drop for ResourceWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn event_matches(event: &ResourceEvent, kinds: &[Kind]) -> bool {
    let kind = match event {
        ResourceEvent::Put(resource) => resource.kind(),
        ResourceEvent::Delete(header) => header.kind,
    };
    kinds.contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use appgate_common::app::AppSpecV3;
    use appgate_common::resource::Metadata;

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

    #[tokio::test]
    async fn watcher_delivers_init_then_batches() {
        let (tx, rx) = broadcast::channel(32);
        let mut watcher = ResourceWatcher::new(
            vec![Kind::App],
            vec![AnyResource::App(test_app("seed"))],
            rx,
        );

        match watcher.next().await.unwrap() {
            WatcherEvent::Init(snapshot) => {
                assert_eq!(snapshot.len(), 1);
                assert_eq!(snapshot[0].name(), "seed");
            }
            other => panic!("expected init, got {other:?}"),
        }

        tx.send(ResourceEvent::Put(AnyResource::App(test_app("a")))).unwrap();
        tx.send(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::App,
            namespace: String::new(),
            host_id: String::new(),
            name: "b".to_string(),
        }))
        .unwrap();

        let mut seen = 0;
        while seen < 2 {
            match watcher.next().await.unwrap() {
                WatcherEvent::Batch(batch) => seen += batch.len(),
                other => panic!("expected batch, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn watcher_filters_kinds() {
        let (tx, rx) = broadcast::channel(32);
        let mut watcher = ResourceWatcher::new(vec![Kind::App], vec![], rx);
        let _ = watcher.next().await; // init

        tx.send(ResourceEvent::Delete(ResourceHeader {
            kind: Kind::Node,
            namespace: "default".to_string(),
            host_id: String::new(),
            name: "n".to_string(),
        }))
        .unwrap();
        tx.send(ResourceEvent::Put(AnyResource::App(test_app("a")))).unwrap();

        match watcher.next().await.unwrap() {
            WatcherEvent::Batch(batch) => {
                assert_eq!(batch.len(), 1);
                match &batch[0] {
                    ResourceEvent::Put(r) => assert_eq!(r.name(), "a"),
                    other => panic!("unexpected event {other:?}"),
                }
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }
}
