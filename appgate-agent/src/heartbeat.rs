//! Heartbeat announcing of registered applications.
//!
//! Each application gets an announcer that periodically upserts a fresh
//! snapshot of its server record (picking up dynamic-label results) and
//! sends keep-alives in between announces.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::task::JoinHandle;

use appgate_common::errors::Result;
use appgate_common::server::AppServerV3;
use appgate_presence::PresenceService;

/// TTL the store enforces on announced records.
pub const SERVER_TTL: Duration = Duration::from_secs(10 * 60);

/// How often keep-alives refresh the record between announces.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// The announce interval: two thirds of the TTL, re-jittered ±10% every
/// cycle so a fleet of agents spreads out.
fn announce_interval() -> Duration {
    let base = SERVER_TTL * 2 / 3;
    let base_millis = base.as_millis() as u64;
    let swing = base_millis / 10;
    Duration::from_millis(
        rand::thread_rng().gen_range(base_millis - swing..=base_millis + swing),
    )
}

/// Builds the record announced on each cycle. Snapshots must be fresh: the
/// callback deep-copies the application and overlays current dynamic-label
/// results.
pub type SnapshotFn = dyn Fn() -> Result<AppServerV3> + Send + Sync;

/// One application's heartbeat announcer.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start announcing through `presence`.
    pub fn start(presence: Arc<PresenceService>, snapshot: Box<SnapshotFn>) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let mut keep_alive = match snapshot() {
                    Ok(mut server) => {
                        server.metadata.expires = Some(SystemTime::now() + SERVER_TTL);
                        match presence.upsert_application_server(server).await {
                            Ok(keep_alive) => keep_alive,
                            Err(error) => {
                                tracing::warn!(%error, "heartbeat announce failed");
                                None
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "heartbeat snapshot failed");
                        None
                    }
                };

                let announce_in = announce_interval();
                let next_announce = tokio::time::Instant::now() + announce_in;

                // Keep-alives ride the lease until the next full announce.
                loop {
                    let keep_alive_at = tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL;
                    if keep_alive_at >= next_announce {
                        tokio::time::sleep_until(next_announce).await;
                        break;
                    }
                    tokio::time::sleep_until(keep_alive_at).await;
                    if let Some(ka) = keep_alive.as_mut() {
                        ka.expires = SystemTime::now() + SERVER_TTL;
                        if let Err(error) = presence.keep_alive_server(ka).await {
                            tracing::warn!(%error, "heartbeat keep-alive failed");
                            // Fall back to a full announce.
                            break;
                        }
                    }
                }
            }
        });
        Self { handle }
    }

    /// Stop announcing. The record ages out of the store by TTL.
    pub fn close(&self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.close();
    }
}
