//! Per-connection activity tracking and disconnect enforcement.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::locks::{LockTarget, LockWatcher};

/// Shared read-activity clock of one connection, in milliseconds since the
/// tracker was created.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    started: Instant,
    last_read_millis: Arc<AtomicU64>,
}

impl ActivityTracker {
    /// A fresh tracker with "now" as the last activity.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_read_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_read_millis.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last observed read.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a stream, stamping the tracker on every successful read.
pub struct TrackedStream<IO> {
    inner: IO,
    tracker: ActivityTracker,
}

impl<IO> TrackedStream<IO> {
    /// Wrap `inner`.
    pub fn new(inner: IO, tracker: ActivityTracker) -> Self {
        Self { inner, tracker }
    }

    /// The wrapped stream.
    pub fn into_inner(self) -> IO {
        self.inner
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for TrackedStream<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                self.tracker.touch();
            }
        }
        result
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for TrackedStream<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// When the monitor force-disconnects a connection.
#[derive(Clone)]
pub struct MonitorConfig {
    /// Disconnect when the client certificate expires.
    pub cert_expiry: Option<SystemTime>,
    /// Disconnect after this much read inactivity; `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Disconnect when a lock targeting the connection comes into force.
    pub lock_watcher: Option<Arc<dyn LockWatcher>>,
    /// The connection's lock targets, checked against the watcher.
    pub lock_targets: Vec<LockTarget>,
    /// How often the limits are evaluated.
    pub tick: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cert_expiry: None,
            idle_timeout: None,
            lock_watcher: None,
            lock_targets: Vec::new(),
            tick: MONITOR_TICK,
        }
    }
}

/// Watches one connection and cancels it on certificate expiry, idleness or
/// a lock-target match.
pub struct ConnectionMonitor {
    handle: JoinHandle<()>,
}

const MONITOR_TICK: Duration = Duration::from_secs(5);

impl ConnectionMonitor {
    /// Start monitoring; `disconnect` is cancelled when a limit is hit.
    pub fn start(
        config: MonitorConfig,
        tracker: ActivityTracker,
        disconnect: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(config.tick).await;
                if let Some(expiry) = config.cert_expiry {
                    if SystemTime::now() >= expiry {
                        tracing::debug!("client certificate expired, disconnecting");
                        disconnect.cancel();
                        return;
                    }
                }
                if let Some(idle_timeout) = config.idle_timeout {
                    if tracker.idle_for() >= idle_timeout {
                        tracing::debug!("client idle timeout exceeded, disconnecting");
                        disconnect.cancel();
                        return;
                    }
                }
                if let Some(watcher) = &config.lock_watcher {
                    if let Some(message) = watcher.find_lock(&config.lock_targets) {
                        tracing::debug!(%message, "connection lock matched, disconnecting");
                        disconnect.cancel();
                        return;
                    }
                }
            }
        });
        Self { handle }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::StaticLockWatcher;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn lock_target_match_disconnects() {
        let watcher = StaticLockWatcher::new();
        let disconnect = CancellationToken::new();
        let _monitor = ConnectionMonitor::start(
            MonitorConfig {
                lock_watcher: Some(watcher.clone()),
                lock_targets: vec![LockTarget::User("alice".to_string())],
                tick: Duration::from_millis(10),
                ..Default::default()
            },
            ActivityTracker::new(),
            disconnect.clone(),
        );

        // Nothing locked: the connection stays up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!disconnect.is_cancelled());

        watcher.lock_target(LockTarget::User("alice".to_string()));
        tokio::time::timeout(Duration::from_secs(1), disconnect.cancelled())
            .await
            .expect("lock must disconnect the connection");
    }

    #[tokio::test]
    async fn idle_timeout_disconnects() {
        let disconnect = CancellationToken::new();
        let _monitor = ConnectionMonitor::start(
            MonitorConfig {
                idle_timeout: Some(Duration::from_millis(20)),
                tick: Duration::from_millis(10),
                ..Default::default()
            },
            ActivityTracker::new(),
            disconnect.clone(),
        );
        tokio::time::timeout(Duration::from_secs(1), disconnect.cancelled())
            .await
            .expect("idle connection must be disconnected");
    }

    #[tokio::test]
    async fn reads_update_the_tracker() {
        let tracker = ActivityTracker::new();
        let data: &[u8] = b"hello";
        let mut stream = TrackedStream::new(data, tracker.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tracker.idle_for() >= Duration::from_millis(20));

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert!(tracker.idle_for() < Duration::from_millis(20));
    }
}
