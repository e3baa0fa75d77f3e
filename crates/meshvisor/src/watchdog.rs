//! Per-session liveness monitor.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use meshvisor_protocol::ProtocolError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::origin::SessionOrigin;

/// Why the watchdog returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// No heartbeat within the timeout; the session was cancelled.
    Expired,
    /// The origin went away; the session was cancelled.
    Disconnected,
    /// The session was cancelled by someone else.
    Stopped,
}

/// Watch `origin` until the session ends.
///
/// A reader loop receives heartbeats and forwards them as pings; a timer loop
/// restarts its countdown on each ping. Expiry and disconnect both cancel
/// `session`.
pub async fn watch(
    origin: Arc<dyn SessionOrigin>,
    timeout: Duration,
    session: CancellationToken,
) -> WatchdogOutcome {
    let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);
    let label = origin.label().to_string();

    let reader = async {
        loop {
            tokio::select! {
                _ = session.cancelled() => return WatchdogOutcome::Stopped,
                received = origin.wait_heartbeat() => match received {
                    Ok(()) => {
                        let _ = ping_tx.try_send(());
                    }
                    Err(ProtocolError::Closed) => {
                        info!("[{label}] client disconnected");
                        session.cancel();
                        return WatchdogOutcome::Disconnected;
                    }
                    Err(e) if e.is_disconnect() => {
                        warn!("[{label}] heartbeat channel failed: {e}");
                        session.cancel();
                        return WatchdogOutcome::Disconnected;
                    }
                    Err(e) => warn!("[{label}] {e}"),
                },
            }
        }
    };

    let timer = async {
        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => return WatchdogOutcome::Stopped,
                Some(()) = ping_rx.recv() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!("[{label}] no heartbeat for {}s, stopping session", timeout.as_secs());
                    session.cancel();
                    return WatchdogOutcome::Expired;
                }
            }
        }
    };

    tokio::select! {
        outcome = reader => outcome,
        outcome = timer => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::NamespaceOrigin;
    use std::os::fd::OwnedFd;
    use tokio::time::Instant;

    fn origin() -> (Arc<dyn SessionOrigin>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(1);
        let fd = OwnedFd::from(tempfile::tempfile().unwrap());
        (Arc::new(NamespaceOrigin::new(1, fd, None, rx)), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_without_heartbeats() {
        let (origin, _tx) = origin();
        let token = CancellationToken::new();
        let start = Instant::now();

        let outcome = watch(origin, Duration::from_secs(60), token.clone()).await;

        assert_eq!(outcome, WatchdogOutcome::Expired);
        assert!(token.is_cancelled());
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_within_window_keep_session() {
        let (origin, tx) = origin();
        let token = CancellationToken::new();
        let handle = tokio::spawn(watch(origin, Duration::from_secs(60), token.clone()));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            tx.try_send(()).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(!token.is_cancelled());

        token.cancel();
        assert_eq!(handle.await.unwrap(), WatchdogOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_heartbeat_does_not_revive() {
        let (origin, tx) = origin();
        let token = CancellationToken::new();
        let handle = tokio::spawn(watch(origin, Duration::from_secs(60), token.clone()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(token.is_cancelled());
        let _ = tx.try_send(());
        assert_eq!(handle.await.unwrap(), WatchdogOutcome::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_origin_gone_disconnects() {
        let (origin, tx) = origin();
        let token = CancellationToken::new();
        drop(tx);

        let outcome = watch(origin, Duration::from_secs(60), token.clone()).await;
        assert_eq!(outcome, WatchdogOutcome::Disconnected);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_stops_watchdog() {
        let (origin, _tx) = origin();
        let parent = CancellationToken::new();
        let session = parent.child_token();
        let handle = tokio::spawn(watch(origin, Duration::from_secs(60), session));

        tokio::time::sleep(Duration::from_secs(1)).await;
        parent.cancel();
        assert_eq!(handle.await.unwrap(), WatchdogOutcome::Stopped);
    }
}
