//! Tunnel hand-off to a freshly started daemon.
//!
//! The daemon listens on the rendezvous socket named in its config. We dial
//! it, send the tunnel descriptor in a `HandleHandoff` message and keep the
//! connection open until the daemon hangs up or the instance is cancelled.

use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use meshvisor_protocol::{Channel, MessageKind, ProtocolError, ProtocolResult};
use tokio_util::sync::CancellationToken;

/// Dial `path` up to `attempts` times, `delay` apart.
pub async fn dial(
    path: &Path,
    attempts: u32,
    delay: Duration,
    token: &CancellationToken,
) -> ProtocolResult<Option<Channel>> {
    let mut last = None;
    for _ in 0..attempts.max(1) {
        if token.is_cancelled() {
            return Ok(None);
        }
        match Channel::connect(path).await {
            Ok(channel) => return Ok(Some(channel)),
            Err(e) => last = Some(e),
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Err(last.unwrap_or(ProtocolError::Closed))
}

/// Hand `tunnel` to the daemon listening on `path`. Errors are logged; the
/// daemon may simply have died and will be restarted by the supervisor.
pub async fn hand_off(
    path: &Path,
    tunnel: Arc<OwnedFd>,
    attempts: u32,
    delay: Duration,
    token: CancellationToken,
    label: &str,
) {
    let channel = match dial(path, attempts, delay, &token).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return,
        Err(e) => {
            warn!("[{label}] rendezvous {} unreachable: {e}", path.display());
            return;
        }
    };

    if let Err(e) = channel
        .send(MessageKind::HandleHandoff, 0, &[], &[tunnel.as_fd()])
        .await
    {
        warn!("[{label}] tunnel hand-off failed: {e}");
        return;
    }
    debug!("[{label}] tunnel handed to daemon");

    tokio::select! {
        _ = token.cancelled() => {}
        res = channel.closed() => {
            if let Err(e) = res {
                debug!("[{label}] rendezvous connection: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_hand_off_delivers_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cjdnstun.socket");

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"tun").unwrap();
        let tunnel = Arc::new(OwnedFd::from(file));

        let token = CancellationToken::new();
        let sender = tokio::spawn({
            let path = path.clone();
            let token = token.clone();
            async move {
                hand_off(&path, tunnel, 500, Duration::from_millis(10), token, "t").await;
            }
        });

        // Listener appears after the first dials have failed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listener = UnixListener::bind(&path).unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let channel = Channel::new(stream);
        let mut message = channel.recv().await.unwrap();
        assert_eq!(message.kind, MessageKind::HandleHandoff);

        let mut received = std::fs::File::from(message.take_handle().unwrap());
        received.rewind().unwrap();
        let mut text = String::new();
        received.read_to_string(&mut text).unwrap();
        assert_eq!(text, "tun");

        // Hanging up ends the hand-off task.
        drop(channel);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_gives_up() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        let result = dial(
            &dir.path().join("absent"),
            3,
            Duration::from_millis(1),
            &token,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_dialing() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result = dial(&dir.path().join("absent"), 1000, Duration::from_secs(1), &token).await;
        assert!(matches!(result, Ok(None)));
    }
}
