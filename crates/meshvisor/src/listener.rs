//! Control socket listener.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use meshvisor_protocol::Channel;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::origin::ClientOrigin;
use crate::session::SessionFactory;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bound control socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind `path`, replacing a stale socket file, and apply `mode`.
    pub fn bind(path: &Path, mode: u32) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {:?}", parent))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing stale socket {:?}", path)),
        }

        let listener =
            UnixListener::bind(path).with_context(|| format!("binding to {:?}", path))?;

        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!("setting permissions {:o} on {:?}: {}", mode, path, e);
        }

        info!("listening on {:?}", path);
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients until `token` is cancelled, starting one session per
    /// connection on `tracker`.
    pub async fn run(
        &self,
        factory: Arc<dyn SessionFactory>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) {
        let mut connections: u64 = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("listener on {:?} shutting down", self.path);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        connections += 1;
                        let label = format!("client:{connections}");
                        info!("[{label}] connected");
                        let origin = Arc::new(ClientOrigin::new(Channel::new(stream), label));
                        tracker.spawn(factory.start(origin, token.child_token()));
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                        pause(&token, ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }
}

/// Sleep for `delay`, returning early once `token` is cancelled.
async fn pause(token: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
