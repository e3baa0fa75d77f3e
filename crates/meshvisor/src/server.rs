//! Top-level wiring: control socket, optional discovery, shared context.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admin::CjdnsAdmin;
use crate::config::AppConfig;
use crate::discovery::{DiscoveryLoop, ProcTable};
use crate::listener::ControlListener;
use crate::session::{SessionContext, SessionFactory, SessionSettings, Sessions};
use crate::synth::CjdrouteSynthesizer;
use crate::tunnel::NamespaceTunnel;

/// Build the production session context from `config`.
pub fn production_context(config: &AppConfig) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        settings: SessionSettings::from_config(config),
        peer: Arc::new(config.peer.clone()),
        synthesizer: Arc::new(CjdrouteSynthesizer),
        tunnels: Arc::new(NamespaceTunnel),
        admin: Arc::new(CjdnsAdmin::default()),
        events: None,
    })
}

/// Serve until `shutdown` is cancelled or discovery fails.
pub async fn serve(config: &AppConfig, shutdown: CancellationToken) -> Result<()> {
    serve_with(config, production_context(config), shutdown).await
}

/// Like [`serve`] with an explicit session context.
pub async fn serve_with(
    config: &AppConfig,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mode = config.server.socket_mode()?;
    let scratch = config.server.scratch_dir();
    std::fs::create_dir_all(&scratch)
        .with_context(|| format!("creating scratch directory {:?}", scratch))?;

    if !config.peer.address.is_empty() && config.peer.public_key.is_empty() {
        warn!("peer {} configured without a public key", config.peer.address);
    }

    let factory: Arc<dyn SessionFactory> = Arc::new(Sessions::new(ctx));
    let listener = ControlListener::bind(&config.server.socket, mode)?;
    let root = shutdown.child_token();
    let tracker = TaskTracker::new();

    let listen = listener.run(factory.clone(), root.child_token(), tracker.clone());
    let discover = async {
        if !config.discovery.enabled {
            return Ok(());
        }
        let discovery = DiscoveryLoop::new(
            ProcTable::new(&config.discovery.proc_root),
            config.discovery.key_env.clone(),
            config.discovery.interval(),
            factory.clone(),
        );
        let result = discovery.run(root.child_token(), tracker.clone()).await;
        if let Err(e) = &result {
            error!("namespace discovery stopped: {e}");
            root.cancel();
        }
        result
    };

    let ((), discovered) = tokio::join!(listen, discover);

    info!("waiting for sessions to drain");
    root.cancel();
    tracker.close();
    tracker.wait().await;
    info!("all sessions stopped");

    discovered.context("namespace discovery failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_and_removes_socket() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.server.socket = dir.path().join("meshvisor.sock");
        config.server.scratch_dir = Some(dir.path().join("scratch"));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let config = config.clone();
            let shutdown = shutdown.clone();
            async move { serve(&config, shutdown).await }
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !config.server.socket.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(dir.path().join("scratch").is_dir());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(!config.server.socket.exists());
    }

    #[tokio::test]
    async fn test_discovery_failure_stops_server() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.server.socket = dir.path().join("meshvisor.sock");
        config.server.scratch_dir = Some(dir.path().to_path_buf());
        config.discovery.enabled = true;
        config.discovery.proc_root = dir.path().join("no-proc");

        let result = serve(&config, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bad_socket_mode_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.server.socket = dir.path().join("meshvisor.sock");
        config.server.socket_mode = "9z".to_string();
        assert!(serve(&config, CancellationToken::new()).await.is_err());
    }
}
