//! Session handler: drives one daemon instance from credential intake to
//! teardown.
//!
//! ```text
//! Init -> BindAdmin -> AwaitCredentials -> Synthesize -> ProvisionTunnel
//!      -> Supervise (start, hand off tunnel, ready, wait, restart...)
//!      -> Draining -> Terminated
//! ```
//!
//! Every resource a session acquires (admin socket, scratch directory,
//! namespace and tunnel descriptors) is a local owned by [`SessionHandler::drive`],
//! so it is released on whichever path the session ends. Spawned tasks go on
//! the session's [`TaskTracker`] and are joined before `run` returns.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admin::{AdminConnector, AdminEndpoint, AdminSocket};
use crate::config::{AppConfig, Peer};
use crate::error::{SessionError, SessionResult};
use crate::origin::SessionOrigin;
use crate::rendezvous;
use crate::supervisor::DaemonProcess;
use crate::synth::{ConfigSynthesizer, SynthesisRequest};
use crate::tunnel::TunnelProvisioner;
use crate::watchdog;

const RENDEZVOUS_SOCKET: &str = "cjdnstun.socket";
const CONFIG_FILE: &str = "cjdroute.conf";

/// Per-session settings taken from the application config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub daemon: String,
    pub mtu: u32,
    pub rendezvous_attempts: u32,
    pub rendezvous_delay: Duration,
    pub stop_timeout: Duration,
    pub watchdog_timeout: Duration,
    pub scratch_dir: PathBuf,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            daemon: config.daemon.binary.clone(),
            mtu: config.daemon.mtu,
            rendezvous_attempts: config.daemon.rendezvous_attempts,
            rendezvous_delay: Duration::from_millis(config.daemon.rendezvous_delay_ms),
            stop_timeout: Duration::from_secs(config.daemon.stop_timeout_secs),
            watchdog_timeout: config.watchdog.timeout(),
            scratch_dir: config.server.scratch_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    BindAdmin,
    AwaitCredentials,
    Synthesize,
    ProvisionTunnel,
    Supervise,
    Draining,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::BindAdmin => "bind-admin",
            Self::AwaitCredentials => "await-credentials",
            Self::Synthesize => "synthesize",
            Self::ProvisionTunnel => "provision-tunnel",
            Self::Supervise => "supervise",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Observable progress of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    AdminBound(SocketAddr),
    ScratchCreated(PathBuf),
    DaemonStarted { attempt: u64, pid: Option<u32> },
    ReadySent { attempt: u64 },
    /// `status` is `None` when waiting on the process failed.
    DaemonExited { attempt: u64, status: Option<ExitStatus> },
    Stopped,
}

/// Events tagged with the session label.
pub type EventSender = mpsc::UnboundedSender<(String, SessionEvent)>;

/// Shared, read-only dependencies of every session.
pub struct SessionContext {
    pub settings: SessionSettings,
    pub peer: Arc<Peer>,
    pub synthesizer: Arc<dyn ConfigSynthesizer>,
    pub tunnels: Arc<dyn TunnelProvisioner>,
    pub admin: Arc<dyn AdminConnector>,
    pub events: Option<EventSender>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("settings", &self.settings)
            .field("peer", &self.peer.address)
            .finish_non_exhaustive()
    }
}

pub struct SessionHandler {
    ctx: Arc<SessionContext>,
    origin: Arc<dyn SessionOrigin>,
    label: String,
}

impl SessionHandler {
    pub fn new(ctx: Arc<SessionContext>, origin: Arc<dyn SessionOrigin>) -> Self {
        let label = origin.label().to_string();
        Self { ctx, origin, label }
    }

    /// Run the session until it is cancelled or fails. All tasks the session
    /// spawned have finished when this returns.
    pub async fn run(self, token: CancellationToken) -> SessionResult<()> {
        let tracker = TaskTracker::new();
        self.transition(SessionState::Init);

        let result = self.drive(&token, &tracker).await;

        self.transition(SessionState::Draining);
        token.cancel();
        tracker.close();
        tracker.wait().await;
        self.transition(SessionState::Terminated);
        self.emit(SessionEvent::Stopped);
        result
    }

    async fn drive(&self, token: &CancellationToken, tracker: &TaskTracker) -> SessionResult<()> {
        let settings = &self.ctx.settings;
        let label = &self.label;

        self.transition(SessionState::BindAdmin);
        let admin_socket = AdminSocket::bind_ephemeral().map_err(SessionError::AdminBind)?;
        info!("[{label}] admin endpoint {}", admin_socket.local_addr());
        self.emit(SessionEvent::AdminBound(admin_socket.local_addr()));

        self.transition(SessionState::AwaitCredentials);
        let credentials = cancellable(token, self.origin.receive_credentials()).await??;

        let suffix = credentials
            .private_key
            .as_ref()
            .map(|key| format!("-{}", key.public_key().address()))
            .unwrap_or_default();
        let scratch = tempfile::Builder::new()
            .prefix(&format!("meshvisor-session{suffix}-"))
            .tempdir_in(&settings.scratch_dir)
            .map_err(SessionError::Scratch)?;
        info!("[{label}] session directory {}", scratch.path().display());
        self.emit(SessionEvent::ScratchCreated(scratch.path().to_path_buf()));
        let rendezvous = scratch.path().join(RENDEZVOUS_SOCKET);

        self.transition(SessionState::Synthesize);
        let admin_bind = admin_socket.bind_string();
        let request = SynthesisRequest {
            daemon: &settings.daemon,
            rendezvous: &rendezvous,
            admin_bind: &admin_bind,
            peer: &self.ctx.peer,
            private_key: credentials.private_key.as_ref(),
        };
        let synthesized = cancellable(token, self.ctx.synthesizer.synthesize(request)).await??;
        let config_path = scratch.path().join(CONFIG_FILE);
        tokio::fs::write(&config_path, &synthesized.config)
            .await
            .map_err(SessionError::Scratch)?;
        debug!("[{label}] configuration written to {}", config_path.display());
        let endpoint = AdminEndpoint {
            addr: admin_socket.local_addr(),
            password: synthesized.admin_password.clone(),
        };

        self.transition(SessionState::ProvisionTunnel);
        let tunnel = cancellable(
            token,
            self.ctx
                .tunnels
                .create_tunnel(&credentials.namespace, synthesized.address, settings.mtu),
        )
        .await?
        .map_err(SessionError::Tunnel)?;
        info!(
            "[{label}] tunnel provisioned for {} (mtu {})",
            synthesized.address, settings.mtu
        );

        self.transition(SessionState::Supervise);
        tracker.spawn(watchdog::watch(
            self.origin.clone(),
            settings.watchdog_timeout,
            token.clone(),
        ));

        let result = self
            .supervise(
                &synthesized.config,
                &rendezvous,
                Arc::new(tunnel),
                &endpoint,
                token,
                tracker,
            )
            .await;
        info!("[{label}] stopped {}", synthesized.address);
        result
    }

    /// Start, watch and restart the daemon until the session is cancelled.
    async fn supervise(
        &self,
        config: &str,
        rendezvous: &Path,
        tunnel: Arc<OwnedFd>,
        endpoint: &AdminEndpoint,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> SessionResult<()> {
        let settings = &self.ctx.settings;
        let label = &self.label;
        let mut attempt = 0u64;

        while !token.is_cancelled() {
            attempt += 1;
            let instance = token.child_token();

            info!("[{label}] starting {} (attempt {attempt})", settings.daemon);
            let mut process = DaemonProcess::start(&settings.daemon, config)
                .await
                .map_err(|source| SessionError::Spawn {
                    binary: settings.daemon.clone(),
                    source,
                })?;
            self.emit(SessionEvent::DaemonStarted {
                attempt,
                pid: process.pid(),
            });

            let path = rendezvous.to_path_buf();
            let handoff_label = label.clone();
            let tunnel = tunnel.clone();
            let attempts = settings.rendezvous_attempts;
            let delay = settings.rendezvous_delay;
            let handoff_token = instance.clone();
            tracker.spawn(async move {
                rendezvous::hand_off(&path, tunnel, attempts, delay, handoff_token, &handoff_label)
                    .await;
            });

            // A client that stopped reading can stall this send indefinitely.
            let ready = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                sent = self.origin.send_ready() => Some(sent),
            };
            match ready {
                Some(Ok(())) => self.emit(SessionEvent::ReadySent { attempt }),
                Some(Err(e)) => {
                    warn!("[{label}] could not send ready: {e}");
                    process
                        .stop(self.ctx.admin.as_ref(), endpoint, settings.stop_timeout, label)
                        .await;
                    instance.cancel();
                    return Err(e);
                }
                None => {
                    debug!("[{label}] cancelled before ready was delivered");
                    process
                        .stop(self.ctx.admin.as_ref(), endpoint, settings.stop_timeout, label)
                        .await;
                    instance.cancel();
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    process
                        .stop(self.ctx.admin.as_ref(), endpoint, settings.stop_timeout, label)
                        .await;
                }
                status = process.wait() => {
                    match &status {
                        Ok(status) => info!("[{label}] daemon terminated: {status}"),
                        Err(e) => warn!("[{label}] waiting for daemon: {e}"),
                    }
                    self.emit(SessionEvent::DaemonExited {
                        attempt,
                        status: status.ok(),
                    });
                }
            }
            instance.cancel();
        }
        Ok(())
    }

    fn transition(&self, state: SessionState) {
        debug!("[{}] {state}", self.label);
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.ctx.events {
            let _ = events.send((self.label.clone(), event));
        }
    }
}

/// Run `fut` unless `token` is cancelled first.
async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> SessionResult<F::Output> {
    tokio::select! {
        _ = token.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}

/// How the listener and the discovery loop start sessions.
pub trait SessionFactory: Send + Sync {
    /// Build the future that runs one session to completion.
    fn start(&self, origin: Arc<dyn SessionOrigin>, token: CancellationToken) -> BoxFuture<'static, ()>;
}

/// Runs [`SessionHandler`]s against a shared context and logs how they end.
#[derive(Debug, Clone)]
pub struct Sessions {
    ctx: Arc<SessionContext>,
}

impl Sessions {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }
}

impl SessionFactory for Sessions {
    fn start(&self, origin: Arc<dyn SessionOrigin>, token: CancellationToken) -> BoxFuture<'static, ()> {
        let handler = SessionHandler::new(self.ctx.clone(), origin);
        Box::pin(async move {
            let label = handler.label.clone();
            match handler.run(token).await {
                Ok(()) => info!("[{label}] session ended"),
                Err(SessionError::Cancelled) => info!("[{label}] session cancelled before start"),
                Err(e) => warn!("[{label}] session failed: {e}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::AwaitCredentials.to_string(), "await-credentials");
        assert_eq!(SessionState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = AppConfig::default();
        config.daemon.rendezvous_delay_ms = 25;
        config.watchdog.timeout_secs = 90;
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.rendezvous_delay, Duration::from_millis(25));
        assert_eq!(settings.watchdog_timeout, Duration::from_secs(90));
        assert_eq!(settings.mtu, 1304);
        assert_eq!(settings.daemon, "cjdroute");
    }
}
