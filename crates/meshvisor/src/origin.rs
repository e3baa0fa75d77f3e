//! Where a session's credentials and liveness come from.
//!
//! A session is started either by a client connecting to the control socket
//! or by the discovery loop finding a namespace. Both are [`SessionOrigin`]s:
//! they hand over credentials once, are told when the daemon is ready, and
//! deliver heartbeats to the watchdog.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use meshvisor_protocol::{Channel, MessageKind, ProtocolError};
use tokio::sync::{Mutex, mpsc};

use crate::error::{SessionError, SessionResult};
use crate::key::{KEY_LEN, PrivateKey};

/// What a session needs from its originator before provisioning.
#[derive(Debug)]
pub struct Credentials {
    pub private_key: Option<PrivateKey>,
    pub namespace: OwnedFd,
}

#[async_trait]
pub trait SessionOrigin: Send + Sync {
    /// Identity used in log lines.
    fn label(&self) -> &str;

    /// Obtain the key and namespace handle. Only the first call succeeds.
    async fn receive_credentials(&self) -> SessionResult<Credentials>;

    /// Tell the originator the daemon has been started.
    async fn send_ready(&self) -> SessionResult<()>;

    /// Wait for the next heartbeat. Errors for which
    /// [`ProtocolError::is_disconnect`] holds mean no more will come.
    async fn wait_heartbeat(&self) -> Result<(), ProtocolError>;
}

/// A client on the control socket.
#[derive(Debug)]
pub struct ClientOrigin {
    channel: Channel,
    label: String,
    sequence: AtomicU32,
}

impl ClientOrigin {
    pub fn new(channel: Channel, label: impl Into<String>) -> Self {
        Self {
            channel,
            label: label.into(),
            sequence: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SessionOrigin for ClientOrigin {
    fn label(&self) -> &str {
        &self.label
    }

    async fn receive_credentials(&self) -> SessionResult<Credentials> {
        let mut message = self.channel.recv_kind(MessageKind::InitRequest).await?;
        let private_key = match message.payload.len() {
            0 => None,
            KEY_LEN => PrivateKey::from_bytes(&message.payload).ok(),
            other => {
                warn!("[{}] ignoring {other}-byte key payload", self.label);
                None
            }
        };
        let namespace = message.take_handle().ok_or(SessionError::MissingNamespace)?;
        debug!(
            "[{}] credentials received (key: {})",
            self.label,
            if private_key.is_some() { "yes" } else { "no" }
        );
        Ok(Credentials {
            private_key,
            namespace,
        })
    }

    async fn send_ready(&self) -> SessionResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.channel
            .send(MessageKind::InitResponse, sequence, &[], &[])
            .await?;
        Ok(())
    }

    async fn wait_heartbeat(&self) -> Result<(), ProtocolError> {
        self.channel.recv_kind(MessageKind::Heartbeat).await.map(|_| ())
    }
}

/// A namespace found by the discovery loop. Heartbeats are pokes sent each
/// scan cycle the namespace is still present.
#[derive(Debug)]
pub struct NamespaceOrigin {
    label: String,
    credentials: std::sync::Mutex<Option<Credentials>>,
    pokes: Mutex<mpsc::Receiver<()>>,
}

impl NamespaceOrigin {
    pub fn new(
        inode: u64,
        namespace: OwnedFd,
        private_key: Option<PrivateKey>,
        pokes: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            label: format!("netns:{inode}"),
            credentials: std::sync::Mutex::new(Some(Credentials {
                private_key,
                namespace,
            })),
            pokes: Mutex::new(pokes),
        }
    }
}

#[async_trait]
impl SessionOrigin for NamespaceOrigin {
    fn label(&self) -> &str {
        &self.label
    }

    async fn receive_credentials(&self) -> SessionResult<Credentials> {
        self.credentials
            .lock()
            .map_err(|_| SessionError::CredentialsTaken)?
            .take()
            .ok_or(SessionError::CredentialsTaken)
    }

    async fn send_ready(&self) -> SessionResult<()> {
        Ok(())
    }

    async fn wait_heartbeat(&self) -> Result<(), ProtocolError> {
        match self.pokes.lock().await.recv().await {
            Some(()) => Ok(()),
            None => Err(ProtocolError::Closed),
        }
    }
}
