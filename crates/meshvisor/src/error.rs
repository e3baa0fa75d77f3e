//! Session error types.

use meshvisor_protocol::ProtocolError;
use thiserror::Error;

use crate::synth::SynthesisError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that end a session. None of them affect sibling sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Could not reserve a local admin endpoint.
    #[error("admin endpoint: {0}")]
    AdminBind(#[source] std::io::Error),

    /// Message channel failure while talking to the session's client.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client's init request carried no namespace descriptor.
    #[error("no network namespace handle received")]
    MissingNamespace,

    /// Credentials were already consumed (origins hand them out once).
    #[error("credentials already taken")]
    CredentialsTaken,

    /// Scratch directory could not be created or written.
    #[error("scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    /// Daemon configuration could not be produced.
    #[error("config synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    /// Tunnel device could not be created inside the namespace.
    #[error("tunnel provisioning failed: {0}")]
    Tunnel(#[source] std::io::Error),

    /// The daemon executable could not be started.
    #[error("failed to start daemon {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The session was cancelled before it got going.
    #[error("session cancelled")]
    Cancelled,
}
