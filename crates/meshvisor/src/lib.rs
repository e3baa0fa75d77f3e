//! meshvisor: provisions and supervises one mesh daemon instance per client
//! session or discovered network namespace.
//!
//! A session binds an admin endpoint, receives a key and a namespace handle,
//! synthesizes the daemon configuration, creates a tunnel device inside the
//! namespace and then keeps the daemon running until its origin goes quiet
//! or the server shuts down.

pub mod admin;
pub mod bencode;
pub mod config;
pub mod discovery;
pub mod error;
pub mod key;
pub mod listener;
pub mod origin;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod synth;
pub mod tunnel;
pub mod watchdog;

pub use config::{AppConfig, Peer};
pub use error::{SessionError, SessionResult};
pub use key::{PrivateKey, PublicKey};
pub use session::{SessionContext, SessionEvent, SessionHandler, SessionState};
