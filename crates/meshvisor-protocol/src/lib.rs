//! Wire protocol between meshvisor and its peers.
//!
//! Every message is a fixed 16-byte header followed by an opaque payload.
//! Open file descriptors can ride along with a message; they are transferred
//! with `SCM_RIGHTS` ancillary data on a Unix-domain stream socket, together
//! with the first bytes of the frame they belong to.
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬────────────┬─────────────────┐
//! │ kind (u32) │ seq (u32)  │ len (u32)  │ fds (u32)  │ payload (len B) │
//! └────────────┴────────────┴────────────┴────────────┴─────────────────┘
//!        little-endian header, 16 bytes           + SCM_RIGHTS(fds)
//! ```
//!
//! The same framing is used in three places:
//!
//! - **control socket**: a client sends `InitRequest` (optional private key as
//!   payload, network namespace descriptor attached), waits for
//!   `InitResponse`, then keeps sending `Heartbeat` frames.
//! - **rendezvous socket**: meshvisor hands the tunnel descriptor to a freshly
//!   started daemon with a single `HandleHandoff` frame.
//!
//! Descriptor passing is a Unix capability; this crate does not build on
//! other platforms.

#[cfg(not(unix))]
compile_error!("meshvisor-protocol needs Unix-domain sockets with SCM_RIGHTS descriptor passing");

mod ancillary;
pub mod channel;
pub mod error;
pub mod header;

pub use channel::{Channel, Message};
pub use error::{ProtocolError, ProtocolResult};
pub use header::{HEADER_LEN, Header, MAX_HANDLES, MAX_PAYLOAD, MessageKind};
