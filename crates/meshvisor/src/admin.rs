//! Daemon admin endpoint: reservation and RPC client.
//!
//! Each session reserves a loopback UDP port before the daemon starts and
//! writes it into the daemon's config as the admin bind address. The
//! reservation socket sets `SO_REUSEPORT` so the daemon can bind the same
//! port while the session keeps holding it.
//!
//! The client speaks the cjdns admin protocol: bencoded dictionaries over
//! UDP, authenticated per call with a cookie fetched from the daemon.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use rustix::net::{AddressFamily, SocketType, sockopt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::bencode::Value;

/// Ports currently reserved by live sessions in this process.
static RESERVED_PORTS: Lazy<Mutex<HashSet<u16>>> = Lazy::new(|| Mutex::new(HashSet::new()));

const MAX_RESERVE_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("admin io error: {0}")]
    Io(#[from] io::Error),
    #[error("admin endpoint {0} did not answer in time")]
    Timeout(SocketAddr),
    #[error("malformed admin response")]
    Malformed,
    #[error("admin call failed: {0}")]
    Remote(String),
}

/// Where and how to reach a daemon's admin interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminEndpoint {
    pub addr: SocketAddr,
    pub password: String,
}

/// A reserved loopback admin port, released on drop.
#[derive(Debug)]
pub struct AdminSocket {
    // Held open for the reservation.
    _socket: StdUdpSocket,
    addr: SocketAddr,
}

impl AdminSocket {
    /// Reserve an ephemeral loopback port not held by any other session.
    pub fn bind_ephemeral() -> io::Result<Self> {
        let mut rejected = Vec::new();
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let socket = reuseport_socket()?;
            let addr = socket.local_addr()?;
            let fresh = RESERVED_PORTS
                .lock()
                .map_err(|_| io::Error::other("admin port ledger poisoned"))?
                .insert(addr.port());
            if fresh {
                return Ok(Self {
                    _socket: socket,
                    addr,
                });
            }
            debug!("admin port {} already reserved, retrying", addr.port());
            // Keep the duplicate bound until we are done so the kernel does
            // not hand it straight back.
            rejected.push(socket);
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free admin port after repeated attempts",
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind address as written into the daemon config (`ip:port`).
    pub fn bind_string(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for AdminSocket {
    fn drop(&mut self) {
        if let Ok(mut ports) = RESERVED_PORTS.lock() {
            ports.remove(&self.addr.port());
        }
    }
}

fn reuseport_socket() -> io::Result<StdUdpSocket> {
    let fd = rustix::net::socket(AddressFamily::INET, SocketType::DGRAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    sockopt::set_socket_reuseport(&fd, true)?;
    rustix::net::bind(&fd, &SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
    Ok(StdUdpSocket::from(fd))
}

/// Opens admin sessions to a running daemon.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(&self, endpoint: &AdminEndpoint) -> Result<Box<dyn AdminSession>, AdminError>;
}

/// An authenticated admin connection.
#[async_trait]
pub trait AdminSession: Send {
    /// Ask the daemon to shut down.
    async fn exit(&mut self) -> Result<(), AdminError>;
}

/// cjdns admin client.
#[derive(Debug, Clone)]
pub struct CjdnsAdmin {
    timeout: Duration,
}

impl CjdnsAdmin {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for CjdnsAdmin {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl AdminConnector for CjdnsAdmin {
    async fn connect(&self, endpoint: &AdminEndpoint) -> Result<Box<dyn AdminSession>, AdminError> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        socket.connect(endpoint.addr).await?;
        let mut session = CjdnsAdminSession {
            socket,
            peer: endpoint.addr,
            password: endpoint.password.clone(),
            timeout: self.timeout,
            txid: 0,
        };
        let txid = session.next_txid();
        let pong = session
            .roundtrip(Value::dict([("q", Value::str("ping")), ("txid", txid)]))
            .await?;
        if pong.get("q").and_then(Value::as_str) != Some("pong") {
            return Err(AdminError::Malformed);
        }
        Ok(Box::new(session))
    }
}

struct CjdnsAdminSession {
    socket: UdpSocket,
    peer: SocketAddr,
    password: String,
    timeout: Duration,
    txid: u64,
}

impl CjdnsAdminSession {
    async fn cookie(&mut self) -> Result<String, AdminError> {
        let txid = self.next_txid();
        let response = self
            .roundtrip(Value::dict([("q", Value::str("cookie")), ("txid", txid)]))
            .await?;
        response
            .get("cookie")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(AdminError::Malformed)
    }

    async fn call(&mut self, method: &str, args: Value) -> Result<Value, AdminError> {
        let cookie = self.cookie().await?;
        let txid = self.next_txid();
        let request = authenticated_request(&self.password, &cookie, method, args, txid);
        let response = self.roundtrip(request).await?;
        match response.get("error").and_then(Value::as_str) {
            None | Some("none") => Ok(response),
            Some(err) => Err(AdminError::Remote(err.to_string())),
        }
    }

    fn next_txid(&mut self) -> Value {
        self.txid += 1;
        Value::str(&self.txid.to_string())
    }

    /// Send `request` and wait for the reply carrying the same txid.
    async fn roundtrip(&mut self, request: Value) -> Result<Value, AdminError> {
        let txid = request
            .get("txid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        self.socket.send(&request.encode()).await?;

        let mut buf = vec![0u8; 64 * 1024];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let n = tokio::time::timeout_at(deadline, self.socket.recv(&mut buf))
                .await
                .map_err(|_| AdminError::Timeout(self.peer))??;
            let Some(reply) = Value::decode(&buf[..n]) else {
                warn!("discarding undecodable admin reply from {}", self.peer);
                continue;
            };
            match reply.get("txid").and_then(Value::as_str) {
                Some(id) if id != txid => continue,
                _ => return Ok(reply),
            }
        }
    }
}

#[async_trait]
impl AdminSession for CjdnsAdminSession {
    async fn exit(&mut self) -> Result<(), AdminError> {
        self.call("Core_exit", Value::Dict(Default::default()))
            .await
            .map(|_| ())
    }
}

/// Build an `auth` request: the hash field first carries
/// `sha256(password + cookie)`, then is replaced by the hash of the whole
/// encoded request, txid included.
fn authenticated_request(
    password: &str,
    cookie: &str,
    method: &str,
    args: Value,
    txid: Value,
) -> Value {
    let seed = hex::encode(Sha256::digest(format!("{password}{cookie}")));
    let mut request = Value::dict([
        ("q", Value::str("auth")),
        ("aq", Value::str(method)),
        ("args", args),
        ("cookie", Value::str(cookie)),
        ("hash", Value::str(&seed)),
        ("txid", txid),
    ]);
    let full = hex::encode(Sha256::digest(request.encode()));
    if let Value::Dict(map) = &mut request {
        map.insert(b"hash".to_vec(), Value::str(&full));
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_reservations_do_not_collide() {
        let a = AdminSocket::bind_ephemeral().unwrap();
        let b = AdminSocket::bind_ephemeral().unwrap();
        assert_ne!(a.local_addr().port(), b.local_addr().port());
        assert!(a.local_addr().ip().is_loopback());
    }

    #[test]
    fn test_drop_releases_reservation() {
        let socket = AdminSocket::bind_ephemeral().unwrap();
        let port = socket.local_addr().port();
        assert!(RESERVED_PORTS.lock().unwrap().contains(&port));
        assert!(StdUdpSocket::bind(socket.local_addr()).is_err());

        let addr = socket.local_addr();
        drop(socket);
        assert!(!RESERVED_PORTS.lock().unwrap().contains(&port));
        StdUdpSocket::bind(addr).unwrap();
    }

    #[test]
    fn test_authenticated_request_hash() {
        let request = authenticated_request(
            "secret",
            "123",
            "Core_exit",
            Value::Dict(Default::default()),
            Value::str("7"),
        );
        let hash = request.get("hash").and_then(Value::as_str).unwrap().to_string();

        // Recompute: replace the hash with the seed and hash the encoding.
        let seed = hex::encode(Sha256::digest("secret123"));
        let mut check = request.clone();
        if let Value::Dict(map) = &mut check {
            map.insert(b"hash".to_vec(), Value::str(&seed));
        }
        assert_eq!(hash, hex::encode(Sha256::digest(check.encode())));
        assert_eq!(request.get("aq").and_then(Value::as_str), Some("Core_exit"));
    }

    /// Answers ping, cookie and auth requests like a cjdns admin port.
    async fn fake_daemon(socket: UdpSocket, error: &'static str) {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let request = Value::decode(&buf[..n]).unwrap();
            let txid = request.get("txid").cloned().unwrap();
            let reply = match request.get("q").and_then(Value::as_str) {
                Some("ping") => Value::dict([("q", Value::str("pong")), ("txid", txid)]),
                Some("cookie") => Value::dict([("cookie", Value::str("42")), ("txid", txid)]),
                _ => Value::dict([("error", Value::str(error)), ("txid", txid)]),
            };
            socket.send_to(&reply.encode(), from).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_exit_against_fake_daemon() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(fake_daemon(server, "none"));

        let endpoint = AdminEndpoint {
            addr,
            password: "pw".to_string(),
        };
        let mut session = CjdnsAdmin::default().connect(&endpoint).await.unwrap();
        session.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_reported() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(fake_daemon(server, "Auth failed."));

        let endpoint = AdminEndpoint {
            addr,
            password: "wrong".to_string(),
        };
        let mut session = CjdnsAdmin::default().connect(&endpoint).await.unwrap();
        assert!(matches!(session.exit().await, Err(AdminError::Remote(msg)) if msg == "Auth failed."));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_daemon() {
        let reserved = AdminSocket::bind_ephemeral().unwrap();
        let endpoint = AdminEndpoint {
            addr: reserved.local_addr(),
            password: String::new(),
        };
        let admin = CjdnsAdmin::new(Duration::from_millis(100));
        assert!(matches!(
            admin.connect(&endpoint).await,
            Err(AdminError::Timeout(_))
        ));
    }
}
