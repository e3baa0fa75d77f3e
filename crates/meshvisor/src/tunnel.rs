//! Tunnel device creation inside a network namespace.

use std::io;
use std::net::Ipv6Addr;
use std::os::fd::OwnedFd;

use async_trait::async_trait;
use log::debug;
use tokio::sync::oneshot;

/// Creates the tunnel device a daemon instance is bound to.
#[async_trait]
pub trait TunnelProvisioner: Send + Sync {
    /// Create a tunnel device inside `namespace` and return its descriptor.
    /// `address` is the node address the daemon will assign to it.
    async fn create_tunnel(
        &self,
        namespace: &OwnedFd,
        address: Ipv6Addr,
        mtu: u32,
    ) -> io::Result<OwnedFd>;
}

/// Opens `/dev/net/tun` from a short-lived thread that has joined the
/// target namespace. Namespace membership is per thread, so the switch never
/// touches runtime workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceTunnel;

#[async_trait]
impl TunnelProvisioner for NamespaceTunnel {
    async fn create_tunnel(
        &self,
        namespace: &OwnedFd,
        address: Ipv6Addr,
        mtu: u32,
    ) -> io::Result<OwnedFd> {
        let namespace = namespace.try_clone()?;
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("tun-provision".to_string())
            .spawn(move || {
                let _ = tx.send(sys::open_tunnel(namespace, mtu));
            })?;
        let tunnel = rx
            .await
            .map_err(|_| io::Error::other("tunnel provisioning thread vanished"))??;
        debug!("tunnel device ready for {address} (mtu {mtu})");
        Ok(tunnel)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::fs::OpenOptions;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    const TUNSETIFF: u64 = 0x4004_54ca;
    const SIOCSIFMTU: u64 = 0x8922;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFNAMSIZ: usize = 16;

    /// `struct ifreq`: interface name followed by a 24-byte union.
    #[repr(C)]
    pub(super) struct IfReq {
        name: [u8; IFNAMSIZ],
        data: [u8; 24],
    }

    impl IfReq {
        fn new() -> Self {
            Self {
                name: [0; IFNAMSIZ],
                data: [0; 24],
            }
        }
    }

    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub(super) fn open_tunnel(namespace: OwnedFd, mtu: u32) -> io::Result<OwnedFd> {
        // SAFETY: `namespace` is a valid open descriptor for the call.
        check(unsafe { libc::setns(namespace.as_raw_fd(), libc::CLONE_NEWNET) })?;
        drop(namespace);

        let tun: OwnedFd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?
            .into();

        let mut req = IfReq::new();
        req.data[..2].copy_from_slice(&IFF_TUN.to_ne_bytes());
        // SAFETY: `req` is a properly sized ifreq living across the call.
        check(unsafe { libc::ioctl(tun.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) })?;
        let end = req.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        log::debug!("created {}", String::from_utf8_lossy(&req.name[..end]));

        let ctl = std::net::UdpSocket::bind("0.0.0.0:0")
            .or_else(|_| std::net::UdpSocket::bind("[::]:0"))?;
        req.data = [0; 24];
        req.data[..4].copy_from_slice(&(mtu as libc::c_int).to_ne_bytes());
        // SAFETY: as above; the kernel filled in the interface name.
        check(unsafe { libc::ioctl(ctl.as_raw_fd(), SIOCSIFMTU as _, &mut req as *mut IfReq) })?;

        Ok(tun)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::os::fd::OwnedFd;

    pub(super) fn open_tunnel(_namespace: OwnedFd, _mtu: u32) -> io::Result<OwnedFd> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "network namespaces are only available on Linux",
        ))
    }
}
