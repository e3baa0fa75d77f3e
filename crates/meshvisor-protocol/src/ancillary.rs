//! `SCM_RIGHTS` send/receive on a non-blocking Unix stream socket.
//!
//! Both functions perform a single syscall and surface `WouldBlock`
//! unchanged, so callers drive them from tokio's readiness loop.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};

use crate::header::MAX_HANDLES;

/// Send `bytes`, attaching `handles` when non-empty. Returns bytes written.
pub(crate) fn send_with_handles(
    socket: impl AsFd,
    bytes: &[u8],
    handles: &[BorrowedFd<'_>],
) -> io::Result<usize> {
    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_HANDLES))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !handles.is_empty() && !control.push(SendAncillaryMessage::ScmRights(handles)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptors do not fit the control buffer",
        ));
    }
    let written = sendmsg(socket, &[IoSlice::new(bytes)], &mut control, SendFlags::empty())?;
    Ok(written)
}

/// Receive into `buf`, appending any descriptors delivered with the bytes.
pub(crate) fn recv_with_handles(
    socket: impl AsFd,
    buf: &mut [u8],
    handles: &mut Vec<OwnedFd>,
) -> io::Result<RecvOutcome> {
    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_HANDLES))];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let msg = recvmsg(socket, &mut [IoSliceMut::new(buf)], &mut control, recv_flags())?;
    for message in control.drain() {
        if let RecvAncillaryMessage::ScmRights(fds) = message {
            handles.extend(fds);
        }
    }
    Ok(RecvOutcome {
        bytes: msg.bytes,
        control_truncated: msg.flags.contains(ReturnFlags::CTRUNC),
    })
}

pub(crate) struct RecvOutcome {
    pub bytes: usize,
    pub control_truncated: bool,
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn recv_flags() -> RecvFlags {
    RecvFlags::CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn recv_flags() -> RecvFlags {
    RecvFlags::empty()
}
