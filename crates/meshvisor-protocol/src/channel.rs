//! Duplex message channel over a Unix-domain stream socket.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

use log::trace;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::ancillary::{recv_with_handles, send_with_handles};
use crate::error::{ProtocolError, ProtocolResult};
use crate::header::{HEADER_LEN, Header, MessageKind};

/// A received message. The receiver owns the attached descriptors; they are
/// closed when the message (or the taken handle) is dropped.
#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub handles: Vec<OwnedFd>,
}

impl Message {
    /// Take the first attached descriptor, if any.
    pub fn take_handle(&mut self) -> Option<OwnedFd> {
        if self.handles.is_empty() {
            None
        } else {
            Some(self.handles.remove(0))
        }
    }
}

/// Framed channel. `send` and `recv` may run concurrently from different
/// tasks; each direction is serialized on its own lock so frames never
/// interleave.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    /// Connect to a listening socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> ProtocolResult<Self> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }

    /// Send one message. Payload bytes and descriptors leave in a single
    /// `sendmsg`; a short write is completed without ancillary data.
    pub async fn send(
        &self,
        kind: MessageKind,
        sequence: u32,
        payload: &[u8],
        handles: &[BorrowedFd<'_>],
    ) -> ProtocolResult<()> {
        let header = Header::describe(kind, sequence, payload, handles.len())?;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);

        let _guard = self.send_lock.lock().await;
        let mut written = self
            .stream
            .async_io(Interest::WRITABLE, || {
                send_with_handles(&self.stream, &frame, handles)
            })
            .await?;
        while written < frame.len() {
            let n = self
                .stream
                .async_io(Interest::WRITABLE, || {
                    send_with_handles(&self.stream, &frame[written..], &[])
                })
                .await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            written += n;
        }
        trace!(
            "sent {} seq={} len={} handles={}",
            kind,
            sequence,
            payload.len(),
            handles.len()
        );
        Ok(())
    }

    /// Send a heartbeat (empty payload, no descriptors).
    pub async fn send_heartbeat(&self, sequence: u32) -> ProtocolResult<()> {
        self.send(MessageKind::Heartbeat, sequence, &[], &[]).await
    }

    /// Receive exactly one message.
    ///
    /// A frame whose received descriptor count differs from the declared
    /// count is rejected; any descriptors that did arrive are closed.
    pub async fn recv(&self) -> ProtocolResult<Message> {
        let _guard = self.recv_lock.lock().await;
        let mut handles = Vec::new();

        let mut head = [0u8; HEADER_LEN];
        let filled = self.fill(&mut head, &mut handles).await?;
        if filled == 0 {
            return Err(ProtocolError::Closed);
        }
        if filled < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                received: filled,
            });
        }
        let header = Header::decode(&head)?;

        let mut payload = vec![0u8; header.length as usize];
        let filled = self.fill(&mut payload, &mut handles).await?;
        if filled < payload.len() {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN + payload.len(),
                received: HEADER_LEN + filled,
            });
        }

        if handles.len() != header.handles as usize {
            return Err(ProtocolError::HandleMismatch {
                declared: header.handles as usize,
                received: handles.len(),
            });
        }

        trace!(
            "received {} seq={} len={} handles={}",
            header.kind,
            header.sequence,
            header.length,
            handles.len()
        );
        Ok(Message {
            kind: header.kind,
            sequence: header.sequence,
            payload,
            handles,
        })
    }

    /// Receive one message and require it to be of `expected` kind.
    pub async fn recv_kind(&self, expected: MessageKind) -> ProtocolResult<Message> {
        let message = self.recv().await?;
        if message.kind != expected {
            return Err(ProtocolError::UnexpectedKind {
                expected,
                received: message.kind,
            });
        }
        Ok(message)
    }

    /// Wait until the peer closes its end, discarding anything it sends.
    pub async fn closed(&self) -> ProtocolResult<()> {
        let _guard = self.recv_lock.lock().await;
        let mut sink = [0u8; 256];
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(&mut sink) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read until `buf` is full or the peer closes. Returns bytes filled.
    async fn fill(&self, buf: &mut [u8], handles: &mut Vec<OwnedFd>) -> ProtocolResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let outcome = self
                .stream
                .async_io(Interest::READABLE, || {
                    recv_with_handles(&self.stream, &mut buf[filled..], handles)
                })
                .await?;
            if outcome.control_truncated {
                return Err(ProtocolError::AncillaryTruncated);
            }
            if outcome.bytes == 0 {
                break;
            }
            filled += outcome.bytes;
        }
        Ok(filled)
    }
}
