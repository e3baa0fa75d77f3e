//! Daemon subprocess control.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::admin::{AdminConnector, AdminEndpoint};

/// One running daemon instance.
#[derive(Debug)]
pub struct DaemonProcess {
    child: Child,
    pid: Option<u32>,
}

impl DaemonProcess {
    /// Start `binary --nobg` and feed it `config` on stdin. Output goes to
    /// our own stdout and stderr.
    pub async fn start(binary: &str, config: &str) -> io::Result<Self> {
        let mut child = Command::new(binary)
            .arg("--nobg")
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            // A daemon that dies before reading its config shows up in wait().
            match stdin.write_all(config.as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    warn!("daemon {pid:?} closed stdin before reading its config");
                }
                Err(e) => return Err(e),
            }
        }
        debug!("started {binary} pid {pid:?}");
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send SIGTERM if the process has not been reaped yet.
    pub fn terminate(&self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: plain signal delivery to our own child.
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Graceful stop: ask the daemon to exit over its admin interface, then
    /// send one SIGTERM whatever the answer, then reap it within `timeout`.
    /// There is no escalation past SIGTERM; a daemon that ignores it is left
    /// for `kill_on_drop`.
    pub async fn stop(
        &mut self,
        admin: &dyn AdminConnector,
        endpoint: &AdminEndpoint,
        timeout: Duration,
        label: &str,
    ) {
        info!("[{label}] sending Core_exit to {}", endpoint.addr);
        match admin.connect(endpoint).await {
            Ok(mut session) => {
                if let Err(e) = session.exit().await {
                    warn!("[{label}] Core_exit: {e}");
                }
            }
            Err(e) => warn!("[{label}] connect to admin interface: {e}"),
        }

        info!("[{label}] sending SIGTERM to daemon");
        if let Err(e) = self.terminate() {
            warn!("[{label}] SIGTERM: {e}");
        }

        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(Ok(status)) => info!("[{label}] daemon stopped: {status}"),
            Ok(Err(e)) => warn!("[{label}] waiting for daemon: {e}"),
            Err(_) => warn!(
                "[{label}] daemon did not exit within {}s of SIGTERM",
                timeout.as_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminError, AdminSession};
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("daemon.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    struct CountingAdmin {
        exits: Arc<AtomicUsize>,
        reachable: bool,
    }

    struct CountingSession(Arc<AtomicUsize>);

    #[async_trait]
    impl AdminSession for CountingSession {
        async fn exit(&mut self) -> Result<(), AdminError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl AdminConnector for CountingAdmin {
        async fn connect(&self, endpoint: &AdminEndpoint) -> Result<Box<dyn AdminSession>, AdminError> {
            if self.reachable {
                Ok(Box::new(CountingSession(self.exits.clone())))
            } else {
                Err(AdminError::Timeout(endpoint.addr))
            }
        }
    }

    fn endpoint() -> AdminEndpoint {
        AdminEndpoint {
            addr: "127.0.0.1:1".parse().unwrap(),
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn test_config_is_fed_on_stdin() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("seen.conf");
        let binary = script(dir.path(), &format!("cat > {}", out.display()));

        let mut process = DaemonProcess::start(&binary, "{\"hello\": 1}").await.unwrap();
        assert!(process.pid().is_some());
        assert!(process.wait().await.unwrap().success());
        assert_eq!(std::fs::read_to_string(out).unwrap(), "{\"hello\": 1}");
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        assert!(DaemonProcess::start("/nonexistent/cjdroute", "{}").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_sends_exit_then_sigterm() {
        let dir = tempdir().unwrap();
        let binary = script(dir.path(), "exec sleep 30");
        let mut process = DaemonProcess::start(&binary, "").await.unwrap();

        let exits = Arc::new(AtomicUsize::new(0));
        let admin = CountingAdmin {
            exits: exits.clone(),
            reachable: true,
        };
        process
            .stop(&admin, &endpoint(), Duration::from_secs(5), "test")
            .await;

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        let status = process.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_stop_signals_even_when_admin_unreachable() {
        let dir = tempdir().unwrap();
        let binary = script(dir.path(), "exec sleep 30");
        let mut process = DaemonProcess::start(&binary, "").await.unwrap();

        let admin = CountingAdmin {
            exits: Arc::new(AtomicUsize::new(0)),
            reachable: false,
        };
        process
            .stop(&admin, &endpoint(), Duration::from_secs(5), "test")
            .await;
        assert_eq!(process.wait().await.unwrap().signal(), Some(libc::SIGTERM));
    }
}
