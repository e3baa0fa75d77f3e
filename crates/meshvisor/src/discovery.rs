//! Network namespace discovery.
//!
//! Every interval the process table is scanned for processes that own a
//! network namespace other than ours and are the init of their own pid
//! namespace (container inits). Each such namespace gets a session; the
//! registry is marked and swept per cycle so a namespace that disappears
//! has its session cancelled after exactly one sweep.
//!
//! The registry is owned by the loop. Sessions hear from it only through a
//! capacity-one poke channel that is never awaited on.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::key::PrivateKey;
use crate::origin::NamespaceOrigin;
use crate::session::SessionFactory;

/// A process owning a namespace worth a session.
#[derive(Debug)]
pub struct Candidate {
    pub pid: u32,
    /// Inode of the process's network namespace.
    pub netns: u64,
    pub netns_path: PathBuf,
    pub private_key: Option<PrivateKey>,
}

/// Read-only view of a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
}

impl ProcTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Network namespace of this process.
    pub fn self_netns(&self) -> io::Result<u64> {
        ns_inode(&self.root.join("self/ns/net"))
    }

    /// List candidates. Failing to read our own namespace or the process
    /// list is an error; anything wrong with a single process skips it.
    pub fn scan(&self, key_env: &str) -> io::Result<Vec<Candidate>> {
        let host = self.self_netns()?;
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            match self.inspect(pid, host, key_env) {
                Ok(Some(candidate)) => found.push(candidate),
                Ok(None) => {}
                Err(e) => debug!("skipping pid {pid}: {e}"),
            }
        }
        Ok(found)
    }

    fn inspect(&self, pid: u32, host: u64, key_env: &str) -> io::Result<Option<Candidate>> {
        let dir = self.root.join(pid.to_string());
        let netns_path = dir.join("ns/net");
        let netns = ns_inode(&netns_path)?;
        if netns == host {
            return Ok(None);
        }

        let ppid = self.parent_pid(pid)?;
        if ppid == 0 {
            return Ok(None);
        }
        let pidns = ns_inode(&dir.join("ns/pid"))?;
        let parent_pidns = ns_inode(&self.root.join(ppid.to_string()).join("ns/pid"))?;
        if pidns == parent_pidns {
            // An ordinary process inside some container.
            return Ok(None);
        }

        let private_key = match self.environ_var(pid, key_env)? {
            None => None,
            Some(text) if text.is_empty() => None,
            Some(text) => match PrivateKey::from_hex(&text) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("pid {pid}: ignoring namespace with bad {key_env}: {e}");
                    return Ok(None);
                }
            },
        };

        Ok(Some(Candidate {
            pid,
            netns,
            netns_path,
            private_key,
        }))
    }

    /// `PPid` from `<pid>/status`.
    pub fn parent_pid(&self, pid: u32) -> io::Result<u32> {
        let status = fs::read_to_string(self.root.join(pid.to_string()).join("status"))?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("PPid:"))
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no PPid in status"))
    }

    /// Value of `name` in the process environment, if set.
    pub fn environ_var(&self, pid: u32, name: &str) -> io::Result<Option<String>> {
        let environ = fs::read(self.root.join(pid.to_string()).join("environ"))?;
        let value = environ
            .split(|&b| b == 0)
            .find_map(|entry| {
                let eq = entry.iter().position(|&b| b == b'=')?;
                (entry[..eq] == *name.as_bytes()).then(|| &entry[eq + 1..])
            })
            .map(|v| String::from_utf8_lossy(v).into_owned());
        Ok(value)
    }
}

fn ns_inode(path: &Path) -> io::Result<u64> {
    Ok(fs::metadata(path)?.ino())
}

/// What one cycle changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub added: Vec<u64>,
    pub removed: Vec<u64>,
    pub tracked: usize,
}

struct Tracked {
    token: CancellationToken,
    pokes: mpsc::Sender<()>,
    seen: bool,
}

pub struct DiscoveryLoop {
    table: ProcTable,
    key_env: String,
    interval: Duration,
    factory: Arc<dyn SessionFactory>,
    registry: HashMap<u64, Tracked>,
}

impl DiscoveryLoop {
    pub fn new(
        table: ProcTable,
        key_env: impl Into<String>,
        interval: Duration,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            table,
            key_env: key_env.into(),
            interval,
            factory,
            registry: HashMap::new(),
        }
    }

    /// Scan until `token` is cancelled. Sessions are spawned on `tracker`
    /// with tokens derived from `token`.
    pub async fn run(mut self, token: CancellationToken, tracker: TaskTracker) -> io::Result<()> {
        info!("namespace discovery every {}ms", self.interval.as_millis());
        let result = self.scan_loop(&token, &tracker).await;
        for tracked in self.registry.values() {
            tracked.token.cancel();
        }
        self.registry.clear();
        result
    }

    async fn scan_loop(&mut self, token: &CancellationToken, tracker: &TaskTracker) -> io::Result<()> {
        loop {
            let report = self.scan_once(token, tracker).await?;
            if !report.added.is_empty() || !report.removed.is_empty() {
                debug!(
                    "discovery: +{} -{} tracking {}",
                    report.added.len(),
                    report.removed.len(),
                    report.tracked
                );
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One mark-and-sweep cycle.
    pub async fn scan_once(
        &mut self,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> io::Result<ScanReport> {
        let mut report = ScanReport::default();

        self.registry.retain(|inode, tracked| {
            let live = !tracked.token.is_cancelled();
            if !live {
                debug!("netns:{inode} session ended, forgetting it");
            }
            live
        });
        for tracked in self.registry.values_mut() {
            tracked.seen = false;
        }

        let table = self.table.clone();
        let key_env = self.key_env.clone();
        let candidates = tokio::task::spawn_blocking(move || table.scan(&key_env))
            .await
            .map_err(io::Error::other)??;

        for candidate in candidates {
            if let Some(tracked) = self.registry.get_mut(&candidate.netns) {
                tracked.seen = true;
                let _ = tracked.pokes.try_send(());
                continue;
            }

            let namespace = match File::open(&candidate.netns_path) {
                Ok(file) => OwnedFd::from(file),
                Err(e) => {
                    warn!("{}: {e}", candidate.netns_path.display());
                    continue;
                }
            };
            info!(
                "new network namespace {} for pid {}",
                candidate.netns, candidate.pid
            );
            let (pokes, poke_rx) = mpsc::channel(1);
            let session = token.child_token();
            let origin = Arc::new(NamespaceOrigin::new(
                candidate.netns,
                namespace,
                candidate.private_key,
                poke_rx,
            ));
            tracker.spawn(self.factory.start(origin, session.clone()));
            self.registry.insert(
                candidate.netns,
                Tracked {
                    token: session,
                    pokes,
                    seen: true,
                },
            );
            report.added.push(candidate.netns);
        }

        let gone: Vec<u64> = self
            .registry
            .iter()
            .filter(|(_, tracked)| !tracked.seen)
            .map(|(inode, _)| *inode)
            .collect();
        for inode in gone {
            if let Some(tracked) = self.registry.remove(&inode) {
                info!("network namespace {inode} disappeared");
                tracked.token.cancel();
                report.removed.push(inode);
            }
        }

        report.tracked = self.registry.len();
        Ok(report)
    }
}
