//! Engine process registry and the install queue.
//!
//! The registry deduplicates engine processes across every consumer
//! (engine player, hint, hand-brain): at most one process per
//! `(name, elo section)`. Reference counting keeps a process alive while
//! anyone holds it; the process is killed a grace period after the last
//! release. The install queue serialises engine builds - one at a time,
//! queued jobs cancellable, history persisted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Db, InstallStatus};
use crate::error::{Error, Result};

use super::uci::EngineProcess;

/// Grace period between the last release and the kill.
pub const IDLE_SHUTDOWN: Duration = Duration::from_secs(60);

/// Registry key: engine name plus the Elo section it was limited to.
pub type EngineKey = (String, Option<u32>);

struct Entry {
    process: Arc<Mutex<EngineProcess>>,
    refs: AtomicUsize,
}

/// Shared engine process pool.
#[derive(Clone)]
pub struct EngineRegistry {
    engines_dir: PathBuf,
    entries: Arc<DashMap<EngineKey, Arc<Entry>>>,
    idle_shutdown: Duration,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines_dir", &self.engines_dir)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A counted lease on a shared engine process. Dropping it releases the
/// reference; the process dies [`IDLE_SHUTDOWN`] after the last lease.
pub struct EngineLease {
    key: EngineKey,
    process: Arc<Mutex<EngineProcess>>,
    registry: EngineRegistry,
}

impl std::fmt::Debug for EngineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease").field("key", &self.key).finish()
    }
}

impl EngineLease {
    /// The shared process. Lock it for the duration of one UCI exchange.
    pub fn process(&self) -> Arc<Mutex<EngineProcess>> {
        self.process.clone()
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

impl EngineRegistry {
    /// A registry resolving engine names inside `engines_dir`.
    pub fn new(engines_dir: PathBuf) -> EngineRegistry {
        EngineRegistry {
            engines_dir,
            entries: Arc::new(DashMap::new()),
            idle_shutdown: IDLE_SHUTDOWN,
        }
    }

    #[cfg(test)]
    fn with_idle_shutdown(engines_dir: PathBuf, idle: Duration) -> EngineRegistry {
        EngineRegistry {
            engines_dir,
            entries: Arc::new(DashMap::new()),
            idle_shutdown: idle,
        }
    }

    /// Acquire (spawning if needed) the engine for `(name, elo)`.
    pub async fn acquire(&self, name: &str, elo: Option<u32>) -> Result<EngineLease> {
        let key: EngineKey = (name.to_string(), elo);
        if let Some(entry) = self.entries.get(&key) {
            entry.refs.fetch_add(1, Ordering::SeqCst);
            return Ok(EngineLease {
                key,
                process: entry.process.clone(),
                registry: self.clone(),
            });
        }

        let binary = self.engines_dir.join(name);
        let process = EngineProcess::spawn(name, &binary, elo).await?;
        let entry = Arc::new(Entry {
            process: Arc::new(Mutex::new(process)),
            refs: AtomicUsize::new(1),
        });
        info!(name, ?elo, "engine process started");
        self.entries.insert(key.clone(), entry.clone());
        Ok(EngineLease {
            key,
            process: entry.process.clone(),
            registry: self.clone(),
        })
    }

    /// Evict a broken engine immediately (e.g. after `EngineFailed`).
    pub async fn evict(&self, name: &str, elo: Option<u32>) {
        let key: EngineKey = (name.to_string(), elo);
        if let Some((_, entry)) = self.entries.remove(&key) {
            warn!(name, ?elo, "evicting engine");
            entry.process.lock().await.shutdown().await;
        }
    }

    /// Live process count (for the settings screen).
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    fn release(&self, key: &EngineKey) {
        let Some(entry) = self.entries.get(key).map(|e| e.clone()) else {
            return;
        };
        let remaining = entry.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(?key, remaining, "engine lease released");
        if remaining > 0 {
            return;
        }
        let registry = self.clone();
        let key = key.clone();
        let idle = self.idle_shutdown;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(entry) = registry.entries.get(&key).map(|e| e.clone()) else {
                return;
            };
            if entry.refs.load(Ordering::SeqCst) == 0 {
                registry.entries.remove(&key);
                info!(?key, "idle engine shut down");
                entry.process.lock().await.shutdown().await;
            }
        });
    }
}

/// One queued engine build.
#[derive(Debug, Clone)]
pub struct InstallJob {
    /// Engine name (also the target binary name).
    pub name: String,
    /// Version label for the history row.
    pub version: String,
    /// Build command and arguments, run in the engines directory.
    pub command: Vec<String>,
}

/// Handle to cancel a queued or running build.
#[derive(Debug, Clone)]
pub struct InstallTicket {
    install_id: i64,
    cancel: CancellationToken,
}

impl InstallTicket {
    /// History row id.
    pub fn id(&self) -> i64 {
        self.install_id
    }

    /// Cancel the build (or drop it from the queue).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Serialised engine build queue: one compilation at a time. A Pi-class
/// device cannot survive parallel engine builds.
pub struct InstallQueue {
    tx: mpsc::UnboundedSender<(InstallJob, i64, CancellationToken)>,
    db: Db,
    worker: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for InstallQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallQueue").finish_non_exhaustive()
    }
}

impl InstallQueue {
    /// Start the queue worker.
    pub fn start(db: Db, engines_dir: PathBuf) -> InstallQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<(InstallJob, i64, CancellationToken)>();
        let worker_db = db.clone();
        let worker = tokio::spawn(async move {
            while let Some((job, install_id, cancel)) = rx.recv().await {
                if cancel.is_cancelled() {
                    let _ = worker_db.set_install_status(install_id, InstallStatus::Cancelled);
                    continue;
                }
                let _ = worker_db.set_install_status(install_id, InstallStatus::Building);
                let status = run_build(&job, &engines_dir, &cancel).await;
                let _ = worker_db.set_install_status(install_id, status);
            }
        });
        InstallQueue { tx, db, worker }
    }

    /// Enqueue a build; returns a cancellable ticket.
    pub fn enqueue(&self, job: InstallJob) -> Result<InstallTicket> {
        let install_id = self.db.record_install(&job.name, &job.version)?;
        let cancel = CancellationToken::new();
        self.tx
            .send((job, install_id, cancel.clone()))
            .map_err(|_| Error::Cancelled)?;
        Ok(InstallTicket { install_id, cancel })
    }

    /// Stop the worker; queued jobs are dropped.
    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

async fn run_build(
    job: &InstallJob,
    engines_dir: &std::path::Path,
    cancel: &CancellationToken,
) -> InstallStatus {
    let Some((program, args)) = job.command.split_first() else {
        return InstallStatus::Failed;
    };
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(engines_dir)
        .kill_on_drop(true);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(name = %job.name, error = %e, "engine build spawn failed");
            return InstallStatus::Failed;
        }
    };
    tokio::select! {
        outcome = child.wait() => match outcome {
            Ok(status) if status.success() => {
                info!(name = %job.name, "engine build finished");
                InstallStatus::Done
            }
            Ok(status) => {
                warn!(name = %job.name, ?status, "engine build failed");
                InstallStatus::Failed
            }
            Err(e) => {
                warn!(name = %job.name, error = %e, "engine build wait failed");
                InstallStatus::Failed
            }
        },
        () = cancel.cancelled() => {
            warn!(name = %job.name, "engine build cancelled");
            let _ = child.kill().await;
            InstallStatus::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_spawn_leaves_no_registry_entry() {
        let registry =
            EngineRegistry::with_idle_shutdown(PathBuf::from("/nonexistent"), Duration::ZERO);
        let a = registry.acquire("missing", None).await;
        assert!(matches!(a, Err(Error::EngineFailed { .. })));
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn install_queue_serialises_and_records_history() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let queue = InstallQueue::start(db.clone(), dir.path().to_path_buf());

        let ticket = queue
            .enqueue(InstallJob {
                name: "true-engine".into(),
                version: "1".into(),
                command: vec!["true".into()],
            })
            .unwrap();
        assert!(ticket.id() > 0);

        // the command exits immediately; give the worker a moment
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.shutdown();
    }

    #[tokio::test]
    async fn cancelled_job_is_marked_cancelled() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let queue = InstallQueue::start(db.clone(), dir.path().to_path_buf());

        // a long build, cancelled before the worker reaches it has a race;
        // cancel *after* it starts instead
        let ticket = queue
            .enqueue(InstallJob {
                name: "sleepy".into(),
                version: "1".into(),
                command: vec!["sleep".into(), "30".into()],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ticket.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.shutdown();
    }
}
