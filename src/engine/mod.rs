mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{free_spans, subtract_intervals};
pub use error::EngineError;
pub use queries::EngineStats;
pub use store::{ExclusionViolation, ResourceGuard, Store};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedRwLockReadGuard, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, then one
/// fsync for the whole batch before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            error!("WAL flush of {} events failed: {e}", batch.len());
        }
        respond_batch(batch, &result);

        // Non-append commands observe every append queued before them.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after an append error so partially buffered bytes do not
    // leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Outcome of rebuilding state from the WAL at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReplayReport {
    pub applied: u64,
    /// Records refused by the exclusion constraint.
    pub rejected: u64,
}

/// Write locks held by one mutation: a shared hold on the commit gate plus
/// the resource guards, sorted by resource id. Owned, so a commit can move
/// them into its own task.
pub(super) struct Locked {
    _commit: OwnedRwLockReadGuard<()>,
    pub guards: Vec<ResourceGuard>,
}

/// Rebuild state from WAL events, applying each record that passes the
/// exclusion constraint.
fn rebuild(events: &[Event], wal_path: &Path) -> io::Result<(Store, ReplayReport)> {
    let store = Store::new();
    let mut replay = ReplayReport::default();
    for event in events {
        let mut guards = store.replay_guards(event)?;
        match store.check(&guards, event) {
            Ok(()) => {
                store.apply(&mut guards, event);
                replay.applied += 1;
            }
            Err(violation) => {
                warn!("replay skipped record in {}: {violation}", wal_path.display());
                replay.rejected += 1;
            }
        }
    }
    Ok((store, replay))
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

/// Exclusion backstop + WAL append + apply + notify, all under `locked`.
async fn commit(
    store: Arc<Store>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    mut locked: Locked,
    event: Event,
) -> Result<Locked, EngineError> {
    if let Err(violation) = store.check(&locked.guards, &event) {
        error!("exclusion backstop fired after admission passed: {violation}");
        metrics::counter!(observability::EXCLUSION_BACKSTOP_TOTAL).increment(1);
        return Err(EngineError::Conflict(vec![violation.existing]));
    }
    wal_append(&wal_tx, &event).await?;
    store.apply(&mut locked.guards, &event);
    notify.send(&event);
    Ok(locked)
}

/// Allocation engine for one organization: per-resource locks, admission
/// control, durable WAL, change notifications.
pub struct Engine {
    pub(super) store: Arc<Store>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Shared by mutations from lock to apply, exclusive during compaction, so
    /// a snapshot never misses an append.
    pub(super) commit_gate: Arc<RwLock<()>>,
    lock_timeout: Duration,
    replay: ReplayReport,
}

impl Engine {
    /// Replay `wal_path` and start the group-commit writer. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let (store, replay) = rebuild(&events, &wal_path)?;
        info!(
            "replayed {} ({} applied, {} rejected, {} resources)",
            wal_path.display(),
            replay.applied,
            replay.rejected,
            store.resource_count()
        );

        Ok(Self {
            store: Arc::new(store),
            wal_tx,
            notify,
            commit_gate: Arc::new(RwLock::new(())),
            lock_timeout,
            replay,
        })
    }

    /// Replay a WAL without opening it for writing and report what it holds.
    /// The file is left untouched, torn tail included.
    pub fn inspect(wal_path: &Path) -> io::Result<EngineStats> {
        let events = Wal::replay(wal_path)?;
        let (store, replay) = rebuild(&events, wal_path)?;
        let mut stats = EngineStats {
            replay,
            ..EngineStats::default()
        };
        for resource_id in store.resource_ids() {
            let Some(rs) = store.get_resource(&resource_id) else {
                continue;
            };
            let Ok(rs) = rs.try_read() else {
                continue;
            };
            stats.resources += 1;
            stats.active += rs.active.len();
            stats.cancelled += rs.history.len();
        }
        Ok(stats)
    }

    pub fn replay_report(&self) -> ReplayReport {
        self.replay
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.store.get_resource(id)
    }

    /// Commit `event` under `locked`, which must cover every resource the
    /// event touches. The commit runs as its own task: once the WAL append is
    /// queued, dropping the caller's future cannot leave the record applied on
    /// disk but missing in memory.
    pub(super) async fn persist_and_apply(
        &self,
        locked: Locked,
        event: Event,
    ) -> Result<Locked, EngineError> {
        let task = tokio::spawn(commit(
            self.store.clone(),
            self.wal_tx.clone(),
            self.notify.clone(),
            locked,
            event,
        ));
        task.await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Write-lock the given resources in sorted order, creating them on first
    /// use. The commit gate is taken first; all acquisitions share one deadline.
    pub(super) async fn lock_resources(&self, resource_ids: &[&str]) -> Result<Locked, EngineError> {
        let mut sorted = resource_ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        let commit = match tokio::time::timeout_at(deadline, self.commit_gate.clone().read_owned()).await {
            Ok(gate) => gate,
            Err(_) => return Err(self.timed_out(sorted.first().copied().unwrap_or_default())),
        };
        let mut guards = Vec::with_capacity(sorted.len());
        for resource_id in sorted {
            let rs = self.store.get_or_insert_resource(resource_id)?;
            match tokio::time::timeout_at(deadline, rs.write_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => return Err(self.timed_out(resource_id)),
            }
        }
        metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(Locked { _commit: commit, guards })
    }

    pub(super) async fn read_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<OwnedRwLockReadGuard<ResourceState>>, EngineError> {
        let Some(rs) = self.store.get_resource(resource_id) else {
            return Ok(None);
        };
        match tokio::time::timeout(self.lock_timeout, rs.read_owned()).await {
            Ok(guard) => Ok(Some(guard)),
            Err(_) => Err(self.timed_out(resource_id)),
        }
    }

    pub(super) fn timed_out(&self, resource_id: &str) -> EngineError {
        warn!("lock on {resource_id} not acquired within {:?}", self.lock_timeout);
        metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        EngineError::Timeout {
            resource_id: resource_id.to_string(),
            waited: self.lock_timeout,
        }
    }

    /// Resolve the resource an allocation lives on and write-lock it.
    pub(super) async fn lock_for_entity(
        &self,
        allocation_id: Ulid,
    ) -> Result<(String, Locked), EngineError> {
        let resource_id = self
            .store
            .get_resource_for_entity(&allocation_id)
            .ok_or(EngineError::NotFound(allocation_id))?;
        debug!("allocation {allocation_id} lives on {resource_id}");
        let locked = self.lock_resources(&[resource_id.as_str()]).await?;
        Ok((resource_id, locked))
    }
}
