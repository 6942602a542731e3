use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::config::{Config, SyncPolicy};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Document, SeqNo};
use crate::index::partition::{IndexPartition, MemoryPartition};
use crate::search::types::{SearchRequest, ShardResult};
use crate::storage::layout::StorageLayout;
use crate::storage::wal::{Wal, WalOp};

const COMMIT_RETRIES: u32 = 4;
const COMMIT_BACKOFF: Duration = Duration::from_millis(10);
// Waiting writers re-check shard state this often so a close() that
// raced past them cannot strand them on the condvar.
const SYNC_RECHECK: Duration = Duration::from_millis(10);

/// What recovery found when the shard opened.
#[derive(Debug, Clone)]
pub struct ShardRecovery {
    pub replayed: usize,
    /// A torn trailing WAL record was dropped. Worth an operator's glance,
    /// not fatal: the record was never acknowledged.
    pub truncated_tail: bool,
}

#[derive(Debug, Clone)]
pub struct ShardHealth {
    /// Set when commits keep failing. Writes stay durable in the WAL.
    pub degraded: bool,
    pub last_commit_error: Option<String>,
    pub checkpoint_seq: SeqNo,
    pub buffered: usize,
    pub doc_count: usize,
}

enum CommitterMsg {
    Trigger,
    Shutdown,
}

struct WalState {
    wal: Wal,
    appended_seq: SeqNo,
    synced_seq: SeqNo,
    sync_error: Option<String>,
    /// Writes appended to the WAL but not yet applied to the partition.
    buffer: Vec<(SeqNo, WalOp)>,
}

struct ShardInner {
    index_name: String,
    shard_id: u32,
    sync_policy: SyncPolicy,
    wal: Mutex<WalState>,
    sync_cv: Condvar,
    partition: RwLock<Box<dyn IndexPartition>>,
    // At most one commit in flight per shard.
    commit_lock: Mutex<()>,
    closed: AtomicBool,
    degraded: AtomicBool,
    last_commit_error: Mutex<Option<String>>,
}

/// One index partition plus one WAL: the unit of write concurrency and
/// recovery. Writers append to the WAL and an in-memory buffer segment and
/// are acknowledged once their record is durable per the sync policy; a
/// background committer drains the buffer into the partition and truncates
/// the WAL behind the checkpoint.
pub struct Shard {
    inner: Arc<ShardInner>,
    recovery: ShardRecovery,
    trigger: Sender<CommitterMsg>,
    commit_batch_size: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shard {
    /// Open the shard, replaying WAL records past the partition's
    /// checkpoint before it is ready. Replay is idempotent, so crashing
    /// between a partition commit and the WAL truncate is harmless.
    pub fn open(
        config: &Config,
        layout: &StorageLayout,
        index_name: &str,
        shard_id: u32,
    ) -> Result<Arc<Self>> {
        layout.ensure_shard_dirs(index_name, shard_id)?;
        let wal_dir = layout.wal_dir(index_name, shard_id);
        let partition_dir = layout.partition_dir(index_name, shard_id);

        let mut partition: Box<dyn IndexPartition> =
            Box::new(MemoryPartition::open(&partition_dir)?);
        let checkpoint = partition.committed_seq();

        let outcome = Wal::replay(&wal_dir, checkpoint).map_err(|e| {
            Error::new(
                e.kind(),
                format!("{}/{}: {}", index_name, shard_id, e.context),
            )
        })?;
        let replayed = outcome.records.len();
        for record in &outcome.records {
            partition.apply(record.seq, &record.op)?;
        }

        let wal = Wal::open(&wal_dir, outcome.next_seq)?;
        let appended_seq = outcome.next_seq - 1;

        let inner = Arc::new(ShardInner {
            index_name: index_name.to_string(),
            shard_id,
            sync_policy: config.wal_sync,
            wal: Mutex::new(WalState {
                wal,
                appended_seq,
                synced_seq: appended_seq,
                sync_error: None,
                buffer: Vec::new(),
            }),
            sync_cv: Condvar::new(),
            partition: RwLock::new(partition),
            commit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            last_commit_error: Mutex::new(None),
        });

        let (trigger, trigger_rx) = bounded(16);
        let mut threads = Vec::new();
        threads.push(spawn_committer(
            inner.clone(),
            trigger_rx,
            config.commit_interval,
        ));
        if let SyncPolicy::Interval(interval) = config.wal_sync {
            threads.push(spawn_syncer(inner.clone(), interval));
        }

        Ok(Arc::new(Shard {
            inner,
            recovery: ShardRecovery {
                replayed,
                truncated_tail: outcome.truncated_tail,
            },
            trigger,
            commit_batch_size: config.commit_batch_size,
            threads: Mutex::new(threads),
        }))
    }

    pub fn shard_id(&self) -> u32 {
        self.inner.shard_id
    }

    pub fn recovery(&self) -> &ShardRecovery {
        &self.recovery
    }

    /// Append one operation and block until it is durable per the sync
    /// policy. Returns the record's shard-local seq. Concurrent callers
    /// are serialized at the WAL; a commit in flight never blocks them.
    pub fn write(&self, op: WalOp) -> Result<SeqNo> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }

        let seq;
        let buffered;
        {
            let mut state = self.inner.wal.lock();
            seq = state.wal.append(op.clone()).map_err(|e| {
                Error::new(
                    ErrorKind::Io,
                    format!(
                        "{}/{}: wal append failed: {}",
                        self.inner.index_name, self.inner.shard_id, e.context
                    ),
                )
            })?;
            state.appended_seq = seq;
            state.buffer.push((seq, op));
            buffered = state.buffer.len();

            match self.inner.sync_policy {
                SyncPolicy::Immediate => {
                    state.wal.sync()?;
                    state.synced_seq = seq;
                }
                SyncPolicy::None => {
                    state.synced_seq = seq;
                }
                SyncPolicy::Interval(_) => {
                    // Ack is withheld until the batch containing this
                    // record has been synced.
                    while state.synced_seq < seq {
                        if let Some(err) = &state.sync_error {
                            return Err(Error::io(err.clone()));
                        }
                        if self.inner.closed.load(Ordering::Acquire) {
                            // The syncer may already be gone; make this
                            // record durable directly instead of waiting
                            // on a thread that will never run again.
                            state.wal.sync()?;
                            state.synced_seq = state.appended_seq;
                            break;
                        }
                        self.inner.sync_cv.wait_for(&mut state, SYNC_RECHECK);
                    }
                }
            }
        }

        if buffered >= self.commit_batch_size {
            let _ = self.trigger.try_send(CommitterMsg::Trigger);
        }
        Ok(seq)
    }

    pub fn put(&self, doc: Document) -> Result<SeqNo> {
        self.write(WalOp::Put(doc))
    }

    pub fn delete(&self, id: DocId) -> Result<SeqNo> {
        self.write(WalOp::Delete(id))
    }

    /// Apply buffered writes to the partition without committing, the
    /// explicit read-your-writes point for callers that need one. Takes
    /// the commit lock: a refresh slipping between a commit's drain and
    /// its apply would let the partition's seq watermark swallow the
    /// older segment.
    pub fn refresh(&self) -> Result<()> {
        let _guard = self.inner.commit_lock.lock();
        self.inner.apply_buffered()
    }

    /// Flush buffered writes into the partition, persist it, and truncate
    /// the WAL up to the new checkpoint.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit_once()
    }

    pub fn search(&self, request: &SearchRequest, limit: usize) -> Result<ShardResult> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        let partition = self.inner.partition.read();
        let found = partition.search(request, limit);
        Ok(ShardResult {
            shard_id: self.inner.shard_id,
            hits: found.hits,
            total_hits: found.total_hits,
            aggregations: found.aggregations,
        })
    }

    pub fn get(&self, id: &DocId) -> Result<Option<Document>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        Ok(self.inner.partition.read().get(id))
    }

    pub fn health(&self) -> ShardHealth {
        let buffered = self.inner.wal.lock().buffer.len();
        let partition = self.inner.partition.read();
        ShardHealth {
            degraded: self.inner.degraded.load(Ordering::Acquire),
            last_commit_error: self.inner.last_commit_error.lock().clone(),
            checkpoint_seq: partition.committed_seq(),
            buffered,
            doc_count: partition.doc_count(),
        }
    }

    /// Stop accepting writes, flush everything, stop background threads.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.trigger.send(CommitterMsg::Shutdown);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        // The syncer is gone; cover anything writers appended after its
        // last pass and release anyone still waiting on an ack.
        {
            let mut state = self.inner.wal.lock();
            if state.synced_seq < state.appended_seq {
                match state.wal.sync() {
                    Ok(()) => state.synced_seq = state.appended_seq,
                    Err(e) => state.sync_error = Some(e.to_string()),
                }
            }
            self.inner.sync_cv.notify_all();
        }
        self.inner.commit_once()
    }

    fn closed_error(&self) -> Error {
        Error::new(
            ErrorKind::ShardClosed,
            format!("{}/{} is closed", self.inner.index_name, self.inner.shard_id),
        )
    }
}

impl crate::search::coordinator::ShardReader for Shard {
    fn shard_id(&self) -> u32 {
        self.inner.shard_id
    }

    fn search(&self, request: &SearchRequest, limit: usize) -> Result<ShardResult> {
        Shard::search(self, request, limit)
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        // No commit here: dropping without close() leaves the WAL as the
        // source of truth, exactly like a crash.
        self.inner.closed.store(true, Ordering::Release);
        self.inner.sync_cv.notify_all();
        let _ = self.trigger.send(CommitterMsg::Shutdown);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl ShardInner {
    /// Drain the buffer into the partition. The caller must hold
    /// `commit_lock` so drained segments reach the partition in seq
    /// order. Writers keep landing in the fresh segment meanwhile.
    fn apply_buffered(&self) -> Result<()> {
        let drained = {
            let mut state = self.wal.lock();
            mem::take(&mut state.buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }
        let result = (|| {
            let mut partition = self.partition.write();
            for (seq, op) in &drained {
                partition.apply(*seq, op)?;
            }
            Ok(())
        })();
        if result.is_err() {
            // Put the drained segment back ahead of anything newer;
            // apply is idempotent, so a retry may safely reapply it.
            let mut state = self.wal.lock();
            let mut restored = drained;
            restored.extend(mem::take(&mut state.buffer));
            state.buffer = restored;
        }
        result
    }

    fn commit_once(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        self.apply_buffered()?;
        let checkpoint = {
            let mut partition = self.partition.write();
            partition.commit()?;
            partition.committed_seq()
        };
        self.wal.lock().wal.truncate(checkpoint)?;
        Ok(())
    }

    fn commit_with_retry(&self) {
        let mut backoff = COMMIT_BACKOFF;
        for attempt in 0..COMMIT_RETRIES {
            match self.commit_once() {
                Ok(()) => {
                    self.degraded.store(false, Ordering::Release);
                    *self.last_commit_error.lock() = None;
                    return;
                }
                Err(e) => {
                    *self.last_commit_error.lock() = Some(e.to_string());
                    if attempt + 1 < COMMIT_RETRIES {
                        thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        // Data is safe in the WAL; flag the shard and let the next cycle
        // try again.
        self.degraded.store(true, Ordering::Release);
    }
}

fn spawn_committer(
    inner: Arc<ShardInner>,
    rx: Receiver<CommitterMsg>,
    interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match rx.recv_timeout(interval) {
            Ok(CommitterMsg::Shutdown) => return,
            Ok(CommitterMsg::Trigger) => inner.commit_with_retry(),
            Err(_) => {
                // Interval elapsed: commit only if something is waiting,
                // either buffered or applied without a snapshot yet.
                let buffered = !inner.wal.lock().buffer.is_empty();
                let unsnapshotted = {
                    let partition = inner.partition.read();
                    partition.applied_seq() > partition.committed_seq()
                };
                if buffered || unsnapshotted {
                    inner.commit_with_retry();
                }
            }
        }
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
    })
}

fn spawn_syncer(inner: Arc<ShardInner>, interval: Duration) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let mut state = inner.wal.lock();
        if state.synced_seq < state.appended_seq {
            match state.wal.sync() {
                Ok(()) => {
                    state.synced_seq = state.appended_seq;
                    state.sync_error = None;
                }
                Err(e) => state.sync_error = Some(e.to_string()),
            }
        }
        inner.sync_cv.notify_all();
    })
}
