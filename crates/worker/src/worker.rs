//! Consume loop and exactly-once-effect recovery for one node instance.
//!
//! Responsibilities:
//! - declare input/output queues and rebuild node state from the WAL at startup;
//! - republish a send that was committed but never confirmed;
//! - process one delivery at a time: dedup, handle, commit, publish, ack;
//! - rebuild state from the WAL whenever handling fails after touching state;
//! - run node continuations (chunked spill joins) as their own committed steps;
//! - compact the WAL into a snapshot once it grows past the configured size.
//!
//! Ack ordering: a delivery is acked only after its `Applied` entry is durable and
//! every envelope it produced was published. A redelivered message whose batch id
//! is at or below the consumer's watermark is acked without effect; a redelivered
//! message without a batch id is a duplicate when its content digest matches the
//! last batchless message committed on its queue.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cq_common::metrics::global_metrics;
use cq_common::{BatchId, CqError, NodeConfig, Result};
use cq_spill::{reconcile_spill_dir, spill_root, wipe_spill_dir};
use cq_wal::Wal;
use crc32c::crc32c_append;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{Delivery, MessageBus};
use crate::envelope::Envelope;
use crate::journal::{self, JournalEntry, PendingSend, StampedEnvelope, Trigger, Watermarks};
use crate::node::{Effects, Node, Outgoing};
use crate::routing::{input_queues, output_queues};

pub const WAL_FILE: &str = "wal.log";

/// Trigger queue for continuation steps that no inbound message caused.
pub const RESUME_QUEUE: &str = "resume";

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// How a worker stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Keep WAL and spill files for the next start.
    Local,
    /// Wipe WAL contents and spill files.
    Global,
}

impl Shutdown {
    /// `Global` when the fleet-wide flag file exists.
    pub fn from_flag(flag: &Path) -> Self {
        if flag.exists() {
            Shutdown::Global
        } else {
            Shutdown::Local
        }
    }
}

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Duplicate,
    /// Fatal to the message: logged and acked without effect.
    Rejected,
    /// Transient failure: state rebuilt and the delivery requeued.
    Requeued,
    /// An injected crash point fired; the delivery was left unacked.
    Crashed,
}

/// Fault-injection points for recovery tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Handled (spill files written), `Applied` not written.
    BeforeCommit,
    /// `Applied` is durable; nothing published, spill cleanup not run.
    AfterCommit,
    /// Published, `Sent` not written, inbound not acked.
    AfterPublish,
}

pub struct Worker<N: Node, B: MessageBus + ?Sized> {
    config: NodeConfig,
    name: String,
    node: N,
    bus: Arc<B>,
    wal: Wal<JournalEntry<N::Delta>>,
    watermarks: Watermarks,
    next_seq: u64,
    inputs: Vec<String>,
    pending: Option<PendingSend>,
    backoff: Duration,
    crash_point: Option<CrashPoint>,
}

impl<N: Node, B: MessageBus + ?Sized> Worker<N, B> {
    /// Declare queues, replay the WAL, reconcile spill files and finish any send
    /// interrupted by the previous run.
    pub async fn open(config: NodeConfig, node: N, bus: Arc<B>) -> Result<Self> {
        let name = config.node_name();
        std::fs::create_dir_all(&config.state_dir)?;
        let inputs = input_queues(&config);
        for queue in inputs.iter().chain(output_queues(&config)?.iter()) {
            bus.declare_queue(queue).await?;
        }

        let (wal, recovery) = Wal::open(config.state_dir.join(WAL_FILE))?;
        if recovery.truncated_bytes > 0 {
            warn!(
                node = %name,
                truncated_bytes = recovery.truncated_bytes,
                "wal had a torn tail"
            );
        }
        let entries = recovery.entries.len();
        let mut worker = Self {
            config,
            name,
            node,
            bus,
            wal,
            watermarks: Watermarks::default(),
            next_seq: 1,
            inputs,
            pending: None,
            backoff: INITIAL_BACKOFF,
            crash_point: None,
        };
        worker.pending = worker.restore(recovery.entries)?;
        worker.reconcile_spills()?;
        if entries > 0 {
            global_metrics().inc_recovery_replays(&worker.name, "startup");
        }
        worker.flush_pending().await?;
        worker.resume_work().await?;

        info!(
            node = %worker.name,
            wal_entries = entries,
            clients = worker.node.active_clients(),
            inputs = ?worker.inputs,
            "worker ready"
        );
        Ok(worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Arm a crash point for the next processed delivery.
    pub fn inject_crash(&mut self, point: CrashPoint) {
        self.crash_point = Some(point);
    }

    fn wal_path(&self) -> PathBuf {
        self.config.state_dir.join(WAL_FILE)
    }

    fn restore(&mut self, entries: Vec<JournalEntry<N::Delta>>) -> Result<Option<PendingSend>> {
        let replayed = journal::replay(entries);
        self.node.reset();
        for delta in replayed.deltas {
            self.node.apply(delta)?;
        }
        self.watermarks = replayed.watermarks;
        self.next_seq = replayed.next_seq;
        debug!(
            node = %self.name,
            entries = replayed.entries,
            pending = replayed.pending.is_some(),
            "state restored from wal"
        );
        Ok(replayed.pending)
    }

    /// Throw away in-memory state and rebuild it from the durable log.
    fn rebuild(&mut self) -> Result<()> {
        let (wal, recovery) = Wal::open(self.wal_path())?;
        self.wal = wal;
        let pending = self.restore(recovery.entries)?;
        if pending.is_some() {
            self.pending = pending;
        }
        self.reconcile_spills()?;
        global_metrics().inc_recovery_replays(&self.name, "rebuild");
        Ok(())
    }

    fn reconcile_spills(&self) -> Result<()> {
        let live = self.node.spill_files();
        let report = reconcile_spill_dir(&spill_root(&self.config.state_dir), &live)?;
        if !report.truncated.is_empty() || !report.removed.is_empty() {
            info!(
                node = %self.name,
                truncated = report.truncated.len(),
                removed = report.removed.len(),
                "reconciled spill files"
            );
        }
        Ok(())
    }

    /// Republish a committed-but-unconfirmed send, then confirm it.
    async fn flush_pending(&mut self) -> Result<()> {
        let Some(pending) = self.pending.clone() else {
            return Ok(());
        };
        info!(
            node = %self.name,
            trigger = %pending.trigger.batch,
            envelopes = pending.outgoing.len(),
            "replaying pending send"
        );
        self.publish_all(&pending.outgoing).await?;
        self.confirm_sent(pending.trigger)?;
        Ok(())
    }

    async fn publish_all(&self, outgoing: &[StampedEnvelope]) -> Result<()> {
        for stamped in outgoing {
            let env = &stamped.envelope;
            self.bus
                .publish(&stamped.queue, env.headers(), env.body.clone().into_bytes())
                .await?;
            global_metrics().record_message_out(&self.name, &stamped.queue, env.kind.as_str());
        }
        Ok(())
    }

    fn confirm_sent(&mut self, trigger: Trigger) -> Result<()> {
        let bytes = self.wal.append(&JournalEntry::Sent { trigger })?;
        global_metrics().record_wal_write(&self.name, bytes);
        self.pending = None;
        Ok(())
    }

    fn commit(&mut self, trigger: Trigger, deltas: Vec<N::Delta>, outgoing: Vec<StampedEnvelope>) -> Result<()> {
        let entry = JournalEntry::Applied {
            trigger: trigger.clone(),
            deltas,
            outgoing: outgoing.clone(),
            next_seq: self.next_seq,
        };
        let bytes = self.wal.append(&entry)?;
        global_metrics().record_wal_write(&self.name, bytes);
        self.watermarks.commit(&trigger);
        if !outgoing.is_empty() {
            self.pending = Some(PendingSend { trigger, outgoing });
        }
        Ok(())
    }

    fn stamp(&mut self, outgoing: Vec<Outgoing>) -> Vec<StampedEnvelope> {
        outgoing
            .into_iter()
            .map(|out| {
                let batch = BatchId::new(self.name.clone(), self.next_seq);
                self.next_seq += 1;
                StampedEnvelope {
                    queue: out.queue,
                    envelope: out.envelope.with_batch(batch),
                }
            })
            .collect()
    }

    /// Inbound messages without a batch id get `<queue>:<n>` from a per-queue counter
    /// that advances with each commit, plus a content digest for dedup.
    fn trigger_for(&self, delivery: &Delivery, envelope: &Envelope) -> Trigger {
        match &envelope.batch {
            Some(batch) => Trigger::new(delivery.queue.clone(), batch.clone()),
            None => Trigger {
                digest: Some(content_digest(delivery)),
                ..Trigger::new(
                    delivery.queue.clone(),
                    BatchId::new(
                        delivery.queue.clone(),
                        self.watermarks.get(&delivery.queue, &delivery.queue) + 1,
                    ),
                )
            },
        }
    }

    fn is_duplicate(&self, delivery: &Delivery, trigger: &Trigger) -> bool {
        match trigger.digest {
            Some(digest) => {
                delivery.redelivered && self.watermarks.is_unbatched_duplicate(&trigger.queue, digest)
            }
            None => self.watermarks.is_duplicate(&trigger.queue, &trigger.batch),
        }
    }

    fn remove_spills(&self, paths: Vec<PathBuf>) {
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(node = %self.name, path = %path.display(), "removed spill file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(node = %self.name, path = %path.display(), error = %err, "spill cleanup failed"),
            }
        }
    }

    /// Run node continuations until none is left, one committed step each.
    ///
    /// A step is published and confirmed before the next one is computed, so a
    /// crash replays at most the last step's send.
    async fn resume_work(&mut self) -> Result<()> {
        while self.pending.is_none() && self.node.has_pending_work() {
            let seq = self.next_seq;
            self.next_seq += 1;
            let trigger = Trigger::new(RESUME_QUEUE, BatchId::new(self.name.clone(), seq));

            let mut fx = Effects::new();
            let resumed = match self.node.resume(&mut fx) {
                Ok(()) if fx.deltas.is_empty() => Err(CqError::Execution(format!(
                    "{}: continuation made no progress",
                    self.name
                ))),
                other => other,
            };
            if let Err(err) = resumed {
                self.rebuild()?;
                return Err(err);
            }
            let outgoing = self.stamp(fx.outgoing);
            if let Err(err) = self.commit(trigger.clone(), fx.deltas, outgoing.clone()) {
                self.rebuild()?;
                return Err(err);
            }
            debug!(node = %self.name, batch = %trigger.batch, outgoing = outgoing.len(), "continuation committed");
            self.remove_spills(fx.cleanup);
            self.publish_all(&outgoing).await?;
            if !outgoing.is_empty() {
                self.confirm_sent(trigger)?;
            }
            self.maybe_compact();
        }
        Ok(())
    }

    /// Wait for and process one delivery.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.flush_pending().await?;
        self.resume_work().await?;
        let delivery = self.bus.next_delivery(&self.inputs).await?;
        self.process(delivery).await
    }

    /// Process one delivery obtained from the bus.
    pub async fn process(&mut self, delivery: Delivery) -> Result<StepOutcome> {
        let started = Instant::now();
        let envelope = match Envelope::decode(&delivery.headers, &delivery.body) {
            Ok(env) => env,
            Err(err) => {
                warn!(node = %self.name, queue = %delivery.queue, error = %err, "dropping malformed message");
                self.bus.ack(&delivery).await?;
                return Ok(StepOutcome::Rejected);
            }
        };
        let trigger = self.trigger_for(&delivery, &envelope);
        let batch = trigger.batch.clone();
        if self.is_duplicate(&delivery, &trigger) {
            debug!(
                node = %self.name,
                queue = %delivery.queue,
                batch = %batch,
                redelivered = delivery.redelivered,
                "duplicate delivery"
            );
            global_metrics().inc_duplicates(&self.name, &delivery.queue);
            self.bus.ack(&delivery).await?;
            return Ok(StepOutcome::Duplicate);
        }

        let mut fx = Effects::new();
        if let Err(err) = self.node.handle(&envelope, &mut fx) {
            let touched = !fx.deltas.is_empty();
            return self.handle_failure(&delivery, &envelope, trigger, err, touched).await;
        }
        if self.crash_point == Some(CrashPoint::BeforeCommit) {
            return Ok(StepOutcome::Crashed);
        }

        let outgoing = self.stamp(fx.outgoing);
        if let Err(err) = self.commit(trigger.clone(), fx.deltas, outgoing.clone()) {
            return self.handle_failure(&delivery, &envelope, trigger, err, true).await;
        }
        debug!(
            node = %self.name,
            client = %envelope.client,
            query = %envelope.query,
            kind = %envelope.kind,
            batch = %batch,
            outgoing = outgoing.len(),
            "committed"
        );
        if self.crash_point == Some(CrashPoint::AfterCommit) {
            return Ok(StepOutcome::Crashed);
        }
        // Released spill files are no longer referenced by the committed state.
        self.remove_spills(fx.cleanup);

        if let Err(err) = self.publish_all(&outgoing).await {
            // The commit stands; the pending send is retried before the next delivery.
            warn!(node = %self.name, batch = %batch, error = %err, "publish failed");
            self.requeue_with_backoff(&delivery).await?;
            return Ok(StepOutcome::Requeued);
        }
        if self.crash_point == Some(CrashPoint::AfterPublish) {
            return Ok(StepOutcome::Crashed);
        }
        if !outgoing.is_empty() {
            self.confirm_sent(trigger)?;
        }
        self.bus.ack(&delivery).await?;
        self.backoff = INITIAL_BACKOFF;

        let metrics = global_metrics();
        metrics.record_message_in(
            &self.name,
            &delivery.queue,
            envelope.kind.as_str(),
            started.elapsed().as_secs_f64(),
        );
        metrics.set_active_clients(&self.name, self.node.active_clients() as u64);
        self.maybe_compact();
        self.resume_work().await?;
        Ok(StepOutcome::Applied)
    }

    async fn handle_failure(
        &mut self,
        delivery: &Delivery,
        envelope: &Envelope,
        trigger: Trigger,
        err: CqError,
        touched: bool,
    ) -> Result<StepOutcome> {
        // Nothing was recorded, so the in-memory state still matches the log.
        if touched {
            self.rebuild()?;
        }
        if err.is_transient() {
            warn!(
                node = %self.name,
                client = %envelope.client,
                query = %envelope.query,
                kind = %envelope.kind,
                error = %err,
                "transient failure, requeueing"
            );
            self.requeue_with_backoff(delivery).await?;
            return Ok(StepOutcome::Requeued);
        }
        warn!(
            node = %self.name,
            client = %envelope.client,
            query = %envelope.query,
            kind = %envelope.kind,
            error = %err,
            "rejecting message"
        );
        self.commit(trigger, Vec::new(), Vec::new())?;
        self.bus.ack(delivery).await?;
        Ok(StepOutcome::Rejected)
    }

    async fn requeue_with_backoff(&mut self, delivery: &Delivery) -> Result<()> {
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        self.bus.requeue(delivery).await?;
        global_metrics().inc_requeued(&self.name, &delivery.queue);
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if self.pending.is_some() || self.wal.len_bytes() <= self.config.wal_compact_bytes {
            return;
        }
        let before = self.wal.len_bytes();
        let snapshot = JournalEntry::Snapshot {
            deltas: self.node.snapshot(),
            watermarks: self.watermarks.to_vec(),
            unbatched: self.watermarks.unbatched().clone(),
            next_seq: self.next_seq,
        };
        match self.wal.rewrite(std::slice::from_ref(&snapshot)) {
            Ok(after) => {
                global_metrics().inc_wal_compactions(&self.name);
                info!(node = %self.name, before, after, "compacted wal");
            }
            Err(err) => warn!(node = %self.name, error = %err, "wal compaction failed"),
        }
    }

    /// Stop, keeping (`Local`) or wiping (`Global`) persisted state.
    pub fn shut_down(mut self, mode: Shutdown) -> Result<Shutdown> {
        if mode == Shutdown::Global {
            self.wal.wipe()?;
            wipe_spill_dir(&spill_root(&self.config.state_dir))?;
            self.node.reset();
            self.watermarks.clear();
        }
        info!(node = %self.name, mode = ?mode, "worker stopped");
        Ok(mode)
    }

    /// Consume until a shutdown is signalled. Shutdown is only observed between
    /// messages, never while one is being processed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<Option<Shutdown>>) -> Result<Shutdown> {
        loop {
            let signalled = *shutdown.borrow_and_update();
            if let Some(mode) = signalled {
                return self.shut_down(mode);
            }
            let caught_up = match self.flush_pending().await {
                Ok(()) => self.resume_work().await,
                Err(err) => Err(err),
            };
            if let Err(err) = caught_up {
                error!(node = %self.name, error = %err, "pending send or continuation failed");
                tokio::time::sleep(self.backoff).await;
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => Err(changed.is_err()),
                delivery = self.bus.next_delivery(&self.inputs) => Ok(delivery),
            };
            let delivery = match next {
                Err(true) => return self.shut_down(Shutdown::Local),
                Err(false) => continue,
                Ok(Ok(delivery)) => delivery,
                Ok(Err(err)) => {
                    error!(node = %self.name, error = %err, "consume failed");
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            match self.process(delivery).await {
                Ok(StepOutcome::Crashed) => {
                    return Err(CqError::Execution(format!("{}: injected crash", self.name)));
                }
                Ok(_) => {}
                Err(err) => {
                    error!(node = %self.name, error = %err, "message processing failed");
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Digest of a batchless delivery: crc32c over the sorted headers and the body,
/// with the body length in the high bits.
fn content_digest(delivery: &Delivery) -> u64 {
    let mut crc = 0;
    for (key, value) in &delivery.headers {
        crc = crc32c_append(crc, key.as_bytes());
        crc = crc32c_append(crc, &[0]);
        crc = crc32c_append(crc, value.as_bytes());
        crc = crc32c_append(crc, &[0]);
    }
    crc = crc32c_append(crc, &delivery.body);
    ((delivery.body.len() as u64) << 32) | u64::from(crc)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use cq_common::{ClientId, NodeRole, QueryId};

    use super::*;
    use crate::bus::InProcessBus;
    use crate::envelope::MessageKind;
    use crate::routing::pnl_queue;

    /// Sums recorded deltas; `bad` fails before recording, `boom` after.
    struct Counting {
        resets: Arc<AtomicUsize>,
        total: u64,
    }

    impl Node for Counting {
        type Delta = u64;

        fn handle(&mut self, env: &Envelope, fx: &mut Effects<u64>) -> Result<()> {
            match env.body.as_str() {
                "bad" => Err(CqError::Decode("bad row".to_string())),
                "boom" => {
                    self.record(fx, 1)?;
                    Err(CqError::Execution("boom".to_string()))
                }
                _ => self.record(fx, 1),
            }
        }

        fn apply(&mut self, delta: u64) -> Result<()> {
            self.total += delta;
            Ok(())
        }

        fn snapshot(&self) -> Vec<u64> {
            vec![self.total]
        }

        fn reset(&mut self) {
            self.total = 0;
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn active_clients(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn failures_replay_the_wal_only_when_state_was_touched() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("cq_worker_rebuild_{nanos}"));
        let config = NodeConfig::for_role(NodeRole::Pnl, 1, &dir);
        let bus = Arc::new(InProcessBus::new());
        let resets = Arc::new(AtomicUsize::new(0));
        let node = Counting {
            resets: resets.clone(),
            total: 0,
        };
        let mut worker = Worker::open(config, node, bus.clone()).await.expect("open");
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        for (seq, body) in ["ok", "bad", "bad", "boom"].into_iter().enumerate() {
            let env = Envelope::new(QueryId::SENTIMENT, ClientId::new("c"), MessageKind::Movies, body)
                .with_batch(BatchId::new("broker", seq as u64 + 1));
            bus.publish(&pnl_queue(1), env.headers(), env.body.into_bytes())
                .await
                .expect("publish");
        }
        assert_eq!(worker.step().await.expect("ok"), StepOutcome::Applied);
        assert_eq!(worker.step().await.expect("bad"), StepOutcome::Rejected);
        assert_eq!(worker.step().await.expect("bad"), StepOutcome::Rejected);
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        assert_eq!(worker.step().await.expect("boom"), StepOutcome::Rejected);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert_eq!(worker.node().total, 1);
        assert_eq!(bus.unacked_count().await, 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn spawned_run_stops_on_local_shutdown() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("cq_worker_spawn_{nanos}"));
        let bus = Arc::new(InProcessBus::new());
        let node = Counting {
            resets: Arc::new(AtomicUsize::new(0)),
            total: 0,
        };
        let worker = Worker::open(NodeConfig::for_role(NodeRole::Pnl, 1, &dir), node, bus.clone())
            .await
            .expect("open");

        let (tx, rx) = watch::channel(None);
        let handle = tokio::spawn(worker.run(rx));
        let env = Envelope::new(QueryId::SENTIMENT, ClientId::new("c"), MessageKind::Movies, "ok")
            .with_batch(BatchId::new("broker", 1));
        bus.publish(&pnl_queue(1), env.headers(), env.body.into_bytes())
            .await
            .expect("publish");
        while bus.queue_len(&pnl_queue(1)).await > 0 || bus.unacked_count().await > 0 {
            tokio::task::yield_now().await;
        }
        tx.send(Some(Shutdown::Local)).expect("signal");
        assert_eq!(handle.await.expect("join").expect("run"), Shutdown::Local);
        let _ = std::fs::remove_dir_all(dir);
    }
}
