//! WAL entry schema and replay.
//!
//! Protocol per handled message:
//! 1. `Applied` records the node deltas, the fully stamped outgoing envelopes and the
//!    inbound batch id (the last-action record);
//! 2. envelopes are published;
//! 3. `Sent` clears the pending send.
//!
//! A log ending in an `Applied` without its `Sent` means the crash hit between 1 and
//! 3: recovery republishes the stored envelopes (same batch ids) and appends `Sent`.
//!
//! Messages without a batch id are deduplicated by content instead: the digest of
//! the last such message committed per queue is kept next to the watermarks.

use std::collections::{BTreeMap, HashMap};

use cq_common::BatchId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Inbound message that caused an `Applied` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub queue: String,
    pub batch: BatchId,
    /// Content digest, set only for inbound messages that carried no batch id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<u64>,
}

impl Trigger {
    pub fn new(queue: impl Into<String>, batch: BatchId) -> Self {
        Self {
            queue: queue.into(),
            batch,
            digest: None,
        }
    }
}

/// Outgoing envelope with its batch id already assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedEnvelope {
    pub queue: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub queue: String,
    pub producer: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
#[serde(bound = "D: Serialize + DeserializeOwned")]
pub enum JournalEntry<D> {
    Applied {
        trigger: Trigger,
        deltas: Vec<D>,
        outgoing: Vec<StampedEnvelope>,
        next_seq: u64,
    },
    Sent {
        trigger: Trigger,
    },
    Snapshot {
        deltas: Vec<D>,
        watermarks: Vec<Watermark>,
        #[serde(default)]
        unbatched: BTreeMap<String, u64>,
        next_seq: u64,
    },
}

/// Highest batch seq consumed per (input queue, producer).
///
/// Producers publish in seq order and queues are FIFO, so anything at or below the
/// watermark was already applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks {
    seen: HashMap<(String, String), u64>,
    unbatched: BTreeMap<String, u64>,
}

impl Watermarks {
    pub fn get(&self, queue: &str, producer: &str) -> u64 {
        self.seen
            .get(&(queue.to_string(), producer.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_duplicate(&self, queue: &str, batch: &BatchId) -> bool {
        batch.seq <= self.get(queue, &batch.producer)
    }

    pub fn advance(&mut self, queue: &str, batch: &BatchId) {
        let seen = self
            .seen
            .entry((queue.to_string(), batch.producer.clone()))
            .or_insert(0);
        *seen = (*seen).max(batch.seq);
    }

    /// Advance for a committed trigger. The batchless digest of its queue is
    /// replaced, or cleared when the trigger carried a batch id.
    pub fn commit(&mut self, trigger: &Trigger) {
        self.advance(&trigger.queue, &trigger.batch);
        match trigger.digest {
            Some(digest) => {
                self.unbatched.insert(trigger.queue.clone(), digest);
            }
            None => {
                self.unbatched.remove(&trigger.queue);
            }
        }
    }

    /// Whether `digest` is the last batchless message committed on `queue`.
    pub fn is_unbatched_duplicate(&self, queue: &str, digest: u64) -> bool {
        self.unbatched.get(queue) == Some(&digest)
    }

    pub fn unbatched(&self) -> &BTreeMap<String, u64> {
        &self.unbatched
    }

    pub fn restore_unbatched(&mut self, unbatched: BTreeMap<String, u64>) {
        self.unbatched = unbatched;
    }

    pub fn to_vec(&self) -> Vec<Watermark> {
        let mut out = self
            .seen
            .iter()
            .map(|((queue, producer), seq)| Watermark {
                queue: queue.clone(),
                producer: producer.clone(),
                seq: *seq,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (&a.queue, &a.producer).cmp(&(&b.queue, &b.producer)));
        out
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.unbatched.clear();
    }
}

impl FromIterator<Watermark> for Watermarks {
    fn from_iter<T: IntoIterator<Item = Watermark>>(iter: T) -> Self {
        let mut out = Watermarks::default();
        for w in iter {
            out.advance(&w.queue, &BatchId::new(w.producer, w.seq));
        }
        out
    }
}

/// A send that was committed but not confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub trigger: Trigger,
    pub outgoing: Vec<StampedEnvelope>,
}

/// Log folded into state: deltas to re-apply, dedup marks and any pending send.
#[derive(Debug)]
pub struct Replayed<D> {
    pub deltas: Vec<D>,
    pub watermarks: Watermarks,
    pub next_seq: u64,
    pub pending: Option<PendingSend>,
    pub entries: usize,
}

impl<D> Default for Replayed<D> {
    fn default() -> Self {
        Self {
            deltas: Vec::new(),
            watermarks: Watermarks::default(),
            next_seq: 1,
            pending: None,
            entries: 0,
        }
    }
}

/// Fold entries in file order. A snapshot replaces everything before it.
pub fn replay<D>(entries: Vec<JournalEntry<D>>) -> Replayed<D> {
    let mut out = Replayed::default();
    for entry in entries {
        out.entries += 1;
        match entry {
            JournalEntry::Snapshot {
                deltas,
                watermarks,
                unbatched,
                next_seq,
            } => {
                out.deltas = deltas;
                out.watermarks = watermarks.into_iter().collect();
                out.watermarks.restore_unbatched(unbatched);
                out.next_seq = next_seq;
                out.pending = None;
            }
            JournalEntry::Applied {
                trigger,
                deltas,
                outgoing,
                next_seq,
            } => {
                out.deltas.extend(deltas);
                out.watermarks.commit(&trigger);
                out.next_seq = out.next_seq.max(next_seq);
                out.pending = (!outgoing.is_empty()).then_some(PendingSend { trigger, outgoing });
            }
            JournalEntry::Sent { trigger } => {
                if out.pending.as_ref().is_some_and(|p| p.trigger == trigger) {
                    out.pending = None;
                }
            }
        }
    }
    out
}
