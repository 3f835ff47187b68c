//! Transport seam: durable named queues with explicit ack.
//!
//! Nodes only see [`MessageBus`]. [`InProcessBus`] is a durable in-memory broker
//! used by the local cluster and tests; a network transport implements the same
//! trait.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;

use async_trait::async_trait;
use cq_common::{CqError, Result};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::envelope::Headers;

/// One message handed to a consumer; stays unacked until [`MessageBus::ack`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn publish(&self, queue: &str, headers: Headers, body: Vec<u8>) -> Result<()>;

    /// Wait for the next message on any of `queues` (prefetch of one per call).
    async fn next_delivery(&self, queues: &[String]) -> Result<Delivery>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return an unacked delivery to the head of its queue.
    async fn requeue(&self, delivery: &Delivery) -> Result<()>;
}

#[derive(Debug)]
struct Stored {
    headers: Headers,
    body: Vec<u8>,
    seq: u64,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct BusState {
    queues: HashMap<String, VecDeque<Stored>>,
    unacked: HashMap<u64, (String, Stored)>,
    next_tag: u64,
    next_seq: u64,
}

impl BusState {
    /// Oldest head across `queues`, so a consumer of several queues sees global
    /// publish order.
    fn pop_oldest(&mut self, queues: &[String]) -> Option<Delivery> {
        let queue = queues
            .iter()
            .filter_map(|q| self.queues.get(q).and_then(|m| m.front()).map(|m| (q, m.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(q, _)| q.clone())?;
        let stored = self.queues.get_mut(&queue)?.pop_front()?;
        self.next_tag += 1;
        let delivery = Delivery {
            queue: queue.clone(),
            tag: self.next_tag,
            headers: stored.headers.clone(),
            body: stored.body.clone(),
            redelivered: stored.redelivered,
        };
        self.unacked.insert(self.next_tag, (queue, stored));
        Some(delivery)
    }

    fn take_unacked(&mut self, delivery: &Delivery) -> Result<(String, Stored)> {
        self.unacked.remove(&delivery.tag).ok_or_else(|| {
            CqError::Transport(format!(
                "delivery {} on '{}' is not outstanding",
                delivery.tag, delivery.queue
            ))
        })
    }
}

/// In-memory durable queues. Messages survive consumer crashes: anything not acked
/// can be put back with [`InProcessBus::recover`].
#[derive(Debug, Default)]
pub struct InProcessBus {
    state: Mutex<BusState>,
    notify: Notify,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every unacked delivery to the head of its queue, oldest first, as a
    /// broker does when a consumer connection drops.
    pub async fn recover(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut pending = state.unacked.drain().map(|(_, v)| v).collect::<Vec<_>>();
        pending.sort_by_key(|(_, stored)| std::cmp::Reverse(stored.seq));
        let recovered = pending.len();
        for (queue, mut stored) in pending {
            stored.redelivered = true;
            state.queues.entry(queue).or_default().push_front(stored);
        }
        drop(state);
        if recovered > 0 {
            debug!(recovered, "returned unacked deliveries");
            self.notify.notify_waiters();
        }
        recovered
    }

    pub async fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Remove and return everything queued on `queue` without delivering it.
    pub async fn drain(&self, queue: &str) -> Vec<(Headers, Vec<u8>)> {
        let mut state = self.state.lock().await;
        state
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|m| (m.headers, m.body)).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, headers: Headers, body: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let seq = state.next_seq;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| CqError::Transport(format!("queue '{queue}' is not declared")))?;
        target.push_back(Stored {
            headers,
            body,
            seq,
            redelivered: false,
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(&self, queues: &[String]) -> Result<Delivery> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(delivery) = self.state.lock().await.pop_oldest(queues) {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state.lock().await.take_unacked(delivery).map(|_| ())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        let (queue, mut stored) = state.take_unacked(delivery)?;
        stored.redelivered = true;
        state.queues.entry(queue).or_default().push_front(stored);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}
