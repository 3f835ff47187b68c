//! EOF-counting termination detection per (client, query).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;

use cq_common::{ClientId, QueryId};

/// Finished (client, query) pairs remembered per node before the oldest are forgotten.
pub const COMPLETED_RETAINED: usize = 10_000;

/// Insertion-ordered set that forgets its oldest members past a fixed capacity.
///
/// Used for "this stream already ended" markers, which only need to outlive the
/// stragglers of a session, not the process.
#[derive(Debug, Clone)]
pub struct CompletedSet<K> {
    order: VecDeque<K>,
    members: HashSet<K>,
    cap: usize,
}

impl<K: Clone + Eq + Hash> Default for CompletedSet<K> {
    fn default() -> Self {
        Self::bounded(COMPLETED_RETAINED)
    }
}

impl<K: Clone + Eq + Hash> CompletedSet<K> {
    pub fn bounded(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// Returns `false` when `key` was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    /// Oldest first, so replaying the iteration rebuilds the same eviction order.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Counts upstream EOFs down from the deployment's fan-in.
///
/// A pair whose count reached zero is remembered as completed, so a late or
/// surplus EOF can never trigger a second flush. Only the most recent
/// [`COMPLETED_RETAINED`] completions are kept.
#[derive(Debug, Clone, Default)]
pub struct EofTracker {
    expected: BTreeMap<QueryId, u32>,
    remaining: HashMap<(ClientId, QueryId), u32>,
    completed: CompletedSet<(ClientId, QueryId)>,
}

impl EofTracker {
    pub fn new(expected: BTreeMap<QueryId, u32>) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    /// Configured fan-in; unlisted queries and zero counts mean one producer.
    pub fn expected(&self, query: QueryId) -> u32 {
        self.expected.get(&query).copied().unwrap_or(1).max(1)
    }

    pub fn remaining(&self, client: &ClientId, query: QueryId) -> u32 {
        if self.is_completed(client, query) {
            return 0;
        }
        self.remaining
            .get(&(client.clone(), query))
            .copied()
            .unwrap_or_else(|| self.expected(query))
    }

    /// Count after one more EOF, or `None` when the pair already completed.
    pub fn after_eof(&self, client: &ClientId, query: QueryId) -> Option<u32> {
        if self.is_completed(client, query) {
            return None;
        }
        Some(self.remaining(client, query).saturating_sub(1))
    }

    /// Record a counter value; zero completes the pair and drops its entry.
    pub fn set(&mut self, client: &ClientId, query: QueryId, remaining: u32) {
        let key = (client.clone(), query);
        if remaining == 0 {
            self.remaining.remove(&key);
            self.completed.insert(key);
        } else {
            self.remaining.insert(key, remaining);
        }
    }

    pub fn is_completed(&self, client: &ClientId, query: QueryId) -> bool {
        self.completed.contains(&(client.clone(), query))
    }

    /// Every known counter, completed pairs as zero (oldest completion first);
    /// used for WAL snapshots.
    pub fn entries(&self) -> Vec<(ClientId, QueryId, u32)> {
        let mut out = self
            .remaining
            .iter()
            .map(|((c, q), n)| (c.clone(), *q, *n))
            .collect::<Vec<_>>();
        out.sort();
        out.extend(self.completed.iter().map(|(c, q)| (c.clone(), *q, 0)));
        out
    }

    pub fn reset(&mut self) {
        self.remaining.clear();
        self.completed.clear();
    }
}
