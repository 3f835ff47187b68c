//! The node state-machine contract shared by the five roles.

use std::fmt;
use std::path::PathBuf;

use cq_common::{ClientId, Payload, QueryId, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::{Envelope, MessageKind};

/// One role's per-client state machine.
///
/// Every state change goes through a `Delta`: [`Node::handle`] produces deltas via
/// [`Node::record`], the worker commits them to the WAL, and recovery rebuilds the
/// node by feeding the same deltas to [`Node::apply`] in log order.
pub trait Node: Send + Sync + 'static {
    type Delta: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    /// Decide the effect of one inbound message.
    fn handle(&mut self, envelope: &Envelope, fx: &mut Effects<Self::Delta>) -> Result<()>;

    fn apply(&mut self, delta: Self::Delta) -> Result<()>;

    /// Deltas that rebuild the current state from empty; the WAL compaction base.
    fn snapshot(&self) -> Vec<Self::Delta>;

    /// Spill files referenced by live state, with their committed lengths.
    fn spill_files(&self) -> Vec<(PathBuf, u64)> {
        Vec::new()
    }

    /// Whether [`Node::resume`] has output left to produce without new input.
    fn has_pending_work(&self) -> bool {
        false
    }

    /// Produce the next bounded slice of deferred output. Each call is committed
    /// on its own and must record at least one delta.
    fn resume(&mut self, _fx: &mut Effects<Self::Delta>) -> Result<()> {
        Ok(())
    }

    /// Drop all in-memory state.
    fn reset(&mut self);

    fn active_clients(&self) -> usize;

    /// Queue `delta` for the commit and apply it now.
    ///
    /// A non-empty `fx.deltas` is how the worker knows a failed `handle` may have
    /// touched state, so the delta is queued before it is applied.
    fn record(&mut self, fx: &mut Effects<Self::Delta>, delta: Self::Delta) -> Result<()> {
        fx.deltas.push(delta.clone());
        self.apply(delta)
    }
}

/// Envelope waiting to be stamped with a batch id and published.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub queue: String,
    pub envelope: Envelope,
}

/// Everything one handled message produced.
#[derive(Debug)]
pub struct Effects<D> {
    pub deltas: Vec<D>,
    pub outgoing: Vec<Outgoing>,
    /// Files to delete once the commit landed.
    pub cleanup: Vec<PathBuf>,
}

impl<D> Default for Effects<D> {
    fn default() -> Self {
        Self {
            deltas: Vec::new(),
            outgoing: Vec::new(),
            cleanup: Vec::new(),
        }
    }
}

impl<D> Effects<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `payload` for `queue`; returns `false` when the payload is not sendable.
    pub fn emit(
        &mut self,
        queue: impl Into<String>,
        kind: MessageKind,
        query: QueryId,
        client: &ClientId,
        payload: Payload,
    ) -> Result<bool> {
        if !payload.can_send() {
            return Ok(false);
        }
        let body = payload.encode()?;
        self.outgoing.push(Outgoing {
            queue: queue.into(),
            envelope: Envelope::new(query, client.clone(), kind, body),
        });
        Ok(true)
    }

    pub fn emit_eof(&mut self, queue: impl Into<String>, kind: MessageKind, query: QueryId, client: &ClientId) {
        self.outgoing.push(Outgoing {
            queue: queue.into(),
            envelope: Envelope::new(query, client.clone(), kind, cq_common::EOF_MARKER),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.outgoing.is_empty() && self.cleanup.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cq_common::RowBatch;

    use super::*;

    #[test]
    fn empty_payloads_are_not_emitted() {
        let mut fx = Effects::<()>::new();
        let client = ClientId::new("c");
        let empty = RowBatch::new(vec!["id".to_string()]);
        assert!(!fx
            .emit("q", MessageKind::Result, QueryId(1), &client, Payload::Rows(empty))
            .expect("emit"));
        assert!(!fx
            .emit("q", MessageKind::Result, QueryId(1), &client, Payload::Text(" \n".to_string()))
            .expect("emit"));
        assert!(fx.is_empty());

        let rows = RowBatch::from_rows(["id"], [["1"]]);
        assert!(fx
            .emit("q", MessageKind::Result, QueryId(1), &client, Payload::Rows(rows))
            .expect("emit"));
        fx.emit_eof("q", MessageKind::Eof, QueryId(1), &client);
        assert_eq!(fx.outgoing.len(), 2);
        assert_eq!(fx.outgoing[0].envelope.body, "id\n1\n");
        assert_eq!(fx.outgoing[1].envelope.body, "EOF");
    }
}
