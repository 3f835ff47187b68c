//! Static queue topology and the broker's replica round-robin.
//!
//! Queue names:
//! - `filter_request_<q>_<id>`: one queue per filter replica and query, so each
//!   replica sees its own EOF after its own data;
//! - `joiner_request_<q>_<id>`, `pnl_request_5_<id>`: broker fan-out targets;
//! - `aggregator_request_<q>`: shared fan-in queue of the aggregator serving `q`;
//! - `broker`, `gateway_output`.

use cq_common::{CqError, NodeConfig, NodeRole, QueryId, ReplicaId, Result};
use serde::{Deserialize, Serialize};

use crate::envelope::MessageKind;

pub const GATEWAY_OUTPUT: &str = "gateway_output";
pub const BROKER_QUEUE: &str = "broker";

pub fn filter_queue(query: QueryId, replica: ReplicaId) -> String {
    format!("filter_request_{query}_{replica}")
}

pub fn joiner_queue(query: QueryId, replica: ReplicaId) -> String {
    format!("joiner_request_{query}_{replica}")
}

pub fn pnl_queue(replica: ReplicaId) -> String {
    format!("pnl_request_{}_{replica}", QueryId::SENTIMENT)
}

pub fn aggregator_queue(query: QueryId) -> String {
    format!("aggregator_request_{query}")
}

fn unknown(role: NodeRole, query: QueryId) -> CqError {
    CqError::UnknownQuery {
        node: role.as_str().to_string(),
        query: query.0,
    }
}

/// Output queue of a non-broker node for `query`.
///
/// The broker's destinations depend on per-client replica state; see
/// [`replica_queue`].
pub fn resolve(role: NodeRole, query: QueryId) -> Result<String> {
    match (role, query) {
        (NodeRole::Filter, QueryId::ARGENTINA_SPAIN) => Ok(GATEWAY_OUTPUT.to_string()),
        (NodeRole::Filter, QueryId::TOP_INVESTING) => Ok(aggregator_queue(query)),
        (NodeRole::Filter, QueryId::TOP_RATED | QueryId::TOP_ACTORS | QueryId::SENTIMENT) => {
            Ok(BROKER_QUEUE.to_string())
        }
        (NodeRole::Joiner, QueryId::TOP_RATED | QueryId::TOP_ACTORS) => Ok(aggregator_queue(query)),
        (NodeRole::Pnl, QueryId::SENTIMENT) => Ok(aggregator_queue(query)),
        (
            NodeRole::Aggregator,
            QueryId::TOP_INVESTING | QueryId::TOP_RATED | QueryId::TOP_ACTORS | QueryId::SENTIMENT,
        ) => Ok(GATEWAY_OUTPUT.to_string()),
        (role, query) => Err(unknown(role, query)),
    }
}

/// Input queue of replica `replica` behind the broker for `query`.
pub fn replica_queue(query: QueryId, replica: ReplicaId) -> Result<String> {
    match query {
        QueryId::TOP_RATED | QueryId::TOP_ACTORS => Ok(joiner_queue(query, replica)),
        QueryId::SENTIMENT => Ok(pnl_queue(replica)),
        other => Err(unknown(NodeRole::Broker, other)),
    }
}

/// Kind stamped on the data a node emits for `query`.
pub fn output_kind(role: NodeRole, query: QueryId) -> MessageKind {
    match (role, query) {
        (NodeRole::Filter, QueryId::ARGENTINA_SPAIN) => MessageKind::Result,
        (NodeRole::Filter, QueryId::TOP_INVESTING) => MessageKind::Data,
        (NodeRole::Filter, _) => MessageKind::Movies,
        _ => MessageKind::Result,
    }
}

/// Queues a node consumes from.
pub fn input_queues(config: &NodeConfig) -> Vec<String> {
    let id = config.worker_id;
    match config.role {
        NodeRole::Filter => config.queries.iter().map(|q| filter_queue(*q, id)).collect(),
        NodeRole::Joiner => config.queries.iter().map(|q| joiner_queue(*q, id)).collect(),
        NodeRole::Pnl => vec![pnl_queue(id)],
        NodeRole::Aggregator => config.queries.iter().map(|q| aggregator_queue(*q)).collect(),
        NodeRole::Broker => vec![BROKER_QUEUE.to_string()],
    }
}

/// Queues a node may publish to, declared at startup.
pub fn output_queues(config: &NodeConfig) -> Result<Vec<String>> {
    let mut out = Vec::new();
    match config.role {
        NodeRole::Broker => {
            for (query, replicas) in &config.replicas {
                for replica in replicas {
                    out.push(replica_queue(*query, *replica)?);
                }
            }
        }
        role => {
            for query in &config.queries {
                let queue = resolve(role, *query)?;
                if !out.contains(&queue) {
                    out.push(queue);
                }
            }
        }
    }
    Ok(out)
}

/// Replica ids behind one broker destination plus the round-robin cursor.
///
/// The cursor always names a member of `ids`; ids need not be contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    ids: Vec<ReplicaId>,
    cursor: ReplicaId,
}

impl ReplicaSet {
    /// Cursor starts at the first declared replica.
    pub fn new(ids: Vec<ReplicaId>) -> Result<Self> {
        let cursor = *ids
            .first()
            .ok_or_else(|| CqError::InvalidConfig("replica set is empty".to_string()))?;
        Ok(Self { ids, cursor })
    }

    pub fn ids(&self) -> &[ReplicaId] {
        &self.ids
    }

    pub fn current(&self) -> ReplicaId {
        self.cursor
    }

    /// Replica after the current one, wrapping at the end of the list.
    fn following(&self) -> ReplicaId {
        let pos = self.ids.iter().position(|id| *id == self.cursor).unwrap_or(0);
        self.ids[(pos + 1) % self.ids.len()]
    }

    /// Replica to send to now; the cursor moves on to the next one.
    pub fn next_target(&mut self) -> ReplicaId {
        let target = self.cursor;
        self.cursor = self.following();
        target
    }

    /// Restore a persisted cursor; ids outside the set are rejected.
    pub fn set_cursor(&mut self, cursor: ReplicaId) -> Result<()> {
        if !self.ids.contains(&cursor) {
            return Err(CqError::InvalidConfig(format!(
                "cursor {cursor} is not one of {:?}",
                self.ids
            )));
        }
        self.cursor = cursor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn static_table_matches_pipeline_shape() {
        assert_eq!(resolve(NodeRole::Filter, QueryId(1)).expect("q1"), GATEWAY_OUTPUT);
        assert_eq!(resolve(NodeRole::Filter, QueryId(2)).expect("q2"), "aggregator_request_2");
        assert_eq!(resolve(NodeRole::Filter, QueryId(4)).expect("q4"), BROKER_QUEUE);
        assert_eq!(resolve(NodeRole::Joiner, QueryId(3)).expect("j3"), "aggregator_request_3");
        assert_eq!(resolve(NodeRole::Pnl, QueryId(5)).expect("p5"), "aggregator_request_5");
        assert_eq!(resolve(NodeRole::Aggregator, QueryId(5)).expect("a5"), GATEWAY_OUTPUT);
        assert_eq!(replica_queue(QueryId(5), 3).expect("pnl"), "pnl_request_5_3");
        assert_eq!(replica_queue(QueryId(4), 2).expect("joiner"), "joiner_request_4_2");
    }

    #[test]
    fn missing_entries_are_unknown_query() {
        for (role, q) in [
            (NodeRole::Joiner, 5),
            (NodeRole::Pnl, 3),
            (NodeRole::Aggregator, 1),
            (NodeRole::Broker, 3),
            (NodeRole::Filter, 9),
        ] {
            assert!(matches!(
                resolve(role, QueryId(q)),
                Err(CqError::UnknownQuery { .. })
            ));
        }
        assert!(replica_queue(QueryId(2), 1).is_err());
    }

    #[test]
    fn node_queues_follow_config() {
        let mut cfg = NodeConfig::for_role(NodeRole::Filter, 2, "/tmp/x");
        cfg.queries = vec![QueryId(1), QueryId(3), QueryId(4)];
        assert_eq!(
            input_queues(&cfg),
            vec!["filter_request_1_2", "filter_request_3_2", "filter_request_4_2"]
        );
        assert_eq!(
            output_queues(&cfg).expect("outputs"),
            vec![GATEWAY_OUTPUT.to_string(), BROKER_QUEUE.to_string()]
        );

        let mut broker = NodeConfig::for_role(NodeRole::Broker, 1, "/tmp/x");
        broker.replicas.insert(QueryId(3), vec![1, 2]);
        broker.replicas.insert(QueryId(5), vec![4]);
        assert_eq!(input_queues(&broker), vec![BROKER_QUEUE]);
        assert_eq!(
            output_queues(&broker).expect("outputs"),
            vec!["joiner_request_3_1", "joiner_request_3_2", "pnl_request_5_4"]
        );
    }

    #[test]
    fn cursor_wraps_over_sparse_ids() {
        let mut set = ReplicaSet::new(vec![4, 7, 9]).expect("set");
        assert_eq!(set.current(), 4);
        assert_eq!(set.next_target(), 4);
        assert_eq!(set.next_target(), 7);
        assert_eq!(set.next_target(), 9);
        assert_eq!(set.current(), 4);
        assert!(set.set_cursor(5).is_err());
        set.set_cursor(9).expect("cursor");
        assert_eq!(set.next_target(), 9);
        assert_eq!(set.current(), 4);
        assert!(ReplicaSet::new(Vec::new()).is_err());
    }

    #[test]
    fn round_robin_is_fair() {
        for k in 1..=5_u32 {
            for n in 0..=23_u32 {
                let mut set = ReplicaSet::new((1..=k).collect()).expect("set");
                let mut hits = HashMap::<ReplicaId, u32>::new();
                for _ in 0..n {
                    *hits.entry(set.next_target()).or_default() += 1;
                }
                for id in 1..=k {
                    let got = hits.get(&id).copied().unwrap_or(0);
                    assert!(got == n / k || got == n.div_ceil(k), "k={k} n={n} id={id} got={got}");
                }
            }
        }
    }
}
