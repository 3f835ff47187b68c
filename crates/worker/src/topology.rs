//! Per-node configuration of a whole local cluster.
//!
//! Queries are spread over the replicas of each role in two passes: query `i` goes to
//! replica `(i % n) + 1`, then any replica left over takes another copy of the
//! queries in order. Fan-in counts follow from that assignment:
//! - broker: one EOF per filter serving the query;
//! - joiner / pnl: one EOF from the broker;
//! - aggregator: one EOF per filter (q2), joiner (q3, q4) or pnl (q5) replica;
//! - gateway: one EOF per filter for q1, one from the aggregator otherwise.

use std::collections::BTreeMap;
use std::path::Path;

use cq_common::config::{parse_or, DEFAULT_WAL_COMPACT_BYTES};
use cq_common::{BatchThresholds, CqError, NodeConfig, NodeRole, QueryId, ReplicaId, Result};

/// Highest aggregator count: one per query it can serve, there is no replication.
pub const MAX_AGGREGATORS: u32 = 4;

/// Replica counts and tunables of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySpec {
    pub filters: u32,
    pub joiners: u32,
    pub aggregators: u32,
    pub pnl: u32,
    pub batch: BatchThresholds,
    pub wal_compact_bytes: u64,
}

impl Default for TopologySpec {
    fn default() -> Self {
        Self {
            filters: 2,
            joiners: 2,
            aggregators: 1,
            pnl: 2,
            batch: BatchThresholds::default(),
            wal_compact_bytes: DEFAULT_WAL_COMPACT_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    /// Broker first, then filters, joiners, pnl and aggregators.
    pub nodes: Vec<NodeConfig>,
    /// Filter replica ids serving each query, in round-robin order.
    pub filter_replicas: BTreeMap<QueryId, Vec<ReplicaId>>,
    /// EOFs the gateway waits for per query before a client's result is complete.
    pub gateway_eofs: BTreeMap<QueryId, u32>,
}

impl Topology {
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.node_name() == name)
    }
}

/// Assign `candidates` to replicas `1..=replicas`.
pub fn distribute_queries(candidates: &[QueryId], replicas: u32) -> BTreeMap<ReplicaId, Vec<QueryId>> {
    let mut out = (1..=replicas).map(|id| (id, Vec::new())).collect::<BTreeMap<_, _>>();
    if replicas == 0 || candidates.is_empty() {
        return out;
    }
    let n = replicas as usize;
    for (i, query) in candidates.iter().enumerate() {
        if let Some(assigned) = out.get_mut(&((i % n) as ReplicaId + 1)) {
            assigned.push(*query);
        }
    }
    for i in 0..n.saturating_sub(candidates.len()) {
        let replica = ((i + candidates.len()) % n) as ReplicaId + 1;
        if let Some(assigned) = out.get_mut(&replica) {
            assigned.push(candidates[i % candidates.len()]);
        }
    }
    out
}

/// Query → replica ids serving it.
fn serving(assignment: &BTreeMap<ReplicaId, Vec<QueryId>>) -> BTreeMap<QueryId, Vec<ReplicaId>> {
    let mut out: BTreeMap<QueryId, Vec<ReplicaId>> = BTreeMap::new();
    for (replica, queries) in assignment {
        for query in queries {
            out.entry(*query).or_default().push(*replica);
        }
    }
    out
}

fn count(serving: &BTreeMap<QueryId, Vec<ReplicaId>>, query: QueryId) -> u32 {
    serving.get(&query).map_or(0, |ids| ids.len() as u32)
}

impl TopologySpec {
    /// Replica counts from `CQ_FILTER_REPLICAS`, `CQ_JOINER_REPLICAS`,
    /// `CQ_AGGREGATOR_REPLICAS` and `CQ_PNL_REPLICAS`; thresholds and WAL compaction
    /// from the same variables a single node reads.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let spec = Self {
            filters: parse_or(&lookup, "CQ_FILTER_REPLICAS", defaults.filters)?,
            joiners: parse_or(&lookup, "CQ_JOINER_REPLICAS", defaults.joiners)?,
            aggregators: parse_or(&lookup, "CQ_AGGREGATOR_REPLICAS", defaults.aggregators)?,
            pnl: parse_or(&lookup, "CQ_PNL_REPLICAS", defaults.pnl)?,
            batch: BatchThresholds::from_lookup(&lookup)?,
            wal_compact_bytes: parse_or(&lookup, "CQ_WAL_COMPACT_BYTES", defaults.wal_compact_bytes)?,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn validate(&self) -> Result<()> {
        for (role, n) in [("filters", self.filters), ("joiners", self.joiners), ("pnl", self.pnl)] {
            if n == 0 {
                return Err(CqError::InvalidConfig(format!("{role} must be at least 1")));
            }
        }
        if !(1..=MAX_AGGREGATORS).contains(&self.aggregators) {
            return Err(CqError::InvalidConfig(format!(
                "aggregators must be within 1..={MAX_AGGREGATORS}, got {}",
                self.aggregators
            )));
        }
        Ok(())
    }

    fn base(&self, role: NodeRole, id: ReplicaId, queries: Vec<QueryId>, state_root: &Path) -> NodeConfig {
        let mut cfg = NodeConfig::for_role(role, id, state_root);
        cfg.queries = queries;
        cfg.expected_eofs = cfg.queries.iter().map(|q| (*q, 1)).collect();
        cfg.eof_fanout = cfg.expected_eofs.clone();
        cfg.batch = self.batch;
        cfg.wal_compact_bytes = self.wal_compact_bytes;
        cfg.state_dir = state_root.join(cfg.node_name());
        cfg
    }

    /// Compute every node's configuration; state directories live under `state_root`.
    pub fn plan(&self, state_root: &Path) -> Result<Topology> {
        self.validate()?;
        let filters = distribute_queries(&QueryId::ALL, self.filters);
        let joiners = distribute_queries(&NodeRole::Joiner.default_queries(), self.joiners);
        let pnls = distribute_queries(&NodeRole::Pnl.default_queries(), self.pnl);
        let aggregators = distribute_queries(&NodeRole::Aggregator.default_queries(), self.aggregators);
        let filter_replicas = serving(&filters);
        let joiner_replicas = serving(&joiners);
        let pnl_replicas = serving(&pnls);

        let mut nodes = Vec::new();

        let broker_queries = NodeRole::Broker.default_queries();
        let mut broker = self.base(NodeRole::Broker, 1, broker_queries.clone(), state_root);
        broker.expected_eofs = broker_queries
            .iter()
            .map(|q| (*q, count(&filter_replicas, *q)))
            .collect();
        broker.replicas = joiner_replicas.clone();
        broker.replicas.extend(pnl_replicas.clone());
        nodes.push(broker);

        for (id, queries) in &filters {
            nodes.push(self.base(NodeRole::Filter, *id, queries.clone(), state_root));
        }
        for (id, queries) in &joiners {
            nodes.push(self.base(NodeRole::Joiner, *id, queries.clone(), state_root));
        }
        for (id, queries) in &pnls {
            nodes.push(self.base(NodeRole::Pnl, *id, queries.clone(), state_root));
        }
        for (id, queries) in &aggregators {
            let mut cfg = self.base(NodeRole::Aggregator, *id, queries.clone(), state_root);
            for query in queries {
                let upstream = match *query {
                    QueryId::TOP_INVESTING => count(&filter_replicas, *query),
                    QueryId::TOP_RATED | QueryId::TOP_ACTORS => count(&joiner_replicas, *query),
                    _ => count(&pnl_replicas, *query),
                };
                cfg.expected_eofs.insert(*query, upstream);
            }
            nodes.push(cfg);
        }

        let gateway_eofs = QueryId::ALL
            .iter()
            .map(|q| match *q {
                QueryId::ARGENTINA_SPAIN => (*q, count(&filter_replicas, *q)),
                _ => (*q, 1),
            })
            .collect();

        Ok(Topology {
            nodes,
            filter_replicas,
            gateway_eofs,
        })
    }
}
