//! Node configuration, produced by deployment tooling and read from the environment.
//!
//! Every knob has a `CQ_*` variable. Parsing goes through an injectable lookup so
//! tests do not touch the process environment.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CqError, Result};
use crate::ids::{NodeRole, QueryId, ReplicaId};

pub const DEFAULT_BATCH_RATINGS: usize = 1000;
pub const DEFAULT_BATCH_CREDITS: usize = 1000;
pub const DEFAULT_BATCH_PNL: usize = 500;
pub const DEFAULT_WAL_COMPACT_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_GLOBAL_SHUTDOWN_FLAG: &str = "/tmp/shutdown_global.flag";

/// Row-count thresholds that trigger spill (joiner) or flush (pnl).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchThresholds {
    pub ratings: usize,
    pub credits: usize,
    pub pnl: usize,
}

impl BatchThresholds {
    /// `CQ_BATCH_RATINGS` / `CQ_BATCH_CREDITS` / `CQ_BATCH_PNL`, each at least 1.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let batch = Self {
            ratings: parse_or(lookup, "CQ_BATCH_RATINGS", DEFAULT_BATCH_RATINGS)?,
            credits: parse_or(lookup, "CQ_BATCH_CREDITS", DEFAULT_BATCH_CREDITS)?,
            pnl: parse_or(lookup, "CQ_BATCH_PNL", DEFAULT_BATCH_PNL)?,
        };
        if batch.ratings == 0 || batch.credits == 0 || batch.pnl == 0 {
            return Err(CqError::InvalidConfig(
                "batch thresholds must be at least 1".to_string(),
            ));
        }
        Ok(batch)
    }
}

impl Default for BatchThresholds {
    fn default() -> Self {
        Self {
            ratings: DEFAULT_BATCH_RATINGS,
            credits: DEFAULT_BATCH_CREDITS,
            pnl: DEFAULT_BATCH_PNL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Replica id within the role.
    pub worker_id: ReplicaId,
    pub role: NodeRole,
    /// Queries this instance serves.
    pub queries: Vec<QueryId>,
    /// Upstream producers per query that must each send EOF (fan-in).
    pub expected_eofs: BTreeMap<QueryId, u32>,
    /// EOF copies a filter emits per query (fan-out).
    pub eof_fanout: BTreeMap<QueryId, u32>,
    pub batch: BatchThresholds,
    /// Broker only: replica ids serving each downstream query.
    pub replicas: BTreeMap<QueryId, Vec<ReplicaId>>,
    /// WAL and spill files live here.
    pub state_dir: PathBuf,
    /// Presence of this file at shutdown turns a local shutdown into a fleet-wide wipe.
    pub global_shutdown_flag: PathBuf,
    pub wal_compact_bytes: u64,
    pub metrics_addr: Option<String>,
}

impl NodeConfig {
    /// Configuration with role defaults; used by the local topology and tests.
    pub fn for_role(role: NodeRole, worker_id: ReplicaId, state_dir: impl Into<PathBuf>) -> Self {
        let queries = role.default_queries();
        let ones = queries.iter().map(|q| (*q, 1)).collect::<BTreeMap<_, _>>();
        Self {
            worker_id,
            role,
            queries,
            expected_eofs: ones.clone(),
            eof_fanout: ones,
            batch: BatchThresholds::default(),
            replicas: BTreeMap::new(),
            state_dir: state_dir.into(),
            global_shutdown_flag: PathBuf::from(DEFAULT_GLOBAL_SHUTDOWN_FLAG),
            wal_compact_bytes: DEFAULT_WAL_COMPACT_BYTES,
            metrics_addr: None,
        }
    }

    /// Stable node name used in logs, batch ids and directory names.
    pub fn node_name(&self) -> String {
        match self.role {
            NodeRole::Broker => "broker".to_string(),
            role => format!("{}-{}", role.as_str(), self.worker_id),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let role = lookup("CQ_WORKER_TYPE")
            .ok_or_else(|| CqError::InvalidConfig("CQ_WORKER_TYPE is required".to_string()))?
            .parse::<NodeRole>()?;
        let worker_id = parse_or(&lookup, "CQ_WORKER_ID", 1_u32)?;

        let queries = match lookup("CQ_QUERIES").filter(|v| !v.trim().is_empty()) {
            Some(raw) => parse_query_list(&raw)?,
            None => role.default_queries(),
        };

        let mut expected_eofs = queries.iter().map(|q| (*q, 1)).collect::<BTreeMap<_, _>>();
        if let Some(raw) = lookup("CQ_EXPECTED_EOFS") {
            expected_eofs.extend(parse_count_map(&raw)?);
        }
        let mut eof_fanout = queries.iter().map(|q| (*q, 1)).collect::<BTreeMap<_, _>>();
        if let Some(raw) = lookup("CQ_EOF_FANOUT") {
            eof_fanout.extend(parse_count_map(&raw)?);
        }

        let mut replicas = match lookup("CQ_JOINERS") {
            Some(raw) => parse_joiner_map(&raw)?,
            None => BTreeMap::new(),
        };
        let pnl_replicas = parse_or(&lookup, "CQ_PNL_REPLICAS", 0_u32)?;
        if pnl_replicas > 0 {
            replicas.insert(QueryId::SENTIMENT, (1..=pnl_replicas).collect());
        }

        let batch = BatchThresholds::from_lookup(&lookup)?;

        let mut cfg = Self {
            worker_id,
            role,
            queries,
            expected_eofs,
            eof_fanout,
            batch,
            replicas,
            state_dir: PathBuf::new(),
            global_shutdown_flag: lookup("CQ_GLOBAL_SHUTDOWN_FLAG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GLOBAL_SHUTDOWN_FLAG)),
            wal_compact_bytes: parse_or(&lookup, "CQ_WAL_COMPACT_BYTES", DEFAULT_WAL_COMPACT_BYTES)?,
            metrics_addr: lookup("CQ_METRICS_ADDR").filter(|v| !v.trim().is_empty()),
        };
        cfg.state_dir = lookup("CQ_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/cq/{}", cfg.node_name())));
        Ok(cfg)
    }
}

/// Parse `key` through `lookup`, falling back to `default` when unset or blank.
pub fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| CqError::InvalidConfig(format!("{key}='{raw}': {e}"))),
        None => Ok(default),
    }
}

fn parse_query(raw: &str) -> Result<QueryId> {
    let n = raw
        .trim()
        .parse::<u8>()
        .map_err(|e| CqError::InvalidConfig(format!("invalid query id '{raw}': {e}")))?;
    QueryId::new(n).map_err(|_| CqError::InvalidConfig(format!("query id {n} out of range")))
}

/// `"1,2,5"` → queries.
pub fn parse_query_list(raw: &str) -> Result<Vec<QueryId>> {
    raw.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(parse_query)
        .collect()
}

/// `"3:2,4:2,5:1"` → per-query counts.
pub fn parse_count_map(raw: &str) -> Result<BTreeMap<QueryId, u32>> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (q, n) = pair
            .split_once(':')
            .ok_or_else(|| CqError::InvalidConfig(format!("expected q:n, got '{pair}'")))?;
        let n = n
            .trim()
            .parse::<u32>()
            .map_err(|e| CqError::InvalidConfig(format!("invalid count in '{pair}': {e}")))?;
        out.insert(parse_query(q)?, n);
    }
    Ok(out)
}

/// `"1:[3,4];2:3"` (joiner replica → served queries) → query → replica ids.
///
/// Replica lists keep declaration order, which is also the round-robin order.
pub fn parse_joiner_map(raw: &str) -> Result<BTreeMap<QueryId, Vec<ReplicaId>>> {
    let mut out: BTreeMap<QueryId, Vec<ReplicaId>> = BTreeMap::new();
    for entry in raw.split(';').filter(|p| !p.trim().is_empty()) {
        let (id, queries) = entry
            .split_once(':')
            .ok_or_else(|| CqError::InvalidConfig(format!("expected id:queries, got '{entry}'")))?;
        let id = id
            .trim()
            .parse::<ReplicaId>()
            .map_err(|e| CqError::InvalidConfig(format!("invalid joiner id in '{entry}': {e}")))?;
        let queries = queries.trim().trim_start_matches('[').trim_end_matches(']');
        for q in parse_query_list(queries)? {
            let ids = out.entry(q).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn broker_config_inverts_joiner_assignments() {
        let cfg = NodeConfig::from_lookup(lookup_from(&[
            ("CQ_WORKER_TYPE", "broker"),
            ("CQ_JOINERS", "1:[3,4];2:3;3:[4]"),
            ("CQ_PNL_REPLICAS", "2"),
            ("CQ_EXPECTED_EOFS", "3:2,4:2,5:2"),
        ]))
        .expect("config");
        assert_eq!(cfg.node_name(), "broker");
        assert_eq!(cfg.replicas[&QueryId::TOP_RATED], vec![1, 2]);
        assert_eq!(cfg.replicas[&QueryId::TOP_ACTORS], vec![1, 3]);
        assert_eq!(cfg.replicas[&QueryId::SENTIMENT], vec![1, 2]);
        assert_eq!(cfg.expected_eofs[&QueryId::SENTIMENT], 2);
        assert_eq!(cfg.state_dir, PathBuf::from("/var/lib/cq/broker"));
    }

    #[test]
    fn worker_defaults_follow_role() {
        let cfg = NodeConfig::from_lookup(lookup_from(&[
            ("CQ_WORKER_TYPE", "joiner"),
            ("CQ_WORKER_ID", "2"),
            ("CQ_BATCH_RATINGS", "10"),
        ]))
        .expect("config");
        assert_eq!(cfg.node_name(), "joiner-2");
        assert_eq!(cfg.queries, vec![QueryId::TOP_RATED, QueryId::TOP_ACTORS]);
        assert_eq!(cfg.expected_eofs[&QueryId::TOP_ACTORS], 1);
        assert_eq!(cfg.batch.ratings, 10);
        assert_eq!(cfg.batch.credits, DEFAULT_BATCH_CREDITS);
    }

    #[test]
    fn malformed_values_are_invalid_config() {
        for pairs in [
            vec![("CQ_WORKER_TYPE", "mapper")],
            vec![("CQ_WORKER_TYPE", "filter"), ("CQ_QUERIES", "1,9")],
            vec![("CQ_WORKER_TYPE", "filter"), ("CQ_EOF_FANOUT", "1=3")],
            vec![("CQ_WORKER_TYPE", "pnl"), ("CQ_BATCH_PNL", "0")],
        ] {
            let err = NodeConfig::from_lookup(lookup_from(&pairs)).expect_err("must fail");
            assert!(matches!(err, CqError::InvalidConfig(_)), "{err}");
        }
        assert!(NodeConfig::from_lookup(lookup_from(&[])).is_err());
    }
}
