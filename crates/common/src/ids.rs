//! Typed identifiers shared across nodes, envelopes and persisted state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CqError, Result};

/// One of the five fixed analytics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw query number (1–5).
    pub u8,
);

impl QueryId {
    /// Argentinian-Spanish productions of the 2000s.
    pub const ARGENTINA_SPAIN: QueryId = QueryId(1);
    /// Top investing countries among single-country productions.
    pub const TOP_INVESTING: QueryId = QueryId(2);
    /// Best and worst rated Argentinian movies since 2000.
    pub const TOP_RATED: QueryId = QueryId(3);
    /// Most frequent actors in Argentinian movies since 2000.
    pub const TOP_ACTORS: QueryId = QueryId(4);
    /// Revenue/budget ratio by overview sentiment.
    pub const SENTIMENT: QueryId = QueryId(5);

    pub const ALL: [QueryId; 5] = [
        Self::ARGENTINA_SPAIN,
        Self::TOP_INVESTING,
        Self::TOP_RATED,
        Self::TOP_ACTORS,
        Self::SENTIMENT,
    ];

    /// Validate a raw query number.
    pub fn new(raw: u8) -> Result<Self> {
        if (1..=5).contains(&raw) {
            Ok(QueryId(raw))
        } else {
            Err(CqError::UnknownQuery {
                node: "envelope".to_string(),
                query: raw,
            })
        }
    }

    /// Parse the `Query` header: either the number or the gateway's query name.
    pub fn from_header(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Ok(raw) = value.parse::<u8>() {
            return Self::new(raw);
        }
        Self::ALL
            .into_iter()
            .find(|q| q.header_name().eq_ignore_ascii_case(value))
            .ok_or_else(|| CqError::Decode(format!("unrecognised Query header '{value}'")))
    }

    /// Gateway-facing name of the query.
    pub fn header_name(self) -> &'static str {
        match self.0 {
            1 => "ARGENTINIAN-SPANISH-PRODUCTIONS",
            2 => "TOP-INVESTING-COUNTRIES",
            3 => "TOP-ARGENTINIAN-MOVIES-BY-RATING",
            4 => "TOP-ARGENTINIAN-ACTORS",
            5 => "SENTIMENT-ANALYSIS",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque client identifier partitioning all per-node state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a published envelope: `<producer>:<seq>`.
///
/// `seq` is monotonically increasing per producer and persisted with the commit that
/// produced the envelope, so a replayed send carries the same id as the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId {
    /// Node name (or input queue name for externally sourced messages).
    pub producer: String,
    /// Per-producer sequence number.
    pub seq: u64,
}

impl BatchId {
    pub fn new(producer: impl Into<String>, seq: u64) -> Self {
        Self {
            producer: producer.into(),
            seq,
        }
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer, self.seq)
    }
}

impl FromStr for BatchId {
    type Err = CqError;

    fn from_str(s: &str) -> Result<Self> {
        let (producer, seq) = s
            .rsplit_once(':')
            .ok_or_else(|| CqError::Decode(format!("batch id '{s}' is not <producer>:<seq>")))?;
        if producer.is_empty() {
            return Err(CqError::Decode(format!("batch id '{s}' has no producer")));
        }
        let seq = seq
            .parse::<u64>()
            .map_err(|e| CqError::Decode(format!("batch id '{s}' has invalid seq: {e}")))?;
        Ok(Self::new(producer, seq))
    }
}

/// Replica number within a role's replica set (ids are not assumed contiguous).
pub type ReplicaId = u32;

/// Worker role, selected once at process startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Filter,
    Joiner,
    Aggregator,
    Pnl,
    Broker,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Filter => "filter",
            NodeRole::Joiner => "joiner",
            NodeRole::Aggregator => "aggregator",
            NodeRole::Pnl => "pnl",
            NodeRole::Broker => "broker",
        }
    }

    /// Queries a role serves when the deployment does not narrow them down.
    pub fn default_queries(self) -> Vec<QueryId> {
        match self {
            NodeRole::Filter => QueryId::ALL.to_vec(),
            NodeRole::Joiner => vec![QueryId::TOP_RATED, QueryId::TOP_ACTORS],
            NodeRole::Aggregator => vec![
                QueryId::TOP_INVESTING,
                QueryId::TOP_RATED,
                QueryId::TOP_ACTORS,
                QueryId::SENTIMENT,
            ],
            NodeRole::Pnl => vec![QueryId::SENTIMENT],
            NodeRole::Broker => vec![QueryId::TOP_RATED, QueryId::TOP_ACTORS, QueryId::SENTIMENT],
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = CqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filter" => Ok(NodeRole::Filter),
            "joiner" => Ok(NodeRole::Joiner),
            "aggregator" => Ok(NodeRole::Aggregator),
            "pnl" => Ok(NodeRole::Pnl),
            "broker" => Ok(NodeRole::Broker),
            other => Err(CqError::InvalidConfig(format!("unknown worker type '{other}'"))),
        }
    }
}

/// Side dataset joined against movies by the joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideStream {
    Ratings,
    Credits,
}

impl SideStream {
    /// Side stream correlated with a join query.
    pub fn for_query(query: QueryId) -> Option<Self> {
        match query {
            QueryId::TOP_RATED => Some(SideStream::Ratings),
            QueryId::TOP_ACTORS => Some(SideStream::Credits),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SideStream::Ratings => "ratings",
            SideStream::Credits => "credits",
        }
    }
}

impl fmt::Display for SideStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
