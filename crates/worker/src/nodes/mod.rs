//! The five node roles.

pub mod aggregator;
pub mod broker;
pub mod filter;
pub mod joiner;
pub mod pnl;

pub use aggregator::{AggregatorDelta, AggregatorNode};
pub use broker::{BrokerDelta, BrokerNode};
pub use filter::{FilterDelta, FilterNode};
pub use joiner::{JoinerDelta, JoinerNode};
pub use pnl::{PnlDelta, PnlNode};

use cq_common::{CqError, NodeRole, QueryId, Result};

use crate::envelope::MessageKind;

/// `UnknownQuery` unless this instance serves `query`.
fn ensure_served(role: NodeRole, queries: &[QueryId], query: QueryId) -> Result<()> {
    if queries.contains(&query) {
        Ok(())
    } else {
        Err(CqError::UnknownQuery {
            node: role.as_str().to_string(),
            query: query.0,
        })
    }
}

fn unexpected_kind(role: NodeRole, kind: MessageKind, query: QueryId) -> CqError {
    CqError::Decode(format!("{role} does not accept {kind} for query {query}"))
}
