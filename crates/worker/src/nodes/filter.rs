use std::collections::BTreeMap;

use cq_common::{ClientId, NodeConfig, NodeRole, Payload, QueryId, Result};
use cq_execution::apply_filter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_served, unexpected_kind};
use crate::envelope::{Envelope, MessageKind};
use crate::eof::CompletedSet;
use crate::node::{Effects, Node};
use crate::routing::{output_kind, resolve};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum FilterDelta {
    Terminated { client: ClientId, query: QueryId },
}

/// Stateless predicate + projection per query; remembers only which streams ended.
#[derive(Debug)]
pub struct FilterNode {
    queries: Vec<QueryId>,
    fanout: BTreeMap<QueryId, u32>,
    terminated: CompletedSet<(ClientId, QueryId)>,
}

impl FilterNode {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            queries: config.queries.clone(),
            fanout: config.eof_fanout.clone(),
            terminated: CompletedSet::default(),
        }
    }

    fn fanout(&self, query: QueryId) -> u32 {
        self.fanout.get(&query).copied().unwrap_or(1)
    }
}

impl Node for FilterNode {
    type Delta = FilterDelta;

    fn handle(&mut self, env: &Envelope, fx: &mut Effects<FilterDelta>) -> Result<()> {
        ensure_served(NodeRole::Filter, &self.queries, env.query)?;
        if self.terminated.contains(&(env.client.clone(), env.query)) {
            debug!(client = %env.client, query = %env.query, "dropping message after EOF");
            return Ok(());
        }
        let queue = resolve(NodeRole::Filter, env.query)?;
        match env.kind {
            MessageKind::Data | MessageKind::Movies => {
                let movies = env.rows()?;
                let kept = apply_filter(env.query, &movies)?;
                debug!(
                    client = %env.client,
                    query = %env.query,
                    rows_in = movies.len(),
                    rows_out = kept.len(),
                    "filtered batch"
                );
                fx.emit(
                    queue,
                    output_kind(NodeRole::Filter, env.query),
                    env.query,
                    &env.client,
                    Payload::Rows(kept),
                )?;
                Ok(())
            }
            MessageKind::Eof => {
                for _ in 0..self.fanout(env.query) {
                    fx.emit_eof(queue.clone(), MessageKind::Eof, env.query, &env.client);
                }
                self.record(
                    fx,
                    FilterDelta::Terminated {
                        client: env.client.clone(),
                        query: env.query,
                    },
                )
            }
            kind => Err(unexpected_kind(NodeRole::Filter, kind, env.query)),
        }
    }

    fn apply(&mut self, delta: FilterDelta) -> Result<()> {
        match delta {
            FilterDelta::Terminated { client, query } => {
                self.terminated.insert((client, query));
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<FilterDelta> {
        self.terminated
            .iter()
            .map(|(client, query)| FilterDelta::Terminated {
                client: client.clone(),
                query: *query,
            })
            .collect()
    }

    fn reset(&mut self) {
        self.terminated.clear();
    }

    fn active_clients(&self) -> usize {
        0
    }
}
