use std::collections::{BTreeSet, HashMap};

use cq_common::{ClientId, NodeConfig, NodeRole, Payload, QueryId, Result, RowBatch};
use cq_execution::reduce;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ensure_served, unexpected_kind};
use crate::envelope::{Envelope, MessageKind};
use crate::eof::EofTracker;
use crate::node::{Effects, Node};
use crate::routing::resolve;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum AggregatorDelta {
    PartialAppended {
        client: ClientId,
        query: QueryId,
        rows: RowBatch,
    },
    EofCounted {
        client: ClientId,
        query: QueryId,
        remaining: u32,
    },
    Released {
        client: ClientId,
        query: QueryId,
    },
}

/// Buffers partial rows per (client, query) and runs the final reduction once every
/// upstream producer sent its EOF.
#[derive(Debug)]
pub struct AggregatorNode {
    queries: Vec<QueryId>,
    eofs: EofTracker,
    partials: HashMap<(ClientId, QueryId), RowBatch>,
}

impl AggregatorNode {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            queries: config.queries.clone(),
            eofs: EofTracker::new(config.expected_eofs.clone()),
            partials: HashMap::new(),
        }
    }

    fn finish(&mut self, client: &ClientId, query: QueryId, fx: &mut Effects<AggregatorDelta>) -> Result<()> {
        let queue = resolve(NodeRole::Aggregator, query)?;
        let key = (client.clone(), query);
        let empty = RowBatch::default();
        let partials = self.partials.get(&key).unwrap_or(&empty);
        match reduce(query, partials) {
            Ok(result) => {
                info!(
                    client = %client,
                    query = %query,
                    partial_rows = partials.len(),
                    result_rows = result.len(),
                    "query reduced"
                );
                fx.emit(queue.clone(), MessageKind::Result, query, client, Payload::Rows(result))?;
            }
            Err(err) => {
                warn!(client = %client, query = %query, error = %err, "reduction failed, sending EOF only");
            }
        }
        fx.emit_eof(queue, MessageKind::Eof, query, client);
        self.record(
            fx,
            AggregatorDelta::Released {
                client: client.clone(),
                query,
            },
        )
    }
}

impl Node for AggregatorNode {
    type Delta = AggregatorDelta;

    fn handle(&mut self, env: &Envelope, fx: &mut Effects<AggregatorDelta>) -> Result<()> {
        ensure_served(NodeRole::Aggregator, &self.queries, env.query)?;
        if self.eofs.is_completed(&env.client, env.query) {
            debug!(client = %env.client, query = %env.query, kind = %env.kind, "dropping message after EOF");
            return Ok(());
        }
        match env.kind {
            MessageKind::Data | MessageKind::Result => {
                let rows = env.rows()?;
                if rows.is_empty() {
                    return Ok(());
                }
                self.record(
                    fx,
                    AggregatorDelta::PartialAppended {
                        client: env.client.clone(),
                        query: env.query,
                        rows,
                    },
                )
            }
            MessageKind::Eof => {
                let Some(remaining) = self.eofs.after_eof(&env.client, env.query) else {
                    return Ok(());
                };
                self.record(
                    fx,
                    AggregatorDelta::EofCounted {
                        client: env.client.clone(),
                        query: env.query,
                        remaining,
                    },
                )?;
                if remaining == 0 {
                    self.finish(&env.client, env.query, fx)?;
                }
                Ok(())
            }
            kind => Err(unexpected_kind(NodeRole::Aggregator, kind, env.query)),
        }
    }

    fn apply(&mut self, delta: AggregatorDelta) -> Result<()> {
        match delta {
            AggregatorDelta::PartialAppended { client, query, rows } => {
                self.partials.entry((client, query)).or_default().extend_from(&rows);
            }
            AggregatorDelta::EofCounted {
                client,
                query,
                remaining,
            } => self.eofs.set(&client, query, remaining),
            AggregatorDelta::Released { client, query } => {
                self.partials.remove(&(client, query));
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<AggregatorDelta> {
        let mut keys = self.partials.keys().collect::<Vec<_>>();
        keys.sort();
        let mut out = keys
            .into_iter()
            .map(|key| AggregatorDelta::PartialAppended {
                client: key.0.clone(),
                query: key.1,
                rows: self.partials[key].clone(),
            })
            .collect::<Vec<_>>();
        out.extend(
            self.eofs
                .entries()
                .into_iter()
                .map(|(client, query, remaining)| AggregatorDelta::EofCounted {
                    client,
                    query,
                    remaining,
                }),
        );
        out
    }

    fn reset(&mut self) {
        self.partials.clear();
        self.eofs.reset();
    }

    fn active_clients(&self) -> usize {
        self.partials.keys().map(|(c, _)| c).collect::<BTreeSet<_>>().len()
    }
}
