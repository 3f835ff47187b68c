use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cq_common::{ClientId, NodeConfig, NodeRole, Payload, QueryId, Result, RowBatch};
use cq_execution::{label_batch, Classifier};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_served, unexpected_kind};
use crate::envelope::{Envelope, MessageKind};
use crate::eof::EofTracker;
use crate::node::{Effects, Node};
use crate::routing::resolve;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum PnlDelta {
    Buffered { client: ClientId, rows: RowBatch },
    Flushed { client: ClientId },
    EofCounted {
        client: ClientId,
        query: QueryId,
        remaining: u32,
    },
    Released { client: ClientId },
}

/// Labels query 5 movies with a sentiment and forwards them in batches.
///
/// Classifier failures propagate untouched so the worker can requeue the message.
pub struct PnlNode {
    queries: Vec<QueryId>,
    flush_rows: usize,
    classifier: Arc<dyn Classifier>,
    eofs: EofTracker,
    buffers: BTreeMap<ClientId, RowBatch>,
}

impl fmt::Debug for PnlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PnlNode")
            .field("queries", &self.queries)
            .field("flush_rows", &self.flush_rows)
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

impl PnlNode {
    pub fn new(config: &NodeConfig, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            queries: config.queries.clone(),
            flush_rows: config.batch.pnl.max(1),
            classifier,
            eofs: EofTracker::new(config.expected_eofs.clone()),
            buffers: BTreeMap::new(),
        }
    }

    fn flush(&mut self, client: &ClientId, fx: &mut Effects<PnlDelta>) -> Result<()> {
        let Some(buffer) = self.buffers.get(client).filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        let labelled = label_batch(self.classifier.as_ref(), buffer)?;
        debug!(client = %client, rows = labelled.len(), "labelled batch");
        fx.emit(
            resolve(NodeRole::Pnl, QueryId::SENTIMENT)?,
            MessageKind::Result,
            QueryId::SENTIMENT,
            client,
            Payload::Rows(labelled),
        )?;
        self.record(fx, PnlDelta::Flushed { client: client.clone() })
    }
}

impl Node for PnlNode {
    type Delta = PnlDelta;

    fn handle(&mut self, env: &Envelope, fx: &mut Effects<PnlDelta>) -> Result<()> {
        ensure_served(NodeRole::Pnl, &self.queries, env.query)?;
        if env.query != QueryId::SENTIMENT {
            return Err(unexpected_kind(NodeRole::Pnl, env.kind, env.query));
        }
        if self.eofs.is_completed(&env.client, env.query) {
            debug!(client = %env.client, kind = %env.kind, "dropping message after EOF");
            return Ok(());
        }
        match env.kind {
            MessageKind::Movies | MessageKind::Data => {
                let rows = env.rows()?;
                if rows.is_empty() {
                    return Ok(());
                }
                self.record(
                    fx,
                    PnlDelta::Buffered {
                        client: env.client.clone(),
                        rows,
                    },
                )?;
                let buffered = self.buffers.get(&env.client).map_or(0, RowBatch::len);
                if buffered >= self.flush_rows {
                    self.flush(&env.client, fx)?;
                }
                Ok(())
            }
            MessageKind::Eof => {
                let Some(remaining) = self.eofs.after_eof(&env.client, env.query) else {
                    return Ok(());
                };
                if remaining == 0 {
                    self.flush(&env.client, fx)?;
                    fx.emit_eof(
                        resolve(NodeRole::Pnl, env.query)?,
                        MessageKind::Eof,
                        env.query,
                        &env.client,
                    );
                }
                self.record(
                    fx,
                    PnlDelta::EofCounted {
                        client: env.client.clone(),
                        query: env.query,
                        remaining,
                    },
                )?;
                if remaining == 0 {
                    self.record(
                        fx,
                        PnlDelta::Released {
                            client: env.client.clone(),
                        },
                    )?;
                }
                Ok(())
            }
            kind => Err(unexpected_kind(NodeRole::Pnl, kind, env.query)),
        }
    }

    fn apply(&mut self, delta: PnlDelta) -> Result<()> {
        match delta {
            PnlDelta::Buffered { client, rows } => {
                self.buffers.entry(client).or_default().extend_from(&rows);
            }
            PnlDelta::Flushed { client } | PnlDelta::Released { client } => {
                self.buffers.remove(&client);
            }
            PnlDelta::EofCounted {
                client,
                query,
                remaining,
            } => self.eofs.set(&client, query, remaining),
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<PnlDelta> {
        let mut out = self
            .buffers
            .iter()
            .map(|(client, rows)| PnlDelta::Buffered {
                client: client.clone(),
                rows: rows.clone(),
            })
            .collect::<Vec<_>>();
        out.extend(
            self.eofs
                .entries()
                .into_iter()
                .map(|(client, query, remaining)| PnlDelta::EofCounted {
                    client,
                    query,
                    remaining,
                }),
        );
        out
    }

    fn reset(&mut self) {
        self.buffers.clear();
        self.eofs.reset();
    }

    fn active_clients(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use cq_common::CqError;
    use cq_execution::{LexiconClassifier, Sentiment};

    use super::*;

    struct Flaky {
        down: AtomicBool,
    }

    impl Classifier for Flaky {
        fn classify(&self, text: &str) -> Result<Sentiment> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CqError::Classifier("model unavailable".to_string()));
            }
            LexiconClassifier::default().classify(text)
        }
    }

    fn pnl(flush_rows: usize, classifier: Arc<dyn Classifier>) -> PnlNode {
        let mut cfg = NodeConfig::for_role(NodeRole::Pnl, 1, "/tmp/unused");
        cfg.batch.pnl = flush_rows;
        PnlNode::new(&cfg, classifier)
    }

    fn movies(ids: &[&str]) -> String {
        let batch = RowBatch::from_rows(
            ["id", "title", "overview", "budget", "revenue"],
            ids.iter()
                .map(|id| [id.to_string(), format!("t{id}"), "A story of love and hope".to_string(), "10".to_string(), "30".to_string()]),
        );
        batch.to_csv().expect("csv")
    }

    fn env(kind: MessageKind, body: String) -> Envelope {
        Envelope::new(QueryId::SENTIMENT, ClientId::new("c"), kind, body)
    }

    #[test]
    fn flushes_on_threshold_and_on_eof() {
        let mut node = pnl(3, Arc::new(LexiconClassifier::default()));
        let mut fx = Effects::new();
        node.handle(&env(MessageKind::Movies, movies(&["1", "2"])), &mut fx)
            .expect("movies");
        assert!(fx.outgoing.is_empty());
        node.handle(&env(MessageKind::Movies, movies(&["3", "4"])), &mut fx)
            .expect("movies");
        assert_eq!(fx.outgoing.len(), 1);
        let labelled = fx.outgoing[0].envelope.rows().expect("rows");
        assert_eq!(labelled.len(), 4);
        assert_eq!(labelled.columns.last().map(String::as_str), Some("sentiment"));
        assert_eq!(fx.outgoing[0].queue, "aggregator_request_5");

        let mut fx = Effects::new();
        node.handle(&env(MessageKind::Movies, movies(&["5"])), &mut fx)
            .expect("movies");
        node.handle(&env(MessageKind::Eof, "EOF".to_string()), &mut fx)
            .expect("eof");
        let kinds = fx.outgoing.iter().map(|o| o.envelope.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![MessageKind::Result, MessageKind::Eof]);
        assert_eq!(node.active_clients(), 0);
    }

    #[test]
    fn classifier_failure_surfaces_as_transient() {
        let flaky = Arc::new(Flaky {
            down: AtomicBool::new(true),
        });
        let mut node = pnl(1, flaky.clone());
        let err = node
            .handle(&env(MessageKind::Movies, movies(&["1"])), &mut Effects::new())
            .expect_err("classifier down");
        assert!(err.is_transient());

        flaky.down.store(false, Ordering::SeqCst);
        let mut fresh = pnl(1, flaky);
        let mut fx = Effects::new();
        fresh
            .handle(&env(MessageKind::Movies, movies(&["1"])), &mut fx)
            .expect("classifier back");
        assert_eq!(fx.outgoing.len(), 1);
    }

    #[test]
    fn other_queries_are_rejected() {
        let mut node = pnl(1, Arc::new(LexiconClassifier::default()));
        let other = Envelope::new(QueryId(3), ClientId::new("c"), MessageKind::Movies, "id\n1\n");
        assert!(node.handle(&other, &mut Effects::new()).is_err());
    }

    #[test]
    fn snapshot_keeps_unflushed_rows() {
        let mut node = pnl(10, Arc::new(LexiconClassifier::default()));
        node.handle(&env(MessageKind::Movies, movies(&["1", "2"])), &mut Effects::new())
            .expect("movies");
        let mut restored = pnl(10, Arc::new(LexiconClassifier::default()));
        for delta in node.snapshot() {
            restored.apply(delta).expect("apply");
        }
        let mut fx = Effects::new();
        restored
            .handle(&env(MessageKind::Eof, "EOF".to_string()), &mut fx)
            .expect("eof");
        assert_eq!(fx.outgoing[0].envelope.rows().expect("rows").len(), 2);
    }
}
