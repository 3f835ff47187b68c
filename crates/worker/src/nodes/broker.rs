use std::collections::{BTreeMap, HashMap};

use cq_common::{ClientId, CqError, NodeConfig, NodeRole, Payload, QueryId, ReplicaId, Result, SideStream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ensure_served, unexpected_kind};
use crate::envelope::{Envelope, MessageKind};
use crate::eof::EofTracker;
use crate::node::{Effects, Node};
use crate::routing::{replica_queue, ReplicaSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum BrokerDelta {
    CursorMoved {
        client: ClientId,
        query: QueryId,
        cursor: ReplicaId,
    },
    EofCounted {
        client: ClientId,
        query: QueryId,
        remaining: u32,
    },
    ClientReleased {
        client: ClientId,
    },
}

/// Routes filter output to joiner and pnl replicas.
///
/// Movies and side-stream EOFs for queries 3/4 are broadcast to every joiner of the
/// query; ratings, credits and query 5 batches are round-robined one message at a
/// time with a per-client cursor.
#[derive(Debug)]
pub struct BrokerNode {
    replicas: BTreeMap<QueryId, Vec<ReplicaId>>,
    eofs: EofTracker,
    routes: HashMap<ClientId, BTreeMap<QueryId, ReplicaSet>>,
}

impl BrokerNode {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        for (query, ids) in &config.replicas {
            ReplicaSet::new(ids.clone()).map_err(|_| {
                CqError::InvalidConfig(format!("broker has no replicas for query {query}"))
            })?;
        }
        let queries = config.replicas.keys().copied().collect::<Vec<_>>();
        let expected = queries
            .iter()
            .map(|q| (*q, config.expected_eofs.get(q).copied().unwrap_or(1)))
            .collect();
        Ok(Self {
            replicas: config.replicas.clone(),
            eofs: EofTracker::new(expected),
            routes: HashMap::new(),
        })
    }

    fn queries(&self) -> Vec<QueryId> {
        self.replicas.keys().copied().collect()
    }

    /// Per-client replica sets, created on first use with cursors at the first id.
    fn routes_for(&mut self, client: &ClientId) -> Result<&mut BTreeMap<QueryId, ReplicaSet>> {
        if !self.routes.contains_key(client) {
            let mut sets = BTreeMap::new();
            for (query, ids) in &self.replicas {
                sets.insert(*query, ReplicaSet::new(ids.clone())?);
            }
            debug!(client = %client, "initialised client routes");
            self.routes.insert(client.clone(), sets);
        }
        self.routes
            .get_mut(client)
            .ok_or_else(|| CqError::Execution(format!("routes for {client} vanished")))
    }

    fn route(&mut self, client: &ClientId, query: QueryId) -> Result<ReplicaSet> {
        self.routes_for(client)?
            .get(&query)
            .cloned()
            .ok_or_else(|| CqError::UnknownQuery {
                node: NodeRole::Broker.as_str().to_string(),
                query: query.0,
            })
    }

    fn broadcast(&self, env: &Envelope, fx: &mut Effects<BrokerDelta>, kind: MessageKind) -> Result<()> {
        let ids = self.replicas.get(&env.query).cloned().unwrap_or_default();
        for replica in ids {
            fx.emit(
                replica_queue(env.query, replica)?,
                kind,
                env.query,
                &env.client,
                Payload::Text(env.body.clone()),
            )?;
        }
        Ok(())
    }

    fn round_robin(&mut self, env: &Envelope, fx: &mut Effects<BrokerDelta>, kind: MessageKind) -> Result<()> {
        let mut set = self.route(&env.client, env.query)?;
        let target = set.next_target();
        let sent = fx.emit(
            replica_queue(env.query, target)?,
            kind,
            env.query,
            &env.client,
            Payload::Text(env.body.clone()),
        )?;
        if sent {
            self.record(
                fx,
                BrokerDelta::CursorMoved {
                    client: env.client.clone(),
                    query: env.query,
                    cursor: set.current(),
                },
            )?;
        }
        Ok(())
    }

    fn check_side(&self, env: &Envelope) -> Result<()> {
        let expected = SideStream::for_query(env.query);
        if env.kind.side_stream() == expected && expected.is_some() {
            Ok(())
        } else {
            Err(unexpected_kind(NodeRole::Broker, env.kind, env.query))
        }
    }

    fn count_eof(&mut self, env: &Envelope, fx: &mut Effects<BrokerDelta>) -> Result<()> {
        let Some(remaining) = self.eofs.after_eof(&env.client, env.query) else {
            debug!(client = %env.client, query = %env.query, "surplus EOF ignored");
            return Ok(());
        };
        self.record(
            fx,
            BrokerDelta::EofCounted {
                client: env.client.clone(),
                query: env.query,
                remaining,
            },
        )?;
        if remaining > 0 {
            return Ok(());
        }
        let ids = self.replicas.get(&env.query).cloned().unwrap_or_default();
        for replica in &ids {
            fx.emit_eof(replica_queue(env.query, *replica)?, MessageKind::Eof, env.query, &env.client);
        }
        info!(client = %env.client, query = %env.query, replicas = ids.len(), "broadcast EOF");
        self.release_if_done(&env.client, fx)
    }

    /// Drop a client's cursors once the main stream of every query has ended.
    ///
    /// Side streams may still trail the movies EOF; a late side batch recreates
    /// the routes and its own EOF releases them again.
    fn release_if_done(&mut self, client: &ClientId, fx: &mut Effects<BrokerDelta>) -> Result<()> {
        if !self.routes.contains_key(client) {
            return Ok(());
        }
        if self.queries().iter().all(|q| self.eofs.is_completed(client, *q)) {
            self.record(
                fx,
                BrokerDelta::ClientReleased {
                    client: client.clone(),
                },
            )?;
        }
        Ok(())
    }
}

impl Node for BrokerNode {
    type Delta = BrokerDelta;

    fn handle(&mut self, env: &Envelope, fx: &mut Effects<BrokerDelta>) -> Result<()> {
        ensure_served(NodeRole::Broker, &self.queries(), env.query)?;
        if env.kind.side_stream().is_none() && self.eofs.is_completed(&env.client, env.query) {
            debug!(client = %env.client, query = %env.query, kind = %env.kind, "dropping message after EOF");
            return Ok(());
        }
        match (env.query, env.kind) {
            (QueryId::SENTIMENT, MessageKind::Movies | MessageKind::Data) => {
                self.round_robin(env, fx, MessageKind::Movies)
            }
            (QueryId::TOP_RATED | QueryId::TOP_ACTORS, MessageKind::Movies | MessageKind::Data) => {
                self.broadcast(env, fx, MessageKind::Movies)
            }
            (QueryId::TOP_RATED | QueryId::TOP_ACTORS, MessageKind::Ratings | MessageKind::Credits) => {
                self.check_side(env)?;
                self.round_robin(env, fx, env.kind)
            }
            (QueryId::TOP_RATED | QueryId::TOP_ACTORS, MessageKind::EofRatings | MessageKind::EofCredits) => {
                self.check_side(env)?;
                self.broadcast(env, fx, env.kind)?;
                self.release_if_done(&env.client, fx)
            }
            (_, MessageKind::Eof) => self.count_eof(env, fx),
            (query, kind) => Err(unexpected_kind(NodeRole::Broker, kind, query)),
        }
    }

    fn apply(&mut self, delta: BrokerDelta) -> Result<()> {
        match delta {
            BrokerDelta::CursorMoved { client, query, cursor } => {
                match self.routes_for(&client)?.get_mut(&query) {
                    Some(set) => set.set_cursor(cursor),
                    None => Err(CqError::UnknownQuery {
                        node: NodeRole::Broker.as_str().to_string(),
                        query: query.0,
                    }),
                }
            }
            BrokerDelta::EofCounted { client, query, remaining } => {
                self.eofs.set(&client, query, remaining);
                Ok(())
            }
            BrokerDelta::ClientReleased { client } => {
                self.routes.remove(&client);
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> Vec<BrokerDelta> {
        let mut out = Vec::new();
        let mut clients = self.routes.keys().collect::<Vec<_>>();
        clients.sort();
        for client in clients {
            for (query, set) in &self.routes[client] {
                out.push(BrokerDelta::CursorMoved {
                    client: client.clone(),
                    query: *query,
                    cursor: set.current(),
                });
            }
        }
        for (client, query, remaining) in self.eofs.entries() {
            out.push(BrokerDelta::EofCounted {
                client,
                query,
                remaining,
            });
        }
        out
    }

    fn reset(&mut self) {
        self.routes.clear();
        self.eofs.reset();
    }

    fn active_clients(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> BrokerNode {
        let mut cfg = NodeConfig::for_role(NodeRole::Broker, 1, "/tmp/unused");
        cfg.replicas.insert(QueryId(3), vec![1, 2]);
        cfg.replicas.insert(QueryId(4), vec![2]);
        cfg.replicas.insert(QueryId(5), vec![1, 2, 3]);
        cfg.expected_eofs.insert(QueryId(3), 2);
        BrokerNode::new(&cfg).expect("broker")
    }

    fn env(query: u8, kind: MessageKind, body: &str) -> Envelope {
        Envelope::new(QueryId(query), ClientId::new("c"), kind, body)
    }

    fn handle(node: &mut BrokerNode, e: &Envelope) -> Vec<String> {
        let mut fx = Effects::new();
        node.handle(e, &mut fx).expect("handle");
        fx.outgoing.into_iter().map(|o| o.queue).collect()
    }

    #[test]
    fn movies_broadcast_and_side_rows_round_robin() {
        let mut b = broker();
        assert_eq!(
            handle(&mut b, &env(3, MessageKind::Movies, "id,title\n1,a\n")),
            vec!["joiner_request_3_1", "joiner_request_3_2"]
        );
        let targets = (0..4)
            .flat_map(|_| handle(&mut b, &env(3, MessageKind::Ratings, "id,rating\n1,4\n")))
            .collect::<Vec<_>>();
        assert_eq!(
            targets,
            vec!["joiner_request_3_1", "joiner_request_3_2", "joiner_request_3_1", "joiner_request_3_2"]
        );
        assert_eq!(
            handle(&mut b, &env(3, MessageKind::EofRatings, "EOF")),
            vec!["joiner_request_3_1", "joiner_request_3_2"]
        );
    }

    #[test]
    fn sentiment_batches_rotate_over_pnl_replicas() {
        let mut b = broker();
        let targets = (0..4)
            .flat_map(|_| handle(&mut b, &env(5, MessageKind::Movies, "id\n1\n")))
            .collect::<Vec<_>>();
        assert_eq!(
            targets,
            vec!["pnl_request_5_1", "pnl_request_5_2", "pnl_request_5_3", "pnl_request_5_1"]
        );
        // cursors are per client
        let other = Envelope::new(QueryId(5), ClientId::new("d"), MessageKind::Movies, "id\n1\n");
        assert_eq!(handle(&mut b, &other), vec!["pnl_request_5_1"]);
    }

    #[test]
    fn main_eof_broadcasts_once_after_fan_in() {
        let mut b = broker();
        assert!(handle(&mut b, &env(3, MessageKind::Eof, "EOF")).is_empty());
        assert_eq!(
            handle(&mut b, &env(3, MessageKind::Eof, "EOF")),
            vec!["joiner_request_3_1", "joiner_request_3_2"]
        );
        assert!(handle(&mut b, &env(3, MessageKind::Eof, "EOF")).is_empty());
        assert!(handle(&mut b, &env(3, MessageKind::Movies, "id,title\n1,a\n")).is_empty());
        // side streams may trail the movies EOF
        assert_eq!(
            handle(&mut b, &env(3, MessageKind::Ratings, "id,rating\n1,4\n")),
            vec!["joiner_request_3_1"]
        );
    }

    #[test]
    fn mismatched_side_stream_is_rejected() {
        let mut b = broker();
        let e = env(3, MessageKind::Credits, "id,cast\n1,[]\n");
        assert!(matches!(b.handle(&e, &mut Effects::new()), Err(CqError::Decode(_))));
        let e = env(2, MessageKind::Data, "id\n1\n");
        assert!(matches!(
            b.handle(&e, &mut Effects::new()),
            Err(CqError::UnknownQuery { query: 2, .. })
        ));
    }

    #[test]
    fn snapshot_preserves_cursor_positions() {
        let mut b = broker();
        handle(&mut b, &env(5, MessageKind::Movies, "id\n1\n"));
        handle(&mut b, &env(5, MessageKind::Movies, "id\n1\n"));
        handle(&mut b, &env(3, MessageKind::Eof, "EOF"));

        let mut restored = broker();
        for delta in b.snapshot() {
            restored.apply(delta).expect("apply");
        }
        assert_eq!(handle(&mut restored, &env(5, MessageKind::Movies, "id\n1\n")), vec!["pnl_request_5_3"]);
        assert_eq!(
            handle(&mut restored, &env(3, MessageKind::Eof, "EOF")),
            vec!["joiner_request_3_1", "joiner_request_3_2"]
        );
    }

    #[test]
    fn client_state_released_after_all_queries_end() {
        let mut b = broker();
        handle(&mut b, &env(5, MessageKind::Movies, "id\n1\n"));
        assert_eq!(b.active_clients(), 1);
        for (q, n) in [(3, 2), (4, 1), (5, 1)] {
            for _ in 0..n {
                handle(&mut b, &env(q, MessageKind::Eof, "EOF"));
            }
        }
        assert_eq!(b.active_clients(), 0);
    }
}
