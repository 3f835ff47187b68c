//! In-process cluster: every node of a [`Topology`] as a tokio task over one
//! [`InProcessBus`], with this handle playing the ingestion and output gateways.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cq_common::{BatchId, ClientId, CqError, NodeConfig, NodeRole, QueryId, Result, RowBatch, SideStream};
use cq_execution::Classifier;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{InProcessBus, MessageBus};
use crate::envelope::{Envelope, MessageKind};
use crate::journal::Watermarks;
use crate::node::Node;
use crate::nodes::{AggregatorNode, BrokerNode, FilterNode, JoinerNode, PnlNode};
use crate::routing::{filter_queue, ReplicaSet, BROKER_QUEUE, GATEWAY_OUTPUT};
use crate::topology::{Topology, TopologySpec};
use crate::worker::{Shutdown, Worker};

/// Prefix of the gateway's producer name; each cluster start appends a session id.
pub const GATEWAY_PRODUCER: &str = "gateway";

/// Final result rows of one client, per query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientResults {
    pub rows: BTreeMap<QueryId, RowBatch>,
}

impl ClientResults {
    /// Rows for `query`; empty when the query produced nothing.
    pub fn query(&self, query: QueryId) -> RowBatch {
        self.rows.get(&query).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct ClientProgress {
    results: ClientResults,
    eofs: BTreeMap<QueryId, u32>,
}

type WorkerHandle = (String, JoinHandle<Result<Shutdown>>);

pub struct LocalCluster {
    bus: Arc<InProcessBus>,
    topology: Topology,
    shutdown: watch::Sender<Option<Shutdown>>,
    workers: Vec<WorkerHandle>,
    producer: String,
    next_seq: u64,
    cursors: BTreeMap<QueryId, ReplicaSet>,
    progress: HashMap<ClientId, ClientProgress>,
    watermarks: Watermarks,
}

fn session_id() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

async fn spawn_worker<N: Node>(
    config: NodeConfig,
    node: N,
    bus: &Arc<InProcessBus>,
    shutdown: &watch::Receiver<Option<Shutdown>>,
) -> Result<WorkerHandle> {
    let worker = Worker::open(config, node, Arc::clone(bus)).await?;
    let name = worker.name().to_string();
    let handle = tokio::spawn(worker.run(shutdown.clone()));
    Ok((name, handle))
}

impl LocalCluster {
    /// Plan the topology, open every worker (replaying any state left under
    /// `state_root`) and start consuming.
    pub async fn start(spec: &TopologySpec, state_root: &Path, classifier: Arc<dyn Classifier>) -> Result<Self> {
        let topology = spec.plan(state_root)?;
        let bus = Arc::new(InProcessBus::new());
        bus.declare_queue(GATEWAY_OUTPUT).await?;
        bus.declare_queue(BROKER_QUEUE).await?;

        let (shutdown, rx) = watch::channel(None);
        let mut workers = Vec::with_capacity(topology.nodes.len());
        for cfg in &topology.nodes {
            let cfg = cfg.clone();
            let handle = match cfg.role {
                NodeRole::Filter => {
                    let node = FilterNode::new(&cfg);
                    spawn_worker(cfg, node, &bus, &rx).await?
                }
                NodeRole::Broker => {
                    let node = BrokerNode::new(&cfg)?;
                    spawn_worker(cfg, node, &bus, &rx).await?
                }
                NodeRole::Joiner => {
                    let node = JoinerNode::new(&cfg)?;
                    spawn_worker(cfg, node, &bus, &rx).await?
                }
                NodeRole::Pnl => {
                    let node = PnlNode::new(&cfg, Arc::clone(&classifier));
                    spawn_worker(cfg, node, &bus, &rx).await?
                }
                NodeRole::Aggregator => {
                    let node = AggregatorNode::new(&cfg);
                    spawn_worker(cfg, node, &bus, &rx).await?
                }
            };
            workers.push(handle);
        }

        let cursors = topology
            .filter_replicas
            .iter()
            .map(|(query, ids)| ReplicaSet::new(ids.clone()).map(|set| (*query, set)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        info!(
            workers = workers.len(),
            state_root = %state_root.display(),
            "local cluster started"
        );
        Ok(Self {
            bus,
            topology,
            shutdown,
            workers,
            producer: format!("{GATEWAY_PRODUCER}-{}", session_id()),
            next_seq: 0,
            cursors,
            progress: HashMap::new(),
            watermarks: Watermarks::default(),
        })
    }

    pub fn bus(&self) -> &Arc<InProcessBus> {
        &self.bus
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn publish(&mut self, queue: &str, envelope: Envelope) -> Result<()> {
        self.next_seq += 1;
        let envelope = envelope.with_batch(BatchId::new(self.producer.clone(), self.next_seq));
        let headers = envelope.headers();
        self.bus.publish(queue, headers, envelope.body.into_bytes()).await
    }

    /// Send one movies batch to every query, one filter replica per query in
    /// round-robin order.
    pub async fn submit_movies(&mut self, client: &ClientId, movies: &RowBatch) -> Result<()> {
        if movies.is_empty() {
            return Ok(());
        }
        let body = movies.to_csv()?;
        for query in QueryId::ALL {
            let Some(replicas) = self.cursors.get_mut(&query) else {
                continue;
            };
            let replica = replicas.next_target();
            let envelope = Envelope::new(query, client.clone(), MessageKind::Data, body.clone());
            self.publish(&filter_queue(query, replica), envelope).await?;
        }
        Ok(())
    }

    /// Send one ratings (query 3) or credits (query 4) batch to the broker.
    pub async fn submit_side(&mut self, client: &ClientId, stream: SideStream, rows: &RowBatch) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let (query, kind) = match stream {
            SideStream::Ratings => (QueryId::TOP_RATED, MessageKind::Ratings),
            SideStream::Credits => (QueryId::TOP_ACTORS, MessageKind::Credits),
        };
        let envelope = Envelope::new(query, client.clone(), kind, rows.to_csv()?);
        self.publish(BROKER_QUEUE, envelope).await
    }

    /// End every input stream of `client`.
    pub async fn finish_client(&mut self, client: &ClientId) -> Result<()> {
        let targets = self
            .topology
            .filter_replicas
            .iter()
            .flat_map(|(query, ids)| ids.iter().map(move |id| (*query, filter_queue(*query, *id))))
            .collect::<Vec<_>>();
        for (query, queue) in targets {
            let eof = Envelope::new(query, client.clone(), MessageKind::Eof, cq_common::EOF_MARKER);
            self.publish(&queue, eof).await?;
        }
        for (query, kind) in [
            (QueryId::TOP_RATED, MessageKind::EofRatings),
            (QueryId::TOP_ACTORS, MessageKind::EofCredits),
        ] {
            let eof = Envelope::new(query, client.clone(), kind, cq_common::EOF_MARKER);
            self.publish(BROKER_QUEUE, eof).await?;
        }
        debug!(client = %client, "client inputs finished");
        Ok(())
    }

    fn is_complete(&self, client: &ClientId) -> bool {
        let Some(progress) = self.progress.get(client) else {
            return false;
        };
        self.topology
            .gateway_eofs
            .iter()
            .all(|(query, expected)| progress.eofs.get(query).copied().unwrap_or(0) >= *expected)
    }

    fn absorb(&mut self, queue: &str, envelope: Envelope) -> Result<()> {
        if let Some(batch) = &envelope.batch {
            if self.watermarks.is_duplicate(queue, batch) {
                debug!(batch = %batch, "duplicate result dropped");
                return Ok(());
            }
            self.watermarks.advance(queue, batch);
        }
        let progress = self.progress.entry(envelope.client.clone()).or_default();
        if envelope.kind.is_eof() {
            *progress.eofs.entry(envelope.query).or_default() += 1;
            return Ok(());
        }
        let rows = envelope.rows()?;
        progress
            .results
            .rows
            .entry(envelope.query)
            .or_default()
            .extend_from(&rows);
        Ok(())
    }

    /// Read the output queue until every query of `client` delivered its final EOF.
    ///
    /// Output of other clients read along the way is kept for their own `collect`.
    pub async fn collect(&mut self, client: &ClientId, timeout: Duration) -> Result<ClientResults> {
        let deadline = tokio::time::Instant::now() + timeout;
        let queues = [GATEWAY_OUTPUT.to_string()];
        while !self.is_complete(client) {
            let delivery = tokio::time::timeout_at(deadline, self.bus.next_delivery(&queues))
                .await
                .map_err(|_| CqError::Execution(format!("timed out waiting for results of client {client}")))??;
            self.bus.ack(&delivery).await?;
            match Envelope::decode(&delivery.headers, &delivery.body) {
                Ok(envelope) => self.absorb(&delivery.queue, envelope)?,
                Err(err) => warn!(error = %err, "dropping malformed result"),
            }
        }
        let progress = self.progress.remove(client).unwrap_or_default();
        info!(
            client = %client,
            queries = progress.results.rows.len(),
            "client results complete"
        );
        Ok(progress.results)
    }

    /// Signal every worker and wait for them to stop.
    pub async fn shutdown(self, mode: Shutdown) -> Result<()> {
        self.shutdown.send_replace(Some(mode));
        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        let mut first_error = None;
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            let outcome = joined.map_err(|e| CqError::Execution(format!("{name}: worker task failed: {e}")));
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) | Err(err) => {
                    warn!(node = %name, error = %err, "worker stopped with an error");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
