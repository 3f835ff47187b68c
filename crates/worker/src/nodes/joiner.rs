use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use cq_common::metrics::global_metrics;
use cq_common::{
    BatchThresholds, ClientId, CqError, NodeConfig, NodeRole, Payload, QueryId, Result, RowBatch, SideStream,
};
use cq_execution::{join, validate_side};
use cq_spill::{spill_path, spill_root, BatchStore, SpillRef};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ensure_served, unexpected_kind};
use crate::envelope::{Envelope, MessageKind};
use crate::eof::{CompletedSet, EofTracker};
use crate::node::{Effects, Node};
use crate::routing::resolve;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum JoinerDelta {
    MoviesAppended {
        client: ClientId,
        query: QueryId,
        rows: RowBatch,
    },
    /// Main-stream EOF count; zero means the movies side is complete.
    EofCounted {
        client: ClientId,
        query: QueryId,
        remaining: u32,
    },
    SideAppended {
        client: ClientId,
        query: QueryId,
        rows: RowBatch,
    },
    SideSpilled {
        client: ClientId,
        query: QueryId,
        spill: SpillRef,
    },
    SideCompleted {
        client: ClientId,
        query: QueryId,
    },
    /// In-memory side rows were joined and dropped.
    SideDrained {
        client: ClientId,
        query: QueryId,
    },
    /// Spill rows before byte `offset` were joined and emitted.
    SpillReplayed {
        client: ClientId,
        query: QueryId,
        offset: u64,
    },
    /// Spill file fully replayed; deleted after commit.
    SpillReleased {
        client: ClientId,
        query: QueryId,
    },
    Finished {
        client: ClientId,
        query: QueryId,
    },
}

#[derive(Debug, Default)]
struct JoinState {
    movies: RowBatch,
    movies_complete: bool,
    side: BatchStore,
    /// Resume offset into the spill file.
    replayed: u64,
}

impl JoinState {
    fn replay_pending(&self) -> bool {
        self.movies_complete && self.side.is_spilled()
    }
}

/// Joins filtered movies with ratings (query 3) or credits (query 4).
///
/// Output for a (client, query) starts once movies are complete and the side stream
/// reached its batch threshold, was spilled, or completed. Until movies complete,
/// side rows past the threshold go to a spill file, which is later joined one
/// threshold-sized chunk per committed step.
#[derive(Debug)]
pub struct JoinerNode {
    name: String,
    queries: Vec<QueryId>,
    batch: BatchThresholds,
    spill_root: PathBuf,
    eofs: EofTracker,
    states: HashMap<(ClientId, QueryId), JoinState>,
    finished: CompletedSet<(ClientId, QueryId)>,
}

impl JoinerNode {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        if let Some(q) = config.queries.iter().find(|q| SideStream::for_query(**q).is_none()) {
            return Err(CqError::InvalidConfig(format!("joiner cannot serve query {q}")));
        }
        Ok(Self {
            name: config.node_name(),
            queries: config.queries.clone(),
            batch: config.batch,
            spill_root: spill_root(&config.state_dir),
            eofs: EofTracker::new(config.expected_eofs.clone()),
            states: HashMap::new(),
            finished: CompletedSet::default(),
        })
    }

    fn threshold(&self, stream: SideStream) -> usize {
        match stream {
            SideStream::Ratings => self.batch.ratings,
            SideStream::Credits => self.batch.credits,
        }
        .max(1)
    }

    fn state_mut(&mut self, client: ClientId, query: QueryId) -> &mut JoinState {
        self.states.entry((client, query)).or_default()
    }

    fn maybe_spill(
        &mut self,
        client: &ClientId,
        query: QueryId,
        stream: SideStream,
        fx: &mut Effects<JoinerDelta>,
    ) -> Result<()> {
        let threshold = self.threshold(stream);
        let Some(state) = self.states.get(&(client.clone(), query)) else {
            return Ok(());
        };
        if !state.side.should_spill(threshold, state.movies_complete) {
            return Ok(());
        }
        let fresh = spill_path(&self.spill_root, client, stream, query, state.side.generation());
        let appended = state.side.write_spill(&fresh)?;
        global_metrics().record_spill(&self.name, stream.as_str(), appended.bytes);
        debug!(
            client = %client,
            query = %query,
            rows = appended.spill.rows,
            bytes = appended.bytes,
            path = %appended.spill.path.display(),
            "spilled side stream"
        );
        self.record(
            fx,
            JoinerDelta::SideSpilled {
                client: client.clone(),
                query,
                spill: appended.spill,
            },
        )
    }

    /// Join the in-memory side rows plus at most one spill chunk. EOF goes out once
    /// the side stream completed and its spill file was fully replayed.
    fn try_progress(
        &mut self,
        client: &ClientId,
        query: QueryId,
        stream: SideStream,
        fx: &mut Effects<JoinerDelta>,
    ) -> Result<()> {
        let threshold = self.threshold(stream);
        let Some(state) = self.states.get(&(client.clone(), query)) else {
            return Ok(());
        };
        let side = &state.side;
        let ready = side.line_count() >= threshold || side.is_spilled() || side.is_complete();
        if !state.movies_complete || !ready {
            return Ok(());
        }

        let mut results = Vec::new();
        let buffered = side.buffered();
        if !buffered.is_empty() {
            results.push(join(query, &state.movies, &buffered)?);
        }
        // (offset reached, whole file replayed, path)
        let mut spill_step = None;
        if let (Some(spill), Some(mut chunks)) = (side.spill_ref(), side.replay_from(threshold, state.replayed)?) {
            let chunk = chunks.next().transpose()?;
            let offset = chunks.offset();
            let done = offset >= spill.committed_len;
            match chunk {
                Some(chunk) => results.push(join(query, &state.movies, &chunk)?),
                None if !done => {
                    return Err(CqError::Spill(format!(
                        "{} ends at {offset}, before its committed length {}",
                        spill.path.display(),
                        spill.committed_len
                    )))
                }
                None => {}
            }
            spill_step = Some((offset, done, spill.path.clone()));
        }
        let drained = !buffered.is_empty();
        let spill_left = matches!(spill_step, Some((_, false, _)));
        let finished = side.is_complete() && !spill_left;

        let out_queue = resolve(NodeRole::Joiner, query)?;
        let mut rows_out = 0;
        for result in results {
            rows_out += result.len();
            fx.emit(out_queue.clone(), MessageKind::Result, query, client, Payload::Rows(result))?;
        }
        debug!(client = %client, query = %query, rows_out, spill_left, "joined side rows");
        if drained {
            self.record(
                fx,
                JoinerDelta::SideDrained {
                    client: client.clone(),
                    query,
                },
            )?;
        }
        match spill_step {
            Some((offset, false, _)) => self.record(
                fx,
                JoinerDelta::SpillReplayed {
                    client: client.clone(),
                    query,
                    offset,
                },
            )?,
            Some((_, true, path)) => {
                self.record(
                    fx,
                    JoinerDelta::SpillReleased {
                        client: client.clone(),
                        query,
                    },
                )?;
                fx.cleanup.push(path);
            }
            None => {}
        }
        if finished {
            fx.emit_eof(out_queue, MessageKind::Eof, query, client);
            info!(client = %client, query = %query, "join finished");
            self.record(
                fx,
                JoinerDelta::Finished {
                    client: client.clone(),
                    query,
                },
            )?;
        }
        Ok(())
    }
}

impl Node for JoinerNode {
    type Delta = JoinerDelta;

    fn handle(&mut self, env: &Envelope, fx: &mut Effects<JoinerDelta>) -> Result<()> {
        ensure_served(NodeRole::Joiner, &self.queries, env.query)?;
        let (client, query) = (&env.client, env.query);
        if self.finished.contains(&(client.clone(), query)) {
            debug!(client = %client, query = %query, kind = %env.kind, "dropping message after EOF");
            return Ok(());
        }
        let stream = SideStream::for_query(query).ok_or_else(|| unexpected_kind(NodeRole::Joiner, env.kind, query))?;

        match env.kind {
            MessageKind::Movies | MessageKind::Data => {
                let rows = env.rows()?;
                if !rows.is_empty() {
                    self.record(
                        fx,
                        JoinerDelta::MoviesAppended {
                            client: client.clone(),
                            query,
                            rows,
                        },
                    )?;
                }
            }
            MessageKind::Eof => match self.eofs.after_eof(client, query) {
                Some(remaining) => self.record(
                    fx,
                    JoinerDelta::EofCounted {
                        client: client.clone(),
                        query,
                        remaining,
                    },
                )?,
                None => debug!(client = %client, query = %query, "surplus EOF ignored"),
            },
            MessageKind::Ratings | MessageKind::Credits if env.kind.side_stream() == Some(stream) => {
                let rows = env.rows()?;
                if !rows.is_empty() {
                    validate_side(stream, &rows)?;
                    self.record(
                        fx,
                        JoinerDelta::SideAppended {
                            client: client.clone(),
                            query,
                            rows,
                        },
                    )?;
                    self.maybe_spill(client, query, stream, fx)?;
                }
            }
            MessageKind::EofRatings | MessageKind::EofCredits if env.kind.side_stream() == Some(stream) => {
                self.record(
                    fx,
                    JoinerDelta::SideCompleted {
                        client: client.clone(),
                        query,
                    },
                )?;
            }
            kind => return Err(unexpected_kind(NodeRole::Joiner, kind, query)),
        }
        self.try_progress(client, query, stream, fx)
    }

    fn apply(&mut self, delta: JoinerDelta) -> Result<()> {
        match delta {
            JoinerDelta::MoviesAppended { client, query, rows } => {
                self.state_mut(client, query).movies.extend_from(&rows);
            }
            JoinerDelta::EofCounted {
                client,
                query,
                remaining,
            } => {
                self.eofs.set(&client, query, remaining);
                if remaining == 0 {
                    self.state_mut(client, query).movies_complete = true;
                }
            }
            JoinerDelta::SideAppended { client, query, rows } => {
                self.state_mut(client, query).side.append(&rows);
            }
            JoinerDelta::SideSpilled { client, query, spill } => {
                self.state_mut(client, query).side.apply_spilled(spill);
            }
            JoinerDelta::SideCompleted { client, query } => {
                self.state_mut(client, query).side.mark_complete();
            }
            JoinerDelta::SideDrained { client, query } => {
                self.state_mut(client, query).side.take_buffer();
            }
            JoinerDelta::SpillReplayed { client, query, offset } => {
                self.state_mut(client, query).replayed = offset;
            }
            JoinerDelta::SpillReleased { client, query } => {
                let state = self.state_mut(client, query);
                state.side.release_spill();
                state.replayed = 0;
            }
            JoinerDelta::Finished { client, query } => {
                self.states.remove(&(client.clone(), query));
                self.finished.insert((client, query));
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<JoinerDelta> {
        let mut keys = self.states.keys().collect::<Vec<_>>();
        keys.sort();
        let mut out = Vec::new();
        for key in keys {
            let (client, query) = (key.0.clone(), key.1);
            let state = &self.states[key];
            if !state.movies.columns.is_empty() {
                out.push(JoinerDelta::MoviesAppended {
                    client: client.clone(),
                    query,
                    rows: state.movies.clone(),
                });
            }
            // spilled before buffered: applying a spill clears the buffer
            if let Some(spill) = state.side.spill_ref() {
                out.push(JoinerDelta::SideSpilled {
                    client: client.clone(),
                    query,
                    spill: spill.clone(),
                });
                if state.replayed > 0 {
                    out.push(JoinerDelta::SpillReplayed {
                        client: client.clone(),
                        query,
                        offset: state.replayed,
                    });
                }
            }
            let buffered = state.side.buffered();
            if !buffered.is_empty() {
                out.push(JoinerDelta::SideAppended {
                    client: client.clone(),
                    query,
                    rows: buffered,
                });
            }
            if state.side.is_complete() {
                out.push(JoinerDelta::SideCompleted { client, query });
            }
        }
        for (client, query, remaining) in self.eofs.entries() {
            out.push(JoinerDelta::EofCounted {
                client,
                query,
                remaining,
            });
        }
        for (client, query) in self.finished.iter().cloned() {
            out.push(JoinerDelta::Finished { client, query });
        }
        out
    }

    fn spill_files(&self) -> Vec<(PathBuf, u64)> {
        self.states
            .values()
            .filter_map(|s| s.side.spill_ref())
            .map(|s| (s.path.clone(), s.committed_len))
            .collect()
    }

    fn has_pending_work(&self) -> bool {
        self.states.values().any(JoinState::replay_pending)
    }

    /// Continue the lowest (client, query) whose spill file is still being joined.
    fn resume(&mut self, fx: &mut Effects<JoinerDelta>) -> Result<()> {
        let next = self
            .states
            .iter()
            .filter(|(_, state)| state.replay_pending())
            .map(|(key, _)| key.clone())
            .min();
        let Some((client, query)) = next else {
            return Ok(());
        };
        let stream = SideStream::for_query(query)
            .ok_or_else(|| CqError::Execution(format!("joiner state for unjoinable query {query}")))?;
        self.try_progress(&client, query, stream, fx)
    }

    fn reset(&mut self) {
        self.states.clear();
        self.finished.clear();
        self.eofs.reset();
    }

    fn active_clients(&self) -> usize {
        self.states.keys().map(|(c, _)| c).collect::<BTreeSet<_>>().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}"))
    }

    fn joiner(dir: &std::path::Path, threshold: usize) -> JoinerNode {
        let mut cfg = NodeConfig::for_role(NodeRole::Joiner, 1, dir);
        cfg.batch.ratings = threshold;
        cfg.batch.credits = threshold;
        JoinerNode::new(&cfg).expect("joiner")
    }

    fn env(query: u8, kind: MessageKind, body: &str) -> Envelope {
        Envelope::new(QueryId(query), ClientId::new("c"), kind, body)
    }

    fn ratings(ids: &[&str]) -> String {
        let mut body = "userId,movieId,rating\n".to_string();
        for (i, id) in ids.iter().enumerate() {
            body.push_str(&format!("{i},{id},{}.0\n", i % 5));
        }
        body
    }

    const MOVIES: &str = "id,title\n10,Nueve reinas\n20,El aura\n";

    /// Collected output of a run: result rows sorted, EOF count, spill cleanups and
    /// the number of result envelopes.
    struct Output {
        rows: Vec<Vec<String>>,
        eofs: usize,
        cleanup: Vec<PathBuf>,
        batches: usize,
    }

    fn collect(out: &mut Output, fx: Effects<JoinerDelta>) {
        for sent in fx.outgoing {
            assert_eq!(sent.queue, "aggregator_request_3");
            match sent.envelope.kind {
                MessageKind::Eof => out.eofs += 1,
                MessageKind::Result => {
                    out.batches += 1;
                    out.rows.extend(sent.envelope.rows().expect("rows").rows);
                }
                other => panic!("unexpected {other}"),
            }
        }
        out.cleanup.extend(fx.cleanup);
    }

    /// Feed messages in order, driving continuations to completion after each one.
    fn run_all(node: &mut JoinerNode, messages: &[Envelope]) -> Output {
        let mut out = Output {
            rows: Vec::new(),
            eofs: 0,
            cleanup: Vec::new(),
            batches: 0,
        };
        for m in messages {
            let mut fx = Effects::new();
            node.handle(m, &mut fx).expect("handle");
            collect(&mut out, fx);
            while node.has_pending_work() {
                let mut fx = Effects::new();
                node.resume(&mut fx).expect("resume");
                assert!(!fx.deltas.is_empty());
                collect(&mut out, fx);
            }
        }
        out.rows.sort();
        out
    }

    fn run(node: &mut JoinerNode, messages: &[Envelope]) -> (Vec<Vec<String>>, usize, Vec<PathBuf>) {
        let out = run_all(node, messages);
        (out.rows, out.eofs, out.cleanup)
    }

    fn stream(side_first: bool) -> Vec<Envelope> {
        let side = vec![
            env(3, MessageKind::Ratings, &ratings(&["10", "99", "20"])),
            env(3, MessageKind::Ratings, &ratings(&["20", "10"])),
            env(3, MessageKind::Ratings, &ratings(&["30"])),
            env(3, MessageKind::EofRatings, "EOF"),
        ];
        let movies = vec![
            env(3, MessageKind::Movies, MOVIES),
            env(3, MessageKind::Eof, "EOF"),
        ];
        if side_first {
            side.into_iter().chain(movies).collect()
        } else {
            movies.into_iter().chain(side).collect()
        }
    }

    #[test]
    fn join_output_is_the_same_in_memory_and_spilled() {
        let dir = unique_dir("cq_joiner_equiv");
        let mut in_memory = joiner(&dir.join("mem"), 1000);
        let (expected, eofs, cleanup) = run(&mut in_memory, &stream(false));
        assert_eq!(eofs, 1);
        assert!(cleanup.is_empty());
        assert_eq!(expected.len(), 4);

        let mut spilling = joiner(&dir.join("spill"), 2);
        let (got, eofs, cleanup) = run(&mut spilling, &stream(true));
        assert_eq!(eofs, 1);
        assert_eq!(got, expected);
        assert_eq!(cleanup.len(), 1);
        assert!(cleanup[0].starts_with(dir.join("spill")));
        assert_eq!(spilling.active_clients(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn no_output_before_movies_complete_and_eof_waits_for_side() {
        let dir = unique_dir("cq_joiner_gate");
        let mut node = joiner(&dir, 1);
        let (rows, eofs, _) = run(
            &mut node,
            &[
                env(3, MessageKind::Movies, MOVIES),
                env(3, MessageKind::Ratings, &ratings(&["10"])),
            ],
        );
        assert!(rows.is_empty());
        assert_eq!(eofs, 0);
        assert_eq!(node.spill_files().len(), 1);

        let (rows, eofs, cleanup) = run(&mut node, &[env(3, MessageKind::Eof, "EOF")]);
        assert_eq!(rows.len(), 1);
        assert_eq!(eofs, 0);
        assert_eq!(cleanup.len(), 1);

        let (rows, eofs, _) = run(
            &mut node,
            &[
                env(3, MessageKind::Ratings, &ratings(&["20"])),
                env(3, MessageKind::EofRatings, "EOF"),
                env(3, MessageKind::Ratings, &ratings(&["20"])),
            ],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(eofs, 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn credits_for_query_four_and_stream_mismatch() {
        let dir = unique_dir("cq_joiner_credits");
        let mut node = joiner(&dir, 10);
        let credits = "cast,id\n\"[{'name': 'Ricardo Darín'}, {'name': 'Leticia Brédice'}]\",10\n";
        let messages = [
            env(4, MessageKind::Movies, MOVIES),
            env(4, MessageKind::Eof, "EOF"),
            env(4, MessageKind::Credits, credits),
            env(4, MessageKind::EofCredits, "EOF"),
        ];
        let mut results = Vec::new();
        for m in &messages {
            let mut fx = Effects::new();
            node.handle(m, &mut fx).expect("handle");
            results.extend(fx.outgoing);
        }
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].queue, "aggregator_request_4");
        assert_eq!(results[0].envelope.rows().expect("rows").len(), 2);
        assert_eq!(results[1].envelope.kind, MessageKind::Eof);

        let wrong = env(3, MessageKind::Credits, credits);
        assert!(matches!(node.handle(&wrong, &mut Effects::new()), Err(CqError::Decode(_))));
        let bad_side = env(3, MessageKind::Ratings, "movieId\n10\n");
        assert!(node.handle(&bad_side, &mut Effects::new()).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_rebuilds_spilled_and_buffered_state() {
        let dir = unique_dir("cq_joiner_snapshot");
        let mut node = joiner(&dir, 2);
        let (rows, _, _) = run(
            &mut node,
            &[
                env(3, MessageKind::Movies, MOVIES),
                env(3, MessageKind::Ratings, &ratings(&["10", "20"])),
                env(3, MessageKind::Ratings, &ratings(&["10"])),
                env(3, MessageKind::EofRatings, "EOF"),
            ],
        );
        assert!(rows.is_empty());

        let mut restored = joiner(&dir, 2);
        for delta in node.snapshot() {
            restored.apply(delta).expect("apply");
        }
        assert_eq!(restored.spill_files(), node.spill_files());
        let (rows, eofs, cleanup) = run(&mut restored, &[env(3, MessageKind::Eof, "EOF")]);
        assert_eq!(rows.len(), 3);
        assert_eq!(eofs, 1);
        assert_eq!(cleanup.len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn spilled_side_is_joined_one_chunk_per_step() {
        let dir = unique_dir("cq_joiner_chunks");
        let ids = ["10", "20", "10", "20", "10", "20", "99"];
        let messages = [
            env(3, MessageKind::Ratings, &ratings(&ids)),
            env(3, MessageKind::EofRatings, "EOF"),
            env(3, MessageKind::Movies, MOVIES),
        ];
        let mut node = joiner(&dir, 2);
        assert!(run_all(&mut node, &messages).rows.is_empty());
        assert_eq!(node.spill_files().len(), 1);

        // movies EOF joins the first chunk only
        let mut fx = Effects::new();
        node.handle(&env(3, MessageKind::Eof, "EOF"), &mut fx).expect("eof");
        assert_eq!(fx.outgoing.len(), 1);
        assert!(fx
            .deltas
            .iter()
            .any(|d| matches!(d, JoinerDelta::SpillReplayed { offset, .. } if *offset > 0)));
        assert!(node.has_pending_work());

        // a restart mid-replay resumes from the committed offset
        let mut restored = joiner(&dir, 2);
        for delta in node.snapshot() {
            restored.apply(delta).expect("apply");
        }
        let mut steps = 0;
        let mut rest = 0;
        let mut eofs = 0;
        let mut cleanup = Vec::new();
        while restored.has_pending_work() {
            let mut fx = Effects::new();
            restored.resume(&mut fx).expect("resume");
            steps += 1;
            for out in &fx.outgoing {
                match out.envelope.kind {
                    MessageKind::Result => rest += out.envelope.rows().expect("rows").len(),
                    MessageKind::Eof => eofs += 1,
                    other => panic!("unexpected {other}"),
                }
            }
            cleanup.extend(fx.cleanup);
        }
        assert_eq!(steps, 3);
        assert_eq!(rest, 4);
        assert_eq!(eofs, 1);
        assert_eq!(cleanup.len(), 1);
        assert_eq!(restored.active_clients(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_spill_file_fails_the_join() {
        let dir = unique_dir("cq_joiner_missing");
        let mut node = joiner(&dir, 1);
        run(
            &mut node,
            &[
                env(3, MessageKind::Movies, MOVIES),
                env(3, MessageKind::Ratings, &ratings(&["10"])),
            ],
        );
        let (path, _) = node.spill_files().pop().expect("spilled");
        std::fs::remove_file(path).expect("remove spill");
        let err = node
            .handle(&env(3, MessageKind::Eof, "EOF"), &mut Effects::new())
            .expect_err("missing spill");
        assert!(matches!(err, CqError::Spill(_)));
        let _ = std::fs::remove_dir_all(dir);
    }
}
