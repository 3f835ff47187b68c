//! Message-driven worker runtime for the movie-analytics pipeline.
//!
//! Architecture role:
//! - decodes transport envelopes and routes them through the static queue topology
//! - runs one node state machine per worker (filter, broker, joiner, pnl, aggregator)
//! - commits every handled message to a WAL before publishing, so a crash replays
//!   exactly the last unconfirmed send
//! - hosts an in-process bus and cluster driver for local runs and tests
//!
//! Key modules:
//! - [`envelope`]
//! - [`routing`]
//! - [`node`] / [`nodes`]
//! - [`journal`]
//! - [`worker`]
//! - [`bus`]
//! - [`topology`] / [`local`]
//!
//! Feature flags:
//! - `metrics-http`: lets `cq-local` serve the metrics exporter.

pub mod bus;
pub mod envelope;
pub mod eof;
pub mod journal;
pub mod local;
pub mod node;
pub mod nodes;
pub mod routing;
pub mod topology;
pub mod worker;

// Crate-root re-exports for the local runner, tests and transport adapters.
pub use bus::{Delivery, InProcessBus, MessageBus};
pub use envelope::{Envelope, Headers, MessageKind};
pub use local::{ClientResults, LocalCluster};
pub use node::{Effects, Node};
pub use topology::{Topology, TopologySpec};
pub use worker::{CrashPoint, Shutdown, StepOutcome, Worker};
