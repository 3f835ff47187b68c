//! Disk spill for side datasets awaiting a join.
//!
//! Files are CSV with a header on first write. Every file a node references is
//! described by a [`SpillRef`] whose `committed_len` is the durable truncation point:
//! bytes past it were written by an attempt whose commit never landed.

pub mod layout;
pub mod reader;
pub mod reconcile;
pub mod store;
pub mod writer;

pub use layout::*;
pub use reader::{SpillChunks, SpillReader};
pub use reconcile::{reconcile_spill_dir, wipe_spill_dir, ReconcileReport};
pub use store::BatchStore;
pub use writer::{SpillAppend, SpillWriter};
