#![deny(missing_docs)]

//! Pure query logic for the five fixed movie-analytics queries.
//!
//! Architecture role:
//! - filter predicates and projections (queries 1–5)
//! - movies ⋈ ratings / movies ⋈ credits joins (queries 3, 4)
//! - final reductions (queries 2–5)
//! - sentiment labelling for query 5
//!
//! Nothing here performs I/O; node state machines in the worker crate call into
//! these functions and own persistence and messaging.
//!
//! Key modules:
//! - [`filters`]
//! - [`join`]
//! - [`reduce`]
//! - [`sentiment`]
//! - [`literal`]

pub mod filters;
pub mod join;
pub mod literal;
pub mod reduce;
pub mod sentiment;

// Node state machines import these directly from the crate root.
pub use filters::apply_filter;
pub use join::{join, validate_side};
pub use literal::{name_list, parse_literal, Literal};
pub use reduce::{format_number, reduce};
pub use sentiment::{label_batch, Classifier, LexiconClassifier, Sentiment};
