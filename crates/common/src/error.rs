use thiserror::Error;

/// Canonical error taxonomy shared by every pipeline crate.
///
/// Classification guidance:
/// - [`CqError::UnknownQuery`] / [`CqError::Decode`]: the message itself is unusable;
///   the worker logs it, acknowledges it and moves on
/// - [`CqError::Io`] / [`CqError::Transport`] / [`CqError::Classifier`]: transient;
///   the message is requeued and retried
/// - [`CqError::InvalidConfig`]: deployment mistakes caught at startup
/// - [`CqError::Wal`] / [`CqError::Spill`] / [`CqError::Execution`]: state or log corruption,
///   runtime invariants
#[derive(Debug, Error)]
pub enum CqError {
    /// Invalid or inconsistent node configuration.
    ///
    /// Examples:
    /// - unknown worker type in `CQ_WORKER_TYPE`
    /// - malformed `q:n` pair in `CQ_EXPECTED_EOFS`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A node received a query id it has no transformation/reduction/route for.
    #[error("unknown query {query} for {node}")]
    UnknownQuery {
        /// Node role name that rejected the query.
        node: String,
        /// Raw query id from the envelope.
        query: u8,
    },

    /// Envelope headers or body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Runtime invariant violations while applying node logic.
    #[error("execution error: {0}")]
    Execution(String),

    /// Write-ahead log framing/decoding failures.
    #[error("wal error: {0}")]
    Wal(String),

    /// A committed spill file is missing or unreadable.
    #[error("spill error: {0}")]
    Spill(String),

    /// Publish/consume/ack failures reported by the message bus.
    #[error("transport error: {0}")]
    Transport(String),

    /// Sentiment classifier invocation failures.
    #[error("classifier error: {0}")]
    Classifier(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CqError {
    /// Whether the inbound message should be requeued and retried instead of dropped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CqError::Io(_) | CqError::Transport(_) | CqError::Classifier(_)
        )
    }
}

/// Standard pipeline result alias.
pub type Result<T> = std::result::Result<T, CqError>;
