//! Message envelope: routing headers plus a CSV (or `EOF`) body.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cq_common::{BatchId, ClientId, CqError, QueryId, Result, RowBatch, EOF_MARKER};
use serde::{Deserialize, Serialize};

pub const HEADER_QUERY: &str = "Query";
pub const HEADER_CLIENT: &str = "ClientID";
pub const HEADER_TYPE: &str = "type";
pub const HEADER_BATCH: &str = "BatchID";

/// Transport headers, kept sorted so encoded envelopes are deterministic.
pub type Headers = BTreeMap<String, String>;

/// Closed set of message kinds carried in the `type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Data,
    Movies,
    Ratings,
    Credits,
    Eof,
    EofRatings,
    EofCredits,
    Result,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Data => "DATA",
            MessageKind::Movies => "MOVIES",
            MessageKind::Ratings => "RATINGS",
            MessageKind::Credits => "CREDITS",
            MessageKind::Eof => "EOF",
            MessageKind::EofRatings => "EOF_RATINGS",
            MessageKind::EofCredits => "EOF_CREDITS",
            MessageKind::Result => "RESULT",
        }
    }

    /// Main-stream or side-stream end marker.
    pub fn is_eof(self) -> bool {
        matches!(
            self,
            MessageKind::Eof | MessageKind::EofRatings | MessageKind::EofCredits
        )
    }

    /// Side stream a `RATINGS`/`CREDITS` (or matching EOF) message belongs to.
    pub fn side_stream(self) -> Option<cq_common::SideStream> {
        match self {
            MessageKind::Ratings | MessageKind::EofRatings => Some(cq_common::SideStream::Ratings),
            MessageKind::Credits | MessageKind::EofCredits => Some(cq_common::SideStream::Credits),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = CqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DATA" => Ok(MessageKind::Data),
            "MOVIES" => Ok(MessageKind::Movies),
            "RATINGS" => Ok(MessageKind::Ratings),
            "CREDITS" => Ok(MessageKind::Credits),
            "EOF" => Ok(MessageKind::Eof),
            "EOF_RATINGS" => Ok(MessageKind::EofRatings),
            "EOF_CREDITS" => Ok(MessageKind::EofCredits),
            "RESULT" => Ok(MessageKind::Result),
            other => Err(CqError::Decode(format!("unknown message type '{other}'"))),
        }
    }
}

/// Decoded message. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub query: QueryId,
    pub client: ClientId,
    pub kind: MessageKind,
    /// Absent only for messages entering from outside the pipeline.
    pub batch: Option<BatchId>,
    pub body: String,
}

impl Envelope {
    pub fn new(query: QueryId, client: ClientId, kind: MessageKind, body: impl Into<String>) -> Self {
        Self {
            query,
            client,
            kind,
            batch: None,
            body: body.into(),
        }
    }

    pub fn with_batch(mut self, batch: BatchId) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Decode transport headers and body.
    ///
    /// Header names match case-insensitively. A missing `type` header is read as
    /// `EOF` when the body is the EOF marker and `DATA` otherwise.
    pub fn decode(headers: &Headers, body: &[u8]) -> Result<Self> {
        let body = std::str::from_utf8(body)
            .map_err(|e| CqError::Decode(format!("body is not UTF-8: {e}")))?
            .to_string();

        let query = header(headers, HEADER_QUERY)
            .ok_or_else(|| CqError::Decode("missing Query header".to_string()))
            .and_then(QueryId::from_header)?;
        let client = header(headers, HEADER_CLIENT)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CqError::Decode("missing ClientID header".to_string()))?;
        let kind = match header(headers, HEADER_TYPE).filter(|t| !t.trim().is_empty()) {
            Some(raw) => raw.parse()?,
            None if body.trim() == EOF_MARKER => MessageKind::Eof,
            None => MessageKind::Data,
        };
        let batch = header(headers, HEADER_BATCH)
            .filter(|b| !b.trim().is_empty())
            .map(|b| b.trim().parse::<BatchId>())
            .transpose()?;

        Ok(Self {
            query,
            client: ClientId::new(client),
            kind,
            batch,
            body,
        })
    }

    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_QUERY.to_string(), self.query.to_string());
        headers.insert(HEADER_CLIENT.to_string(), self.client.to_string());
        headers.insert(HEADER_TYPE.to_string(), self.kind.as_str().to_string());
        if let Some(batch) = &self.batch {
            headers.insert(HEADER_BATCH.to_string(), batch.to_string());
        }
        headers
    }

    pub fn rows(&self) -> Result<RowBatch> {
        RowBatch::from_csv(&self.body)
    }
}

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .or_else(|| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}
