//! Row batches: the unit of data carried in envelope bodies and spill files.
//!
//! A batch is a header plus string-valued rows, encoded on the wire as CSV with a
//! header line. Rows shorter than the header are padded with empty values so ragged
//! upstream output never shifts columns.

use serde::{Deserialize, Serialize};

use crate::error::{CqError, Result};

/// Literal body of an end-of-stream marker.
pub const EOF_MARKER: &str = "EOF";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RowBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a batch from string literals; handy for fixtures.
    pub fn from_rows<C, R, V>(columns: C, rows: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let columns = columns.into_iter().map(Into::into).collect::<Vec<_>>();
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(Into::into).collect::<Vec<_>>())
            .collect();
        let mut batch = Self { columns, rows };
        batch.normalize_widths();
        batch
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of a required column.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| CqError::Decode(format!("batch has no '{name}' column")))
    }

    pub fn value<'a>(&'a self, row: &'a [String], name: &str) -> Option<&'a str> {
        self.column_index(name)
            .and_then(|idx| row.get(idx))
            .map(String::as_str)
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
        self.normalize_last();
    }

    /// Append `other`'s rows, aligning columns by name.
    ///
    /// Columns missing from `other` are filled with empty values; extra columns in
    /// `other` are dropped. An empty `self` adopts `other`'s header.
    pub fn extend_from(&mut self, other: &RowBatch) {
        if self.columns.is_empty() {
            self.columns = other.columns.clone();
        }
        if self.columns == other.columns {
            self.rows.extend(other.rows.iter().cloned());
            return;
        }
        let mapping = self
            .columns
            .iter()
            .map(|c| other.column_index(c))
            .collect::<Vec<_>>();
        for row in &other.rows {
            let aligned = mapping
                .iter()
                .map(|idx| idx.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                .collect();
            self.rows.push(aligned);
        }
    }

    /// Concatenate batches in order.
    pub fn concat<'a>(batches: impl IntoIterator<Item = &'a RowBatch>) -> RowBatch {
        let mut out = RowBatch::default();
        for b in batches {
            out.extend_from(b);
        }
        out
    }

    /// Keep only `names`, in that order. Unknown names yield empty values.
    pub fn project(&self, names: &[&str]) -> RowBatch {
        let idxs = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Vec<_>>();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                idxs.iter()
                    .map(|idx| idx.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        RowBatch {
            columns: names.iter().map(|n| n.to_string()).collect(),
            rows,
        }
    }

    /// Split into consecutive batches of at most `rows_per_chunk` rows.
    pub fn chunks(&self, rows_per_chunk: usize) -> Vec<RowBatch> {
        self.rows
            .chunks(rows_per_chunk.max(1))
            .map(|c| RowBatch {
                columns: self.columns.clone(),
                rows: c.to_vec(),
            })
            .collect()
    }

    /// Decode a CSV body with a header line.
    pub fn from_csv(text: &str) -> Result<RowBatch> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.trim_start_matches('\u{feff}').as_bytes());
        let columns = reader
            .headers()
            .map_err(|e| CqError::Decode(format!("csv header decode failed: {e}")))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        let mut batch = RowBatch::new(columns);
        for record in reader.records() {
            let record = record.map_err(|e| CqError::Decode(format!("csv row decode failed: {e}")))?;
            batch.push_row(record.iter().map(str::to_string).collect());
        }
        Ok(batch)
    }

    /// Encode as CSV with a header line.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .map_err(|e| CqError::Execution(format!("csv header encode failed: {e}")))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|e| CqError::Execution(format!("csv row encode failed: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| CqError::Execution(format!("csv flush failed: {e}")))?;
        String::from_utf8(bytes).map_err(|e| CqError::Execution(format!("csv is not utf-8: {e}")))
    }

    fn normalize_widths(&mut self) {
        let width = self.columns.len();
        for row in &mut self.rows {
            row.resize(width, String::new());
        }
    }

    fn normalize_last(&mut self) {
        let width = self.columns.len();
        if let Some(row) = self.rows.last_mut() {
            row.resize(width, String::new());
        }
    }
}

/// Cell `idx` of `row`, empty when the row is short.
pub fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map_or("", String::as_str)
}

/// Outgoing message payload, checked with [`Payload::can_send`] before publishing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Rows(RowBatch),
    /// Verbatim body: the `EOF` marker or CSV forwarded without re-encoding.
    Text(String),
}

impl Payload {
    pub fn eof() -> Self {
        Payload::Text(EOF_MARKER.to_string())
    }

    /// Empty row sets and blank strings are never published; markers such as `EOF` are.
    pub fn can_send(&self) -> bool {
        match self {
            Payload::Rows(batch) => !batch.is_empty(),
            Payload::Text(text) => !text.trim().is_empty(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        match self {
            Payload::Rows(batch) => batch.to_csv(),
            Payload::Text(text) => Ok(text.clone()),
        }
    }
}
