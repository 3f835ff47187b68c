use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use cq_common::{CqError, Result, RowBatch};
use tracing::debug;

use crate::layout::SpillRef;

/// Outcome of one append: the new durable reference and the bytes it added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillAppend {
    pub spill: SpillRef,
    pub bytes: u64,
}

pub struct SpillWriter;

impl SpillWriter {
    /// Append `batch` to the file at `path`, continuing from `previous`.
    ///
    /// The file is first cut back to `previous.committed_len` (0 for a new file), so an
    /// append retried after a failed commit never duplicates rows. The header is
    /// written only when the file starts empty. Data is synced before returning.
    pub fn append(path: &Path, previous: Option<&SpillRef>, batch: &RowBatch) -> Result<SpillAppend> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let start = previous.map_or(0, |p| p.committed_len);
        let prior_rows = previous.map_or(0, |p| p.rows);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(start)?;
        file.seek(SeekFrom::Start(start))?;

        let encoded = encode_rows(batch, start == 0)?;
        file.write_all(&encoded)?;
        file.flush()?;
        file.sync_data()?;

        let committed_len = start + encoded.len() as u64;
        debug!(
            path = %path.display(),
            rows = batch.len(),
            bytes = encoded.len(),
            committed_len,
            "spill append"
        );
        Ok(SpillAppend {
            spill: SpillRef {
                path: path.to_path_buf(),
                committed_len,
                rows: prior_rows + batch.len() as u64,
            },
            bytes: encoded.len() as u64,
        })
    }
}

fn encode_rows(batch: &RowBatch, with_header: bool) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if with_header {
        writer
            .write_record(&batch.columns)
            .map_err(|e| CqError::Execution(format!("spill header encode failed: {e}")))?;
    }
    for row in &batch.rows {
        writer
            .write_record(row)
            .map_err(|e| CqError::Execution(format!("spill row encode failed: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| CqError::Execution(format!("spill flush failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use cq_common::RowBatch;

    use super::SpillWriter;

    fn unique_path(prefix: &str, ext: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}.{ext}"))
    }

    #[test]
    fn header_is_written_once_and_retries_overwrite_uncommitted_tail() {
        let path = unique_path("cq_spill_writer", "csv");
        let first = RowBatch::from_rows(["id", "rating"], [["1", "4.0"]]);
        let second = RowBatch::from_rows(["id", "rating"], [["2", "3.5"]]);

        let a = SpillWriter::append(&path, None, &first).expect("first");
        let b = SpillWriter::append(&path, Some(&a.spill), &second).expect("second");
        // commit of `b` never happened; retry from `a`
        let b2 = SpillWriter::append(&path, Some(&a.spill), &second).expect("retry");
        assert_eq!(b, b2);
        assert_eq!(b2.spill.rows, 2);

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "id,rating\n1,4.0\n2,3.5\n");
        assert_eq!(b2.spill.committed_len, text.len() as u64);
        let _ = std::fs::remove_file(path);
    }
}
