use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Take};

use cq_common::{CqError, Result, RowBatch};

use crate::layout::SpillRef;

pub struct SpillReader {
    chunk_rows: usize,
}

impl SpillReader {
    pub fn new(chunk_rows: usize) -> Self {
        Self {
            chunk_rows: chunk_rows.max(1),
        }
    }

    /// Lazily replay the committed prefix of `spill` in chunks of `chunk_rows` rows.
    pub fn chunks(&self, spill: &SpillRef) -> Result<SpillChunks> {
        self.chunks_from(spill, 0)
    }

    /// Like [`SpillReader::chunks`], resuming at byte `offset` of the file.
    ///
    /// `offset` must be a value previously returned by [`SpillChunks::offset`];
    /// anything inside the header starts at the first row.
    pub fn chunks_from(&self, spill: &SpillRef, offset: u64) -> Result<SpillChunks> {
        let mut header = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(open(spill)?.take(spill.committed_len));
        let columns = header
            .headers()
            .map_err(|e| CqError::Spill(format!("{}: header decode failed: {e}", spill.path.display())))?
            .iter()
            .map(str::to_string)
            .collect();
        let base = offset.max(header.position().byte()).min(spill.committed_len);
        drop(header);

        let mut file = open(spill)?;
        file.seek(SeekFrom::Start(base))?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file.take(spill.committed_len - base));
        Ok(SpillChunks {
            reader,
            columns,
            chunk_rows: self.chunk_rows,
            base,
            done: false,
        })
    }
}

/// A committed reference whose file is gone cannot be replayed.
fn open(spill: &SpillRef) -> Result<File> {
    File::open(&spill.path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CqError::Spill(format!(
            "{} missing ({} committed rows)",
            spill.path.display(),
            spill.rows
        )),
        _ => CqError::Io(e),
    })
}

/// Finite lazy sequence of row chunks read from one spill file.
pub struct SpillChunks {
    reader: csv::Reader<Take<File>>,
    columns: Vec<String>,
    chunk_rows: usize,
    base: u64,
    done: bool,
}

impl SpillChunks {
    /// File offset just past the last row returned; resume point for
    /// [`SpillReader::chunks_from`].
    pub fn offset(&self) -> u64 {
        self.base + self.reader.position().byte()
    }
}

impl Iterator for SpillChunks {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = RowBatch::new(self.columns.clone());
        let mut record = csv::StringRecord::new();
        while batch.len() < self.chunk_rows {
            match self.reader.read_record(&mut record) {
                Ok(true) => batch.push_row(record.iter().map(str::to_string).collect()),
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(CqError::Spill(format!("row decode failed: {e}"))));
                }
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use cq_common::RowBatch;

    use super::SpillReader;
    use crate::layout::SpillRef;
    use crate::writer::SpillWriter;

    fn unique_path(prefix: &str, ext: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}.{ext}"))
    }

    #[test]
    fn replays_committed_prefix_in_fixed_chunks() {
        let path = unique_path("cq_spill_reader", "csv");
        let batch = RowBatch::from_rows(["id", "cast"], (0..7).map(|i| [i.to_string(), format!("[{{'name': 'a{i}'}}]")]));
        let appended = SpillWriter::append(&path, None, &batch).expect("append");

        // bytes written by an uncommitted attempt are invisible
        std::fs::write(&path, {
            let mut bytes = std::fs::read(&path).expect("read");
            bytes.extend_from_slice(b"99,torn");
            bytes
        })
        .expect("append garbage");

        let chunks = SpillReader::new(3)
            .chunks(&appended.spill)
            .expect("open")
            .collect::<cq_common::Result<Vec<_>>>()
            .expect("chunks");
        assert_eq!(chunks.iter().map(RowBatch::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(RowBatch::concat(&chunks), batch);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn resumes_from_a_returned_offset() {
        let path = unique_path("cq_spill_resume", "csv");
        let batch = RowBatch::from_rows(["userId", "movieId"], (0..5).map(|i| [i.to_string(), format!("{}", 10 + i)]));
        let spill = SpillWriter::append(&path, None, &batch).expect("append").spill;
        let reader = SpillReader::new(2);

        let mut first = reader.chunks(&spill).expect("open");
        let head = first.next().expect("chunk").expect("rows");
        assert_eq!(head.rows, batch.rows[..2].to_vec());
        let offset = first.offset();
        assert!(offset < spill.committed_len);

        let rest = reader
            .chunks_from(&spill, offset)
            .expect("resume")
            .collect::<cq_common::Result<Vec<_>>>()
            .expect("chunks");
        let rest = RowBatch::concat(&rest);
        assert_eq!(rest.columns, batch.columns);
        assert_eq!(rest.rows, batch.rows[2..].to_vec());

        let mut drained = reader.chunks_from(&spill, spill.committed_len).expect("open at end");
        assert!(drained.next().is_none());
        assert_eq!(drained.offset(), spill.committed_len);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_committed_file_is_an_error() {
        let spill = SpillRef {
            path: unique_path("cq_spill_missing", "csv"),
            committed_len: 128,
            rows: 4,
        };
        let err = SpillReader::new(10).chunks(&spill).err().expect("missing file");
        assert!(matches!(err, cq_common::CqError::Spill(_)));
        assert!(!err.is_transient());
    }
}
