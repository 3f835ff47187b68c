use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cq_common::{Result, RowBatch};

use crate::layout::SpillRef;
use crate::reader::{SpillChunks, SpillReader};
use crate::writer::{SpillAppend, SpillWriter};

/// In-memory buffer plus optional spill file for one side stream of one client.
///
/// State transitions (`append`, `apply_spilled`, `take_buffer`, `release_spill`) are
/// pure so they can be replayed from the WAL; file I/O happens only in
/// [`BatchStore::write_spill`], whose result the caller commits before applying.
#[derive(Debug, Default)]
pub struct BatchStore {
    buffer: Mutex<RowBatch>,
    lines: usize,
    spill: Option<SpillRef>,
    complete: bool,
    generation: u64,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self) -> MutexGuard<'_, RowBatch> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&mut self, rows: &RowBatch) {
        self.buffer().extend_from(rows);
        self.lines += rows.len();
    }

    pub fn line_count(&self) -> usize {
        self.lines
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn spill_ref(&self) -> Option<&SpillRef> {
        self.spill.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Bumped on every release so a fresh spill never reuses a file pending deletion.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn buffered(&self) -> RowBatch {
        self.buffer().clone()
    }

    /// Spill only while the join cannot run yet and the buffer reached `threshold`.
    pub fn should_spill(&self, threshold: usize, can_join: bool) -> bool {
        !can_join && self.lines > 0 && self.lines >= threshold.max(1)
    }

    /// Append the buffered rows to the spill file (the existing one, or `fresh_path`).
    pub fn write_spill(&self, fresh_path: &Path) -> Result<SpillAppend> {
        let buffer = self.buffer();
        match &self.spill {
            Some(existing) => SpillWriter::append(&existing.path, Some(existing), &buffer),
            None => SpillWriter::append(fresh_path, None, &buffer),
        }
    }

    /// Record a committed spill: the buffer now lives on disk.
    pub fn apply_spilled(&mut self, spill: SpillRef) {
        let mut buffer = self.buffer();
        buffer.rows.clear();
        drop(buffer);
        self.lines = 0;
        self.spill = Some(spill);
    }

    /// Drain the in-memory buffer, keeping its header for later appends.
    pub fn take_buffer(&mut self) -> RowBatch {
        let mut buffer = self.buffer();
        let taken = RowBatch {
            columns: buffer.columns.clone(),
            rows: std::mem::take(&mut buffer.rows),
        };
        drop(buffer);
        self.lines = 0;
        taken
    }

    /// Lazy chunked replay of the spill file; empty when nothing was spilled.
    pub fn replay(&self, chunk_rows: usize) -> Result<Option<SpillChunks>> {
        self.replay_from(chunk_rows, 0)
    }

    /// Replay resuming at a byte offset taken from [`SpillChunks::offset`].
    pub fn replay_from(&self, chunk_rows: usize, offset: u64) -> Result<Option<SpillChunks>> {
        match &self.spill {
            Some(spill) => SpillReader::new(chunk_rows).chunks_from(spill, offset).map(Some),
            None => Ok(None),
        }
    }

    /// Forget the spill file and return its path for deletion after commit.
    pub fn release_spill(&mut self) -> Option<PathBuf> {
        let released = self.spill.take().map(|s| s.path);
        if released.is_some() {
            self.generation += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use cq_common::RowBatch;

    use super::BatchStore;

    fn unique_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}"))
    }

    fn sorted(batch: &RowBatch) -> Vec<Vec<String>> {
        let mut rows = batch.rows.clone();
        rows.sort();
        rows
    }

    #[test]
    fn append_spill_replay_reproduces_every_row_for_any_threshold_and_split() {
        let dir = unique_dir("cq_store_roundtrip");
        let all = RowBatch::from_rows(
            ["id", "rating"],
            (0..23).map(|i| [format!("{}", i % 5), format!("{}.5", i % 4)]),
        );

        for threshold in [1_usize, 2, 5, 7, 23, 50] {
            for split in [1_usize, 3, 4, 10] {
                let mut store = BatchStore::new();
                let path = dir.join(format!("ratings-t{threshold}-s{split}.csv"));
                for part in all.chunks(split) {
                    store.append(&part);
                    if store.should_spill(threshold, false) {
                        let appended = store.write_spill(&path).expect("spill");
                        store.apply_spilled(appended.spill);
                    }
                }

                let mut recovered = store.take_buffer();
                if let Some(chunks) = store.replay(threshold).expect("replay") {
                    for chunk in chunks {
                        let chunk = chunk.expect("chunk");
                        assert!(chunk.len() <= threshold);
                        recovered.extend_from(&chunk);
                    }
                }
                assert_eq!(sorted(&recovered), sorted(&all), "t={threshold} s={split}");

                if let Some(released) = store.release_spill() {
                    std::fs::remove_file(released).expect("delete spill");
                }
                assert!(!store.is_spilled());
            }
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn join_ready_buffers_never_spill() {
        let mut store = BatchStore::new();
        store.append(&RowBatch::from_rows(["id"], [["1"], ["2"]]));
        assert!(!store.should_spill(2, true));
        assert!(store.should_spill(2, false));
        assert!(!store.should_spill(3, false));
    }

    #[test]
    fn release_bumps_generation_only_when_spilled() {
        let mut store = BatchStore::new();
        assert!(store.release_spill().is_none());
        assert_eq!(store.generation(), 0);
        store.apply_spilled(crate::layout::SpillRef {
            path: PathBuf::from("/tmp/x.csv"),
            committed_len: 10,
            rows: 1,
        });
        assert_eq!(store.release_spill(), Some(PathBuf::from("/tmp/x.csv")));
        assert_eq!(store.generation(), 1);
    }
}
