use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cq_common::{CqError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::frame::{decode_frame, encode_frame};

/// Outcome of opening a log: the replayed entries and any tail that was cut off.
#[derive(Debug)]
pub struct WalRecovery<E> {
    pub entries: Vec<E>,
    pub truncated_bytes: u64,
}

/// File-backed append-only log of `E` entries.
#[derive(Debug)]
pub struct Wal<E> {
    path: PathBuf,
    file: File,
    len: u64,
    _entry: PhantomData<fn() -> E>,
}

impl<E> Wal<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Open (creating if needed) and replay the log in file order.
    ///
    /// A torn or corrupt frame ends the readable log: the file is truncated at the
    /// last good frame boundary so later appends start clean.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, WalRecovery<E>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offset = 0_usize;
        loop {
            match decode_frame(&bytes[offset..]) {
                Ok(None) => break,
                Ok(Some((body, used))) => {
                    let entry = serde_json::from_slice::<E>(body).map_err(|e| {
                        CqError::Wal(format!(
                            "{}: undecodable record at offset {offset}: {e}",
                            path.display()
                        ))
                    })?;
                    entries.push(entry);
                    offset += used;
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        dropped_bytes = bytes.len() - offset,
                        error = %err,
                        "truncating torn wal tail"
                    );
                    break;
                }
            }
        }

        let truncated_bytes = (bytes.len() - offset) as u64;
        if truncated_bytes > 0 {
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), entries = entries.len(), "wal opened");

        Ok((
            Self {
                path,
                file,
                len: offset as u64,
                _entry: PhantomData,
            },
            WalRecovery {
                entries,
                truncated_bytes,
            },
        ))
    }

    /// Append one entry and fsync. Returns the frame size in bytes.
    pub fn append(&mut self, entry: &E) -> Result<u64> {
        let body = serde_json::to_vec(entry)
            .map_err(|e| CqError::Wal(format!("record encode failed: {e}")))?;
        let frame = encode_frame(&body)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        Ok(frame.len() as u64)
    }

    /// Atomically replace the log with `entries` (temp file + rename).
    pub fn rewrite(&mut self, entries: &[E]) -> Result<u64> {
        let staged_path = temp_sibling_path(&self.path, "compact");
        let written = match write_staged(&staged_path, entries) {
            Ok(n) => n,
            Err(err) => {
                let _ = fs::remove_file(&staged_path);
                return Err(err);
            }
        };
        if let Err(e) = fs::rename(&staged_path, &self.path) {
            let _ = fs::remove_file(&staged_path);
            return Err(CqError::Wal(format!(
                "wal commit failed: {} -> {} ({e})",
                staged_path.display(),
                self.path.display()
            )));
        }
        sync_parent_dir(&self.path);
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.len = written;
        Ok(written)
    }

    /// Drop every entry.
    pub fn wipe(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        Ok(())
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_staged<E: Serialize>(path: &Path, entries: &[E]) -> Result<u64> {
    let mut file = File::create(path)?;
    let mut written = 0_u64;
    for entry in entries {
        let body = serde_json::to_vec(entry)
            .map_err(|e| CqError::Wal(format!("record encode failed: {e}")))?;
        let frame = encode_frame(&body)?;
        file.write_all(&frame)?;
        written += frame.len() as u64;
    }
    file.sync_all()?;
    Ok(written)
}

fn temp_sibling_path(path: &Path, label: &str) -> PathBuf {
    let parent = path
        .parent()
        .map(std::borrow::ToOwned::to_owned)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("wal");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    parent.join(format!(".cq_{label}_{stem}_{nanos}.tmp"))
}

fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Err(e) = File::open(parent).and_then(|d| d.sync_all()) {
        if e.kind() != io::ErrorKind::PermissionDenied {
            warn!(dir = %parent.display(), error = %e, "directory sync failed");
        }
    }
}
