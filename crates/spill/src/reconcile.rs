use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use cq_common::Result;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub truncated: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Bring the spill directory in line with recovered state.
///
/// `live` lists every spill file the recovered state references together with its
/// committed length. Referenced files are cut back to that length; everything else
/// under `spill_root` is an orphan of an uncommitted attempt or a missed post-commit
/// delete and is removed, as are emptied client directories.
pub fn reconcile_spill_dir(spill_root: &Path, live: &[(PathBuf, u64)]) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    if !spill_root.exists() {
        return Ok(report);
    }
    let live = live.iter().cloned().collect::<HashMap<_, _>>();

    for client in fs::read_dir(spill_root)? {
        let client = client?;
        let client_path = client.path();
        if !client.file_type()?.is_dir() {
            fs::remove_file(&client_path)?;
            report.removed.push(client_path);
            continue;
        }
        for entry in fs::read_dir(&client_path)? {
            let path = entry?.path();
            match live.get(&path) {
                Some(&committed) => {
                    let len = fs::metadata(&path)?.len();
                    if len > committed {
                        OpenOptions::new().write(true).open(&path)?.set_len(committed)?;
                        report.truncated.push(path);
                    } else if len < committed {
                        warn!(
                            path = %path.display(),
                            len,
                            committed,
                            "spill file shorter than committed length"
                        );
                    }
                }
                None => {
                    fs::remove_file(&path)?;
                    report.removed.push(path);
                }
            }
        }
        if fs::read_dir(&client_path)?.next().is_none() {
            fs::remove_dir(&client_path)?;
        }
    }

    if !report.truncated.is_empty() || !report.removed.is_empty() {
        info!(
            root = %spill_root.display(),
            truncated = report.truncated.len(),
            removed = report.removed.len(),
            "spill directory reconciled"
        );
    }
    Ok(report)
}

/// Delete every spill file of this node (global shutdown).
pub fn wipe_spill_dir(spill_root: &Path) -> Result<()> {
    match fs::remove_dir_all(spill_root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
