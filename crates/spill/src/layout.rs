use std::path::{Path, PathBuf};

use cq_common::{ClientId, QueryId, SideStream};
use serde::{Deserialize, Serialize};

pub const SPILL_DIR: &str = "spill";

pub fn spill_root(state_dir: &Path) -> PathBuf {
    state_dir.join(SPILL_DIR)
}

pub fn client_dir(spill_root: &Path, client: &ClientId) -> PathBuf {
    spill_root.join(path_component(client.as_str()))
}

pub fn spill_file_name(stream: SideStream, query: QueryId, generation: u64) -> String {
    format!("{stream}-q{query}-{generation}.csv")
}

/// `<spill_root>/<client>/<stream>-q<query>-<generation>.csv`
pub fn spill_path(
    spill_root: &Path,
    client: &ClientId,
    stream: SideStream,
    query: QueryId,
    generation: u64,
) -> PathBuf {
    client_dir(spill_root, client).join(spill_file_name(stream, query, generation))
}

/// Client ids are opaque; anything outside `[A-Za-z0-9_-]` becomes `_`.
fn path_component(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Durable reference to a spill file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillRef {
    pub path: PathBuf,
    /// File length covered by a committed WAL record.
    pub committed_len: u64,
    pub rows: u64,
}
