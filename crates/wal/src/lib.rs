//! Append-only write-ahead log of typed entries.
//!
//! Each entry is one frame: `magic "CQWL" | version u16 | reserved u16 | length u32 |
//! crc32c u32 | body`, little-endian, with a JSON body. The log is generic over the
//! entry type; the worker crate defines what an entry means.

pub mod frame;
pub mod log;

pub use frame::{decode_frame, encode_frame, FrameError, FRAME_HEADER_LEN, FRAME_VERSION};
pub use log::{Wal, WalRecovery};
