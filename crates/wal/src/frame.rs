//! Record framing (magic + version + length + crc32c).

use crc32c::crc32c;
use cq_common::{CqError, Result};
use thiserror::Error;

const FRAME_MAGIC: &[u8; 4] = b"CQWL";
pub const FRAME_VERSION: u16 = 1;
pub const FRAME_HEADER_LEN: usize = 16;
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Why a frame could not be read; any of these at the tail marks a torn write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("frame magic mismatch")]
    MagicMismatch,
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid frame length {0}")]
    LengthInvalid(usize),
    #[error("frame crc mismatch: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>> {
    if body.is_empty() || body.len() > MAX_FRAME_BYTES {
        return Err(CqError::Wal(format!(
            "record body of {} bytes cannot be framed",
            body.len()
        )));
    }
    let length = u32::try_from(body.len())
        .map_err(|_| CqError::Wal("frame length exceeds u32".to_string()))?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.extend_from_slice(&0_u16.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc32c(body).to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Decode the frame at the start of `buf`, returning its body and total frame size.
///
/// `Ok(None)` means `buf` is empty (clean end of log).
pub fn decode_frame(buf: &[u8]) -> std::result::Result<Option<(&[u8], usize)>, FrameError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: FRAME_HEADER_LEN,
            available: buf.len(),
        });
    }
    if &buf[0..4] != FRAME_MAGIC {
        return Err(FrameError::MagicMismatch);
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let length = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if length == 0 || length > MAX_FRAME_BYTES {
        return Err(FrameError::LengthInvalid(length));
    }
    let total = FRAME_HEADER_LEN + length;
    if buf.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: buf.len(),
        });
    }
    let expected = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let body = &buf[FRAME_HEADER_LEN..total];
    let got = crc32c(body);
    if got != expected {
        return Err(FrameError::CrcMismatch { expected, got });
    }
    Ok(Some((body, total)))
}
