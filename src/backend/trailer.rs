//! Integrity Trailer
//!
//! Every file written by a leaf store ends with a fixed-size trailer:
//!
//! ```text
//! ┌─────────────┬───────┬─────────┬──────┬──────────────────┬───────────┐
//! │   payload   │ magic │ version │ kind │ checksum (20 B)  │ size (u64)│
//! └─────────────┴───────┴─────────┴──────┴──────────────────┴───────────┘
//! ```
//!
//! Content and record files use an [`IoHash`] of the payload. Legacy files
//! use a CRC32 stored in the first four checksum bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::key::IoHash;

/// Trailer magic, "DDCT" little endian
const TRAILER_MAGIC: u32 = 0x5443_4444;
const TRAILER_VERSION: u8 = 1;

/// Size of the trailer in bytes
pub const TRAILER_LEN: usize = 4 + 1 + 1 + IoHash::LEN + 8;

/// Checksum algorithm recorded in a trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailerKind {
    /// CRC32 of the payload
    Crc32,
    /// Content hash of the payload
    Hash,
}

impl TrailerKind {
    fn id(self) -> u8 {
        match self {
            TrailerKind::Crc32 => 0,
            TrailerKind::Hash => 1,
        }
    }

    fn checksum(self, payload: &[u8]) -> [u8; IoHash::LEN] {
        match self {
            TrailerKind::Crc32 => {
                let mut out = [0u8; IoHash::LEN];
                out[..4].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
                out
            }
            TrailerKind::Hash => *IoHash::hash(payload).as_bytes(),
        }
    }
}

/// Append a trailer to `payload`
pub fn seal(payload: &[u8], kind: TrailerKind) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + TRAILER_LEN);
    buf.put_slice(payload);
    buf.put_u32_le(TRAILER_MAGIC);
    buf.put_u8(TRAILER_VERSION);
    buf.put_u8(kind.id());
    buf.put_slice(&kind.checksum(payload));
    buf.put_u64_le(payload.len() as u64);
    buf.freeze()
}

/// Verify the trailer of `data` and return the payload without it
pub fn open(data: Bytes, kind: TrailerKind) -> Result<Bytes> {
    if data.len() < TRAILER_LEN {
        return Err(Error::corruption("trailer", "file shorter than trailer"));
    }
    let split = data.len() - TRAILER_LEN;
    let trailer = &data[split..];

    let magic = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if magic != TRAILER_MAGIC {
        return Err(Error::corruption("trailer", "bad magic"));
    }
    if trailer[4] != TRAILER_VERSION {
        return Err(Error::corruption(
            "trailer",
            format!("unsupported version {}", trailer[4]),
        ));
    }
    if trailer[5] != kind.id() {
        return Err(Error::corruption("trailer", "unexpected checksum kind"));
    }

    let mut size = [0u8; 8];
    size.copy_from_slice(&trailer[6 + IoHash::LEN..]);
    let size = u64::from_le_bytes(size);
    if size != split as u64 {
        return Err(Error::corruption(
            "trailer",
            format!("payload size {} != recorded {}", split, size),
        ));
    }

    let payload = data.slice(..split);
    if kind.checksum(&payload)[..] != trailer[6..6 + IoHash::LEN] {
        return Err(Error::corruption("trailer", "checksum mismatch"));
    }
    Ok(payload)
}
