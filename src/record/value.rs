//! Compressed Buffers and Values
//!
//! A [`CompressedBuffer`] is self-describing: its header names the compression
//! method and records the hash and size of the raw (uncompressed) bytes so
//! decompression can be verified.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::compression::{CompressionManager, CompressionMethod};
use crate::error::{Error, Result};
use crate::key::IoHash;

/// Header magic for encoded compressed buffers
const BUFFER_MAGIC: u32 = 0xB7756362;

/// Compressed payload with the identity of its raw content
#[derive(Clone, PartialEq, Eq)]
pub struct CompressedBuffer {
    method: CompressionMethod,
    raw_size: u64,
    raw_hash: IoHash,
    payload: Bytes,
}

impl CompressedBuffer {
    /// Encoded header size in bytes
    pub const HEADER_LEN: usize = 4 + 1 + 8 + IoHash::LEN + 8;

    /// Compress raw bytes with the shared compression manager
    pub fn compress(raw: &[u8]) -> Self {
        Self::compress_with(raw, CompressionManager::shared())
    }

    /// Compress raw bytes with a specific manager
    pub fn compress_with(raw: &[u8], manager: &CompressionManager) -> Self {
        let (payload, method) = manager.compress(raw);
        Self {
            method,
            raw_size: raw.len() as u64,
            raw_hash: IoHash::hash(raw),
            payload,
        }
    }

    /// Decompress, verifying raw size and hash
    pub fn decompress(&self) -> Result<Bytes> {
        let raw = CompressionManager::shared().decompress(&self.payload, self.method)?;
        if raw.len() as u64 != self.raw_size {
            return Err(Error::corruption(
                "compressed buffer",
                format!("raw size {} != expected {}", raw.len(), self.raw_size),
            ));
        }
        if IoHash::hash(&raw) != self.raw_hash {
            return Err(Error::corruption("compressed buffer", "raw hash mismatch"));
        }
        Ok(raw)
    }

    /// Compression method of the payload
    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Size of the raw content
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// Hash of the raw content
    pub fn raw_hash(&self) -> &IoHash {
        &self.raw_hash
    }

    /// Size of the compressed payload
    pub fn compressed_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Size of the encoded form
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serialize header and payload into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(BUFFER_MAGIC);
        buf.put_u8(self.method.id());
        buf.put_u64_le(self.raw_size);
        buf.put_slice(self.raw_hash.as_bytes());
        buf.put_u64_le(self.payload.len() as u64);
        buf.put_slice(&self.payload);
    }

    /// Parse an encoded buffer, consuming exactly its bytes from `data`
    pub fn decode_from(data: &mut Bytes) -> Result<Self> {
        if data.len() < Self::HEADER_LEN {
            return Err(Error::corruption("compressed buffer", "truncated header"));
        }
        if data.get_u32_le() != BUFFER_MAGIC {
            return Err(Error::corruption("compressed buffer", "bad magic"));
        }
        let method = CompressionMethod::from_id(data.get_u8())?;
        let raw_size = data.get_u64_le();
        let raw_hash = IoHash::from_slice(&data.split_to(IoHash::LEN))?;
        let len = data.get_u64_le();
        if (data.len() as u64) < len {
            return Err(Error::corruption("compressed buffer", "truncated payload"));
        }
        let payload = data.split_to(len as usize);
        Ok(Self {
            method,
            raw_size,
            raw_hash,
            payload,
        })
    }

    /// Parse an encoded buffer that must span all of `data`
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let buffer = Self::decode_from(&mut data)?;
        if !data.is_empty() {
            return Err(Error::corruption("compressed buffer", "trailing bytes"));
        }
        Ok(buffer)
    }
}

impl std::fmt::Debug for CompressedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedBuffer")
            .field("method", &self.method)
            .field("raw_size", &self.raw_size)
            .field("raw_hash", &self.raw_hash)
            .field("compressed_size", &self.payload.len())
            .finish()
    }
}

/// A cached value: raw identity plus optional compressed data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    raw_hash: IoHash,
    raw_size: u64,
    data: Option<CompressedBuffer>,
}

impl Value {
    /// Build a value from raw bytes
    pub fn from_raw(raw: &[u8]) -> Self {
        Self::from_buffer(CompressedBuffer::compress(raw))
    }

    /// Build a value from an existing compressed buffer
    pub fn from_buffer(buffer: CompressedBuffer) -> Self {
        Self {
            raw_hash: *buffer.raw_hash(),
            raw_size: buffer.raw_size(),
            data: Some(buffer),
        }
    }

    /// A value carrying only its identity, no data
    pub fn reference(raw_hash: IoHash, raw_size: u64) -> Self {
        Self {
            raw_hash,
            raw_size,
            data: None,
        }
    }

    /// Hash of the raw content
    pub fn raw_hash(&self) -> &IoHash {
        &self.raw_hash
    }

    /// Size of the raw content
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// Compressed data, if present
    pub fn data(&self) -> Option<&CompressedBuffer> {
        self.data.as_ref()
    }

    /// Returns true if the compressed data is present
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Copy of this value with the data dropped
    pub fn without_data(&self) -> Self {
        Self::reference(self.raw_hash, self.raw_size)
    }

    /// Attach data, checking it matches this value's identity
    pub fn with_data(&self, buffer: CompressedBuffer) -> Result<Self> {
        if *buffer.raw_hash() != self.raw_hash || buffer.raw_size() != self.raw_size {
            return Err(Error::corruption(
                format!("value {}", self.raw_hash),
                "attached data does not match the value hash",
            ));
        }
        Ok(Self::from_buffer(buffer))
    }

    /// Decompressed raw bytes, if data is present
    pub fn decompress(&self) -> Option<Result<Bytes>> {
        self.data.as_ref().map(|d| d.decompress())
    }

    /// Compressed size, zero when data is absent
    pub fn compressed_size(&self) -> u64 {
        self.data.as_ref().map(|d| d.compressed_size()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"vertex buffer ".repeat(64)
    }

    #[test]
    fn test_value_from_raw() {
        let raw = sample();
        let value = Value::from_raw(&raw);
        assert_eq!(value.raw_size(), raw.len() as u64);
        assert_eq!(*value.raw_hash(), IoHash::hash(&raw));
        assert!(value.compressed_size() < raw.len() as u64);
        assert_eq!(value.decompress().unwrap().unwrap().as_ref(), raw.as_slice());
    }

    #[test]
    fn test_without_data_keeps_identity() {
        let value = Value::from_raw(b"abc");
        let reference = value.without_data();
        assert!(!reference.has_data());
        assert_eq!(reference.raw_hash(), value.raw_hash());
        assert!(reference.decompress().is_none());
    }

    #[test]
    fn test_with_data_rejects_mismatch() {
        let reference = Value::from_raw(b"abc").without_data();
        assert!(reference.with_data(CompressedBuffer::compress(b"abc")).is_ok());
        assert!(reference.with_data(CompressedBuffer::compress(b"xyz")).is_err());
    }

    #[test]
    fn test_buffer_decode_rejects_flipped_payload() {
        let buffer = CompressedBuffer::compress(&sample());
        let mut encoded = buffer.encode().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x55;
        let decoded = CompressedBuffer::decode(Bytes::from(encoded));
        // Either the LZ4 stream or the raw hash check must reject it
        match decoded {
            Ok(buffer) => assert!(buffer.decompress().is_err()),
            Err(e) => assert!(e.is_corruption()),
        }
    }

    #[test]
    fn test_buffer_decode_truncated() {
        let encoded = CompressedBuffer::compress(b"hello").encode();
        let truncated = encoded.slice(..encoded.len() - 2);
        assert!(CompressedBuffer::decode(truncated).is_err());
        assert!(CompressedBuffer::decode(Bytes::from_static(b"abc")).is_err());
    }
}
