//! Record and Value Packages
//!
//! Binary encoding of records and standalone values as stored by the leaf
//! backends. Value data is either inlined in the package or stored externally
//! as a content-addressed blob and referenced by its raw hash.
//!
//! ```text
//! record  := "DDCR" version key flags [meta] [entry] count (id entry)*
//! value   := "DDCV" version entry
//! entry   := raw_hash raw_size storage [len buffer]
//! ```

use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::cache_record::{CacheRecord, CacheRecordBuilder};
use super::value::{CompressedBuffer, Value};
use crate::error::{Error, Result};
use crate::key::{CacheBucket, CacheKey, IoHash, ValueId};

const RECORD_MAGIC: &[u8; 4] = b"DDCR";
const VALUE_MAGIC: &[u8; 4] = b"DDCV";
const PACKAGE_VERSION: u8 = 1;

const FLAG_VALUE: u8 = 1 << 0;
const FLAG_META: u8 = 1 << 1;

/// Where a value's data lives relative to its package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Stored inside the package
    Inline,
    /// Stored as a separate content blob
    External,
}

impl Placement {
    fn storage_tag(self, has_data: bool) -> u8 {
        match (has_data, self) {
            (false, _) => 0,
            (true, Placement::Inline) => 1,
            (true, Placement::External) => 2,
        }
    }
}

/// Size limits governing which values are inlined into a record package
#[derive(Debug, Clone, Copy)]
pub struct PackageLimits {
    /// Values whose compressed size exceeds this are always external
    pub max_inline_value_size: u64,
    /// Inlining stops once the package would exceed this size
    pub max_record_size: u64,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_inline_value_size: 64 * 1024,
            max_record_size: 256 * 1024,
        }
    }
}

/// Decide the placement of every value of a record
///
/// Values are visited in canonical order (primary value, then attachments by
/// id). The result depends only on the record and the limits.
pub fn plan_placement(record: &CacheRecord, limits: &PackageLimits) -> Vec<Placement> {
    let mut running = record_overhead(record) as u64;
    record
        .values()
        .map(|(_, value)| match value.data() {
            None => Placement::Inline,
            Some(buffer) => {
                let size = buffer.encoded_len() as u64 + 8;
                if buffer.compressed_size() > limits.max_inline_value_size
                    || running + size > limits.max_record_size
                {
                    Placement::External
                } else {
                    running += size;
                    Placement::Inline
                }
            }
        })
        .collect()
}

fn record_overhead(record: &CacheRecord) -> usize {
    let meta = record
        .meta()
        .map(|m| serde_json::to_vec(m).map(|v| v.len()).unwrap_or(0))
        .unwrap_or(0);
    let per_entry = IoHash::LEN + 8 + 1 + 8;
    4 + 1
        + 1
        + record.key().bucket().as_str().len()
        + IoHash::LEN
        + 1
        + 4
        + meta
        + per_entry
        + 4
        + record.attachments().len() * (ValueId::LEN + per_entry)
}

/// Encode a record; `placements` is parallel to [`CacheRecord::values`]
pub fn encode_record(record: &CacheRecord, placements: &[Placement]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(record_overhead(record));
    buf.put_slice(RECORD_MAGIC);
    buf.put_u8(PACKAGE_VERSION);
    encode_key(&mut buf, record.key());

    let mut flags = 0;
    if record.value().is_some() {
        flags |= FLAG_VALUE;
    }
    if record.meta().is_some() {
        flags |= FLAG_META;
    }
    buf.put_u8(flags);

    if let Some(meta) = record.meta() {
        let json = serde_json::to_vec(meta)
            .map_err(|e| Error::Internal(format!("failed to encode record meta: {}", e)))?;
        buf.put_u32_le(json.len() as u32);
        buf.put_slice(&json);
    }

    let mut placements = placements.iter().copied();
    let mut next = || placements.next().unwrap_or(Placement::Inline);

    if let Some(value) = record.value() {
        encode_entry(&mut buf, value, next());
    }
    buf.put_u32_le(record.attachments().len() as u32);
    for (id, value) in record.attachments() {
        buf.put_slice(id.as_bytes());
        encode_entry(&mut buf, value, next());
    }
    Ok(buf.freeze())
}

/// A decoded record plus the values whose data must be loaded externally
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// Record; externally stored values carry no data yet
    pub record: CacheRecord,
    /// Ids (`None` = primary value) of values stored as content blobs
    pub external: Vec<Option<ValueId>>,
}

/// Decode a record package
pub fn decode_record(mut data: Bytes) -> Result<DecodedRecord> {
    expect_header(&mut data, RECORD_MAGIC, "record package")?;
    let key = decode_key(&mut data)?;
    need(&data, 1, "record flags")?;
    let flags = data.get_u8();

    let mut builder = CacheRecordBuilder::new(key);
    let mut external = Vec::new();

    if flags & FLAG_META != 0 {
        need(&data, 4, "meta length")?;
        let len = data.get_u32_le() as usize;
        need(&data, len, "meta")?;
        let json = data.split_to(len);
        let meta: serde_json::Value = serde_json::from_slice(&json)
            .map_err(|e| Error::corruption("record package", format!("invalid meta: {}", e)))?;
        builder = builder.meta(meta);
    }

    if flags & FLAG_VALUE != 0 {
        let (value, is_external) = decode_entry(&mut data)?;
        if is_external {
            external.push(None);
        }
        builder = builder.value(value);
    }

    need(&data, 4, "attachment count")?;
    let count = data.get_u32_le();
    let mut seen = HashSet::new();
    for _ in 0..count {
        need(&data, ValueId::LEN, "attachment id")?;
        let mut id = [0u8; ValueId::LEN];
        data.copy_to_slice(&mut id);
        let id = ValueId::from_bytes(id);
        if !seen.insert(id) {
            return Err(Error::corruption("record package", "duplicate attachment id"));
        }
        let (value, is_external) = decode_entry(&mut data)?;
        if is_external {
            external.push(Some(id));
        }
        builder = builder
            .attachment(id, value)
            .map_err(|e| Error::corruption("record package", e.to_string()))?;
    }

    if !data.is_empty() {
        return Err(Error::corruption("record package", "trailing bytes"));
    }

    Ok(DecodedRecord {
        record: builder.build(),
        external,
    })
}

/// Encode a standalone value package
pub fn encode_value(value: &Value, placement: Placement) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(VALUE_MAGIC);
    buf.put_u8(PACKAGE_VERSION);
    encode_entry(&mut buf, value, placement);
    buf.freeze()
}

/// Decode a value package; the flag is true if the data is stored externally
pub fn decode_value(mut data: Bytes) -> Result<(Value, bool)> {
    expect_header(&mut data, VALUE_MAGIC, "value package")?;
    let decoded = decode_entry(&mut data)?;
    if !data.is_empty() {
        return Err(Error::corruption("value package", "trailing bytes"));
    }
    Ok(decoded)
}

/// Returns true if `data` starts like a record package
pub fn is_record_package(data: &[u8]) -> bool {
    data.starts_with(RECORD_MAGIC)
}

/// Returns true if `data` starts like a value package
pub fn is_value_package(data: &[u8]) -> bool {
    data.starts_with(VALUE_MAGIC)
}

fn encode_key(buf: &mut BytesMut, key: &CacheKey) {
    let bucket = key.bucket().as_str().as_bytes();
    buf.put_u8(bucket.len() as u8);
    buf.put_slice(bucket);
    buf.put_slice(key.hash().as_bytes());
}

fn decode_key(data: &mut Bytes) -> Result<CacheKey> {
    need(data, 1, "bucket length")?;
    let len = data.get_u8() as usize;
    need(data, len + IoHash::LEN, "key")?;
    let bucket = data.split_to(len);
    let bucket = std::str::from_utf8(&bucket)
        .map_err(|_| Error::corruption("record package", "bucket is not utf-8"))
        .and_then(|b| {
            CacheBucket::new(b).map_err(|e| Error::corruption("record package", e.to_string()))
        })?;
    let hash = IoHash::from_slice(&data.split_to(IoHash::LEN))?;
    Ok(CacheKey::new(bucket, hash))
}

fn encode_entry(buf: &mut BytesMut, value: &Value, placement: Placement) {
    buf.put_slice(value.raw_hash().as_bytes());
    buf.put_u64_le(value.raw_size());
    let tag = placement.storage_tag(value.has_data());
    buf.put_u8(tag);
    if tag == 1 {
        if let Some(data) = value.data() {
            buf.put_u64_le(data.encoded_len() as u64);
            data.encode_into(buf);
        }
    }
}

fn decode_entry(data: &mut Bytes) -> Result<(Value, bool)> {
    need(data, IoHash::LEN + 8 + 1, "value entry")?;
    let raw_hash = IoHash::from_slice(&data.split_to(IoHash::LEN))?;
    let raw_size = data.get_u64_le();
    let reference = Value::reference(raw_hash, raw_size);
    match data.get_u8() {
        0 => Ok((reference, false)),
        1 => {
            need(data, 8, "inline length")?;
            let len = data.get_u64_le() as usize;
            need(data, len, "inline value")?;
            let buffer = CompressedBuffer::decode(data.split_to(len))?;
            Ok((reference.with_data(buffer)?, false))
        }
        2 => Ok((reference, true)),
        other => Err(Error::corruption(
            "package",
            format!("unknown value storage tag {}", other),
        )),
    }
}

fn expect_header(data: &mut Bytes, magic: &[u8; 4], what: &str) -> Result<()> {
    need(data, 5, what)?;
    if &data[..4] != magic {
        return Err(Error::corruption(what, "bad magic"));
    }
    data.advance(4);
    let version = data.get_u8();
    if version != PACKAGE_VERSION {
        return Err(Error::corruption(what, format!("unsupported version {}", version)));
    }
    Ok(())
}

fn need(data: &Bytes, len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(Error::corruption("package", format!("truncated {}", what)));
    }
    Ok(())
}
