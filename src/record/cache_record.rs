//! Cache Records
//!
//! A record groups an optional primary value, attachments keyed by
//! [`ValueId`], and opaque structured metadata under one [`CacheKey`].

use super::policy::CachePolicy;
use super::value::Value;
use crate::error::{Error, Result};
use crate::key::{CacheKey, ValueId};

/// Record stored under a cache key
#[derive(Clone, Debug, PartialEq)]
pub struct CacheRecord {
    key: CacheKey,
    value: Option<Value>,
    attachments: Vec<(ValueId, Value)>,
    meta: Option<serde_json::Value>,
}

impl CacheRecord {
    /// Start building a record
    pub fn builder(key: CacheKey) -> CacheRecordBuilder {
        CacheRecordBuilder::new(key)
    }

    /// Record key
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Primary value
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Attachments in ascending id order
    pub fn attachments(&self) -> &[(ValueId, Value)] {
        &self.attachments
    }

    /// Attachment by id
    pub fn attachment(&self, id: &ValueId) -> Option<&Value> {
        self.attachments
            .binary_search_by(|(candidate, _)| candidate.cmp(id))
            .ok()
            .map(|idx| &self.attachments[idx].1)
    }

    /// Metadata blob
    pub fn meta(&self) -> Option<&serde_json::Value> {
        self.meta.as_ref()
    }

    /// Every value in canonical order: the primary value (id `None`) first,
    /// then attachments by id
    pub fn values(&self) -> impl Iterator<Item = (Option<&ValueId>, &Value)> {
        self.value
            .iter()
            .map(|v| (None, v))
            .chain(self.attachments.iter().map(|(id, v)| (Some(id), v)))
    }

    /// Returns true if every value carries its data
    pub fn is_complete(&self) -> bool {
        self.values().all(|(_, v)| v.has_data())
    }

    /// Sum of raw sizes of every value
    pub fn total_raw_size(&self) -> u64 {
        self.values().map(|(_, v)| v.raw_size()).sum()
    }

    /// Sum of compressed sizes of every value that carries data
    pub fn total_compressed_size(&self) -> u64 {
        self.values().map(|(_, v)| v.compressed_size()).sum()
    }

    /// Copy of the record trimmed according to `SKIP_DATA` and `SKIP_META`
    pub fn filtered(&self, policy: CachePolicy) -> Self {
        let skip_data = policy.contains(CachePolicy::SKIP_DATA);
        let strip = |v: &Value| if skip_data { v.without_data() } else { v.clone() };
        Self {
            key: self.key.clone(),
            value: self.value.as_ref().map(strip),
            attachments: self
                .attachments
                .iter()
                .map(|(id, v)| (*id, strip(v)))
                .collect(),
            meta: if policy.contains(CachePolicy::SKIP_META) {
                None
            } else {
                self.meta.clone()
            },
        }
    }

    /// Replace the value at `id` (`None` for the primary value)
    pub(crate) fn set_value(&mut self, id: Option<&ValueId>, value: Value) {
        match id {
            None => self.value = Some(value),
            Some(id) => {
                if let Ok(idx) = self.attachments.binary_search_by(|(c, _)| c.cmp(id)) {
                    self.attachments[idx].1 = value;
                }
            }
        }
    }
}

/// Builder for [`CacheRecord`]
#[derive(Debug)]
pub struct CacheRecordBuilder {
    record: CacheRecord,
}

impl CacheRecordBuilder {
    /// Create an empty builder for a key
    pub fn new(key: CacheKey) -> Self {
        Self {
            record: CacheRecord {
                key,
                value: None,
                attachments: Vec::new(),
                meta: None,
            },
        }
    }

    /// Set the primary value
    pub fn value(mut self, value: Value) -> Self {
        self.record.value = Some(value);
        self
    }

    /// Set the metadata blob
    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.record.meta = Some(meta);
        self
    }

    /// Add an attachment; ids must be unique
    pub fn attachment(mut self, id: ValueId, value: Value) -> Result<Self> {
        match self
            .record
            .attachments
            .binary_search_by(|(candidate, _)| candidate.cmp(&id))
        {
            Ok(_) => Err(Error::DuplicateAttachment(id.to_string())),
            Err(idx) => {
                self.record.attachments.insert(idx, (id, value));
                Ok(self)
            }
        }
    }

    /// Finish the record
    pub fn build(self) -> CacheRecord {
        self.record
    }
}
