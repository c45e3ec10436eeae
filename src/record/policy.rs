//! Cache Request Policy
//!
//! Bit set attached to every request deciding which tiers are consulted or
//! written and which parts of a record are loaded.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

/// Per-request cache policy bit set
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CachePolicy(u32);

impl CachePolicy {
    /// No bits set: neither query nor store
    pub const NONE: CachePolicy = CachePolicy(0);
    /// Query local tiers
    pub const QUERY_LOCAL: CachePolicy = CachePolicy(1 << 0);
    /// Query remote tiers
    pub const QUERY_REMOTE: CachePolicy = CachePolicy(1 << 1);
    /// Query every tier
    pub const QUERY: CachePolicy = CachePolicy(Self::QUERY_LOCAL.0 | Self::QUERY_REMOTE.0);
    /// Store to local tiers
    pub const STORE_LOCAL: CachePolicy = CachePolicy(1 << 2);
    /// Store to remote tiers
    pub const STORE_REMOTE: CachePolicy = CachePolicy(1 << 3);
    /// Store to every tier
    pub const STORE: CachePolicy = CachePolicy(Self::STORE_LOCAL.0 | Self::STORE_REMOTE.0);
    /// Skip record metadata on get
    pub const SKIP_META: CachePolicy = CachePolicy(1 << 4);
    /// Skip value data on get; hashes and sizes are still returned
    pub const SKIP_DATA: CachePolicy = CachePolicy(1 << 5);
    /// Accept a record with some value data missing
    pub const PARTIAL_RECORD: CachePolicy = CachePolicy(1 << 6);
    /// Query and store everywhere
    pub const DEFAULT: CachePolicy = CachePolicy(Self::QUERY.0 | Self::STORE.0);

    const ALL: u32 = (1 << 7) - 1;

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: CachePolicy) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: CachePolicy) -> bool {
        self.0 & other.0 != 0
    }

    /// True if a tier of the given locality may be queried
    pub fn allows_query(self, remote: bool) -> bool {
        if remote {
            self.contains(Self::QUERY_REMOTE)
        } else {
            self.contains(Self::QUERY_LOCAL)
        }
    }

    /// True if a tier of the given locality may be written
    pub fn allows_store(self, remote: bool) -> bool {
        if remote {
            self.contains(Self::STORE_REMOTE)
        } else {
            self.contains(Self::STORE_LOCAL)
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for CachePolicy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CachePolicy {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CachePolicy {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Sub for CachePolicy {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl Not for CachePolicy {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL)
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CachePolicy, &str); 7] = [
            (CachePolicy::QUERY_LOCAL, "QueryLocal"),
            (CachePolicy::QUERY_REMOTE, "QueryRemote"),
            (CachePolicy::STORE_LOCAL, "StoreLocal"),
            (CachePolicy::STORE_REMOTE, "StoreRemote"),
            (CachePolicy::SKIP_META, "SkipMeta"),
            (CachePolicy::SKIP_DATA, "SkipData"),
            (CachePolicy::PARTIAL_RECORD, "PartialRecord"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "CachePolicy(None)")
        } else {
            write!(f, "CachePolicy({})", names.join("|"))
        }
    }
}
