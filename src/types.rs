//! Value types shared across the registry engine.
//!
//! - [`ResourceId`]: primary key of a replicated resource on the primary
//! - [`ResourceType`]: name of a replicable resource type (one registry table each)
//! - [`SiteId`]: identity of a secondary site
//! - [`IdRange`]: half-open `[low, high)` slice of a resource type's ID space
//! - [`Checksum`]: hex content digest used for verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identifier of a resource on the primary (monotonically increasing).
pub type ResourceId = i64;

/// Longest resource type name accepted (it becomes part of a table name).
const MAX_RESOURCE_TYPE_LEN: usize = 48;

/// Longest checksum accepted, in hex characters (512-bit digests).
const MAX_CHECKSUM_HEX_LEN: usize = 128;

// ═══════════════════════════════════════════════════════════════════════════════
// ResourceType
// ═══════════════════════════════════════════════════════════════════════════════

/// Name of a replicable resource type, e.g. `package_file` or `project_repository`.
///
/// Restricted to `[a-z0-9_]`, starting with a letter, because each type is
/// persisted in its own registry table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceType(String);

/// Error returned when parsing a value type fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid resource type name: {0:?}")]
    ResourceType(String),
    #[error("invalid checksum: {0}")]
    Checksum(String),
    #[error("invalid id range: {0}")]
    IdRange(String),
}

impl ResourceType {
    /// Validate and wrap a resource type name.
    pub fn new(name: impl Into<String>) -> Result<Self, ParseError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = name.len() <= MAX_RESOURCE_TYPE_LEN
            && chars.next().is_some_and(|c| c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(ParseError::ResourceType(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the registry table that tracks this resource type.
    pub fn table_name(&self) -> String {
        format!("{}_registry", self.0)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceType {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.0
    }
}

impl FromStr for ResourceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SiteId
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a secondary site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IdRange
// ═══════════════════════════════════════════════════════════════════════════════

/// Half-open range `[low, high)` over a resource type's ID space.
///
/// Ranges bound the memory and transaction size of a reconciliation pass.
/// An empty range (`low == high`) is valid and contains nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    low: ResourceId,
    high: ResourceId,
}

impl IdRange {
    /// Create a range. Fails if `low > high`.
    pub fn new(low: ResourceId, high: ResourceId) -> Result<Self, ParseError> {
        if low > high {
            return Err(ParseError::IdRange(format!("low {} > high {}", low, high)));
        }
        Ok(Self { low, high })
    }

    /// Range covering the inclusive bounds `[min, max]`.
    pub fn covering(min: ResourceId, max: ResourceId) -> Result<Self, ParseError> {
        let high = max
            .checked_add(1)
            .ok_or_else(|| ParseError::IdRange(format!("max {} overflows", max)))?;
        Self::new(min, high)
    }

    pub fn low(&self) -> ResourceId {
        self.low
    }

    pub fn high(&self) -> ResourceId {
        self.high
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        id >= self.low && id < self.high
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }

    /// Number of IDs in the range.
    pub fn width(&self) -> u64 {
        self.high.abs_diff(self.low)
    }

    /// Split into consecutive sub-ranges of at most `width` IDs.
    ///
    /// A `width` of zero is treated as one.
    pub fn batches(&self, width: u64) -> IdRangeBatches {
        IdRangeBatches {
            next: self.low,
            high: self.high,
            width: width.clamp(1, i64::MAX as u64) as i64,
        }
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

impl FromStr for IdRange {
    type Err = ParseError;

    /// Parse `"low..high"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (low, high) = s
            .split_once("..")
            .ok_or_else(|| ParseError::IdRange(format!("expected low..high, got {:?}", s)))?;
        let low = low
            .trim()
            .parse::<ResourceId>()
            .map_err(|e| ParseError::IdRange(format!("low: {}", e)))?;
        let high = high
            .trim()
            .parse::<ResourceId>()
            .map_err(|e| ParseError::IdRange(format!("high: {}", e)))?;
        Self::new(low, high)
    }
}

/// Iterator returned by [`IdRange::batches`].
#[derive(Debug, Clone)]
pub struct IdRangeBatches {
    next: ResourceId,
    high: ResourceId,
    width: i64,
}

impl Iterator for IdRangeBatches {
    type Item = IdRange;

    fn next(&mut self) -> Option<IdRange> {
        if self.next >= self.high {
            return None;
        }
        let low = self.next;
        let high = low.saturating_add(self.width).min(self.high);
        self.next = high;
        Some(IdRange { low, high })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checksum
// ═══════════════════════════════════════════════════════════════════════════════

/// Content digest of a replicated resource, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Parse a hex digest. Accepts upper or lower case, normalizes to lower.
    pub fn from_hex(hex: &str) -> Result<Self, ParseError> {
        if hex.is_empty() {
            return Err(ParseError::Checksum("empty".to_string()));
        }
        if hex.len() > MAX_CHECKSUM_HEX_LEN {
            return Err(ParseError::Checksum(format!(
                "{} hex chars exceeds {}",
                hex.len(),
                MAX_CHECKSUM_HEX_LEN
            )));
        }
        if hex.len() % 2 != 0 {
            return Err(ParseError::Checksum("odd number of hex chars".to_string()));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::Checksum("non-hex character".to_string()));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// SHA-256 of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self(hex_encode(&Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn fingerprint(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Checksum {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.0
    }
}

impl FromStr for Checksum {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
