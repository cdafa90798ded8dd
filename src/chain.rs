//! Shared chain-position and filter-type vocabulary used by every pipeline.
use std::fmt;

use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, FilterHash, FilterHeader};

/// Supported compact-filter types.
///
/// BIP158 defines a single deployed type (`basic`, type byte `0x00`). Keeping
/// this closed keeps every dispatch site an exhaustive `match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterType {
    /// BIP158 basic filter (output scripts + spent prevout scripts).
    Basic,
}

impl FilterType {
    /// Wire/storage byte for this filter type.
    pub fn to_u8(self) -> u8 {
        match self {
            FilterType::Basic => 0,
        }
    }

    /// Parse a filter-type byte; unknown values are rejected.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FilterType::Basic),
            _ => None,
        }
    }

    /// The fixed pre-genesis filter header this type's chain is anchored to.
    pub fn genesis_header(self) -> FilterHeader {
        FilterHeader::from_byte_array([0u8; 32])
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::Basic => write!(f, "basic"),
        }
    }
}

/// Network whose filter chain is being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    /// Bitcoin mainnet.
    Bitcoin,
    /// Testnet3.
    Testnet,
    /// Signet.
    Signet,
    /// Local regtest.
    Regtest,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Chain::Bitcoin => "bitcoin",
            Chain::Testnet => "testnet",
            Chain::Signet => "signet",
            Chain::Regtest => "regtest",
        };
        write!(f, "{name}")
    }
}

/// A `(height, block_hash)` point on some chain branch.
///
/// Ordering is by height first, so positions on different branches still
/// compare; equality requires both fields to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPosition {
    /// Block height.
    pub height: u32,
    /// Block hash at that height.
    pub hash: BlockHash,
}

impl BlockPosition {
    /// Build a position from its parts.
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Height-0 position with an all-zero hash, used when nothing is known.
    pub fn unknown_genesis() -> Self {
        Self {
            height: 0,
            hash: BlockHash::from_byte_array([0u8; 32]),
        }
    }
}

impl fmt::Display for BlockPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// The pair committed for one block by the header chain: the filter hash and
/// the chained header derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCommitment {
    /// Double-SHA256 of the serialized filter.
    pub filter_hash: FilterHash,
    /// `sha256d(filter_hash || prev_header)`.
    pub header: FilterHeader,
}

/// Published on the oracle's broadcast channel on every tip advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterEvent {
    /// Network the tip belongs to.
    pub chain: Chain,
    /// Filter type whose tip moved.
    pub filter_type: FilterType,
    /// The new verified tip.
    pub position: BlockPosition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_type_roundtrips_through_byte() {
        assert_eq!(FilterType::from_u8(FilterType::Basic.to_u8()), Some(FilterType::Basic));
        assert_eq!(FilterType::from_u8(7), None);
    }

    #[test]
    fn positions_order_by_height_first() {
        let a = BlockPosition::new(5, BlockHash::from_byte_array([9u8; 32]));
        let b = BlockPosition::new(6, BlockHash::from_byte_array([1u8; 32]));
        assert!(a < b);

        let c = BlockPosition::new(5, BlockHash::from_byte_array([1u8; 32]));
        assert_ne!(a, c);
        assert_eq!(a, BlockPosition::new(5, BlockHash::from_byte_array([9u8; 32])));
    }

    #[test]
    fn genesis_header_is_all_zero() {
        use bitcoin::hashes::Hash as _;
        assert_eq!(
            FilterType::Basic.genesis_header().to_byte_array(),
            [0u8; 32]
        );
    }
}
