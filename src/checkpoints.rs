//! Compiled-in filter-header checkpoints.
//!
//! A checkpoint pins the expected chained filter header at a given height so
//! corruption or an attacking peer is caught without re-verifying the whole
//! history. The table is immutable and injected into the oracle, so tests can
//! substitute synthetic checkpoints.
use std::collections::BTreeMap;

use bitcoin::FilterHeader;

use crate::chain::{Chain, FilterType};

/// Immutable `height -> expected filter header` table for one
/// `(chain, filter type)` pair.
#[derive(Debug, Clone)]
pub struct CheckpointTable {
    chain: Chain,
    filter_type: FilterType,
    entries: BTreeMap<u32, FilterHeader>,
}

impl CheckpointTable {
    /// Vetted checkpoints for a network. Currently empty for every network
    /// (no external trust); populate from a vetted list when one exists.
    pub fn for_network(chain: Chain, filter_type: FilterType) -> Self {
        Self {
            chain,
            filter_type,
            entries: BTreeMap::new(),
        }
    }

    /// Build a table from explicit `(height, header)` pairs.
    pub fn from_entries<I>(chain: Chain, filter_type: FilterType, entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, FilterHeader)>,
    {
        Self {
            chain,
            filter_type,
            entries: entries.into_iter().collect(),
        }
    }

    /// Network this table belongs to.
    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Filter type this table pins.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Expected header at `height`, if a checkpoint exists there.
    pub fn lookup(&self, height: u32) -> Option<&FilterHeader> {
        self.entries.get(&height)
    }

    /// Checkpoints at or below `height`, nearest first. This is the walk
    /// order for finding the last agreeing checkpoint during a rollback.
    pub fn at_or_below(&self, height: u32) -> impl Iterator<Item = (u32, &FilterHeader)> {
        self.entries
            .range(..=height)
            .rev()
            .map(|(h, header)| (*h, header))
    }

    /// Whether any checkpoints are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
