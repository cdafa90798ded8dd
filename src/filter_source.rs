//! Abstractions for fetching compact filter data from the network (HTTP or P2P).
//!
//! Peer selection, retries against a different peer, and connection lifecycle
//! all stay with the implementor; the pipelines only describe *what* range
//! they need next.
use async_trait::async_trait;
use bitcoin::{BlockHash, FilterHash};

/// A contiguous height range one pipeline wants fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    /// First height in the range.
    pub start_height: u32,
    /// Last height in the range (inclusive).
    pub stop_height: u32,
    /// Best-chain block hash at `stop_height`, per BIP157 request framing.
    pub stop_hash: BlockHash,
}

impl BatchRequest {
    /// Number of heights the request covers.
    pub fn len(&self) -> u32 {
        self.stop_height - self.start_height + 1
    }

    /// Whether the range is empty (never true for a well-formed request).
    pub fn is_empty(&self) -> bool {
        self.stop_height < self.start_height
    }
}

/// Peer response to a cfheaders request: one filter *hash* per height.
///
/// Only the hashes are taken from the wire; chained headers are always
/// recomputed locally from the already-verified predecessor.
#[derive(Debug, Clone)]
pub struct CfHeaderBatch {
    /// Height of the first hash in `filter_hashes`.
    pub start_height: u32,
    /// Stop hash the response claims to cover.
    pub stop_hash: BlockHash,
    /// Consecutive per-block filter hashes.
    pub filter_hashes: Vec<FilterHash>,
}

/// Peer response to a cfilters request: count-prefixed filter bodies keyed
/// by block hash, in height order.
#[derive(Debug, Clone)]
pub struct CfilterBatch {
    /// Height of the first body in `filters`.
    pub start_height: u32,
    /// `(block_hash, encoded_filter)` per height.
    pub filters: Vec<(BlockHash, Vec<u8>)>,
}

/// Network provider for compact-filter sync.
#[async_trait]
pub trait FilterTransport: Send + Sync {
    /// Fetch filter hashes for the requested range.
    async fn get_cfheaders(&self, request: &BatchRequest) -> anyhow::Result<CfHeaderBatch>;

    /// Fetch filter bodies for the requested range.
    async fn get_cfilters(&self, request: &BatchRequest) -> anyhow::Result<CfilterBatch>;
}

/// Transport stub for nodes that index locally and never download filters.
/// Every call fails; the oracle does not route requests here in index mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl FilterTransport for NullTransport {
    async fn get_cfheaders(&self, request: &BatchRequest) -> anyhow::Result<CfHeaderBatch> {
        anyhow::bail!("no filter transport configured (range {:?})", request)
    }

    async fn get_cfilters(&self, request: &BatchRequest) -> anyhow::Result<CfilterBatch> {
        anyhow::bail!("no filter transport configured (range {:?})", request)
    }
}
