//! Block-header chain lookup abstraction (the `HeaderOracle` collaborator).
use async_trait::async_trait;
use bitcoin::BlockHash;

use crate::chain::BlockPosition;

/// Read-only view of the best block-header chain.
///
/// The filter oracle anchors both sync pipelines to this chain and never
/// selects branches itself; chain selection lives with the implementor.
#[async_trait]
pub trait HeaderOracle: Send + Sync {
    /// Current best-chain tip.
    async fn tip(&self) -> anyhow::Result<BlockPosition>;

    /// Hash of the best-chain block at `height`, if the chain reaches it.
    async fn best_hash(&self, height: u32) -> anyhow::Result<Option<BlockHash>>;

    /// For a position possibly on an abandoned branch: the highest ancestor
    /// shared with the best chain, and the current best tip.
    async fn common_parent(
        &self,
        position: &BlockPosition,
    ) -> anyhow::Result<(BlockPosition, BlockPosition)>;

    /// Parent position of `position`, or `None` at genesis.
    async fn parent_of(&self, position: &BlockPosition) -> anyhow::Result<Option<BlockPosition>>;
}
