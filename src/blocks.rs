//! Full-block access for local filter indexing (the `BlockOracle`
//! collaborator) and BIP158 element extraction.
use async_trait::async_trait;
use bitcoin::{Block, ScriptBuf};

use crate::chain::{BlockPosition, FilterType};

/// Provider of full blocks and the prevout scripts their inputs spend.
///
/// Only the block indexer uses this; download-only nodes never touch it.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the full block at `position`.
    async fn fetch_block(&self, position: &BlockPosition) -> anyhow::Result<Block>;

    /// Script pubkeys of the outputs spent by the block's inputs, in any
    /// order. The indexer cannot derive these from the block alone.
    async fn spent_scripts(&self, position: &BlockPosition) -> anyhow::Result<Vec<ScriptBuf>>;
}

/// Block-source stub for download-only nodes. Every call fails; the oracle
/// does not instantiate the indexer without a real source.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBlocks;

#[async_trait]
impl BlockSource for NullBlocks {
    async fn fetch_block(&self, position: &BlockPosition) -> anyhow::Result<Block> {
        anyhow::bail!("no block source configured ({position})")
    }

    async fn spent_scripts(&self, position: &BlockPosition) -> anyhow::Result<Vec<ScriptBuf>> {
        anyhow::bail!("no block source configured ({position})")
    }
}

/// Extract the filter-relevant elements of a block for the given type.
///
/// BIP158 basic filters cover every non-empty, non-`OP_RETURN` output script
/// created by the block plus the scripts of the outputs its inputs spend.
pub fn extract_elements(
    block: &Block,
    spent_scripts: &[ScriptBuf],
    filter_type: FilterType,
) -> Vec<Vec<u8>> {
    match filter_type {
        FilterType::Basic => {
            let mut elements = Vec::new();
            for tx in &block.txdata {
                for output in &tx.output {
                    let script = &output.script_pubkey;
                    if !script.is_empty() && !script.is_op_return() {
                        elements.push(script.to_bytes());
                    }
                }
            }
            for script in spent_scripts {
                if !script.is_empty() && !script.is_op_return() {
                    elements.push(script.to_bytes());
                }
            }
            elements
        }
    }
}
