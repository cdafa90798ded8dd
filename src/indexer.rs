//! Pipeline C: computes filters locally from full blocks.
//!
//! Filter computation has no cross-height dependency and runs on a bounded
//! worker pool; only the header-chaining step serializes, through the
//! per-height links in [`crate::chained`]. A job persists its own
//! `(header, filter)` pair before resolving the successor's link, which makes
//! persistence strictly height-ordered without a separate writer task.
use std::sync::Arc;

use anyhow::anyhow;
use bitcoin::{BlockHash, FilterHeader};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::blocks::{extract_elements, BlockSource};
use crate::chain::{BlockPosition, FilterType};
use crate::chained::{await_link, header_links};
use crate::error::{OracleError, Result};
use crate::gcs::GcsFilter;
use crate::headers::HeaderOracle;
use crate::store::FilterDatabase;

struct IndexState {
    tip: BlockPosition,
    prev_header: FilterHeader,
    epoch: u64,
}

/// Local block-to-filter indexing pipeline for one filter type.
pub struct BlockIndexer<D, H, B> {
    db: Arc<D>,
    headers: Arc<H>,
    blocks: Arc<B>,
    filter_type: FilterType,
    jobs: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    state: Arc<Mutex<IndexState>>,
}

impl<D, H, B> BlockIndexer<D, H, B>
where
    D: FilterDatabase + 'static,
    H: HeaderOracle + 'static,
    B: BlockSource + 'static,
{
    /// Resume from the persisted filter tip (headers and bodies advance
    /// together in this pipeline, so the body tip is the lower bound).
    pub async fn open(
        db: Arc<D>,
        headers: Arc<H>,
        blocks: Arc<B>,
        filter_type: FilterType,
        max_jobs: usize,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let tip = match db.filter_tip(filter_type).await? {
            Some(tip) => tip,
            None => {
                use bitcoin::hashes::Hash as _;
                let hash = headers
                    .best_hash(0)
                    .await?
                    .unwrap_or_else(|| BlockHash::from_byte_array([0u8; 32]));
                BlockPosition::new(0, hash)
            }
        };
        let prev_header = if tip.height == 0 {
            filter_type.genesis_header()
        } else {
            // A recorded tip without its header row is local corruption.
            db.load_filter_header(filter_type, &tip.hash)
                .await?
                .ok_or(OracleError::MissingFilter(tip))?
        };
        Ok(Self {
            db,
            headers,
            blocks,
            filter_type,
            jobs: Arc::new(Semaphore::new(max_jobs.max(1))),
            shutdown,
            state: Arc::new(Mutex::new(IndexState { tip, prev_header, epoch: 0 })),
        })
    }

    /// Current contiguous indexed tip.
    pub async fn tip(&self) -> BlockPosition {
        self.state.lock().await.tip
    }

    /// Index every height up to `target`, dispatching computation across the
    /// worker pool. Returns the new tip.
    pub async fn index_to(&self, target: BlockPosition) -> Result<BlockPosition> {
        let (start, seed, epoch) = {
            let st = self.state.lock().await;
            if st.tip.height >= target.height {
                return Ok(st.tip);
            }
            (st.tip.height + 1, st.prev_header, st.epoch)
        };

        let count = (target.height - start + 1) as usize;
        debug!(
            filter_type = %self.filter_type,
            start, target = target.height, "indexing block range"
        );

        let links = header_links(seed, count);
        let mut set: JoinSet<Result<(BlockPosition, FilterHeader)>> = JoinSet::new();
        for (offset, (prev_rx, own_tx)) in links.into_iter().enumerate() {
            let height = start + offset as u32;
            let permit = Arc::clone(&self.jobs)
                .acquire_owned()
                .await
                .map_err(|_| OracleError::Shutdown)?;

            let db = Arc::clone(&self.db);
            let headers = Arc::clone(&self.headers);
            let blocks = Arc::clone(&self.blocks);
            let state = Arc::clone(&self.state);
            let shutdown = self.shutdown.clone();
            let filter_type = self.filter_type;

            set.spawn(async move {
                let _permit = permit;

                let hash = headers
                    .best_hash(height)
                    .await?
                    .ok_or(OracleError::BlockUnavailable(height))?;
                let position = BlockPosition::new(height, hash);

                let block = blocks.fetch_block(&position).await?;
                if block.block_hash() != position.hash {
                    return Err(anyhow!("block source returned wrong block for {position}").into());
                }
                let spent = blocks.spent_scripts(&position).await?;
                let elements = extract_elements(&block, &spent, filter_type);
                let filter = GcsFilter::construct(&position.hash, &elements);

                let prev = await_link(prev_rx, shutdown, height).await?;
                let header = filter.header(&prev);

                {
                    let st = state.lock().await;
                    if st.epoch != epoch {
                        return Err(OracleError::Stale);
                    }
                    db.store_filter_headers(filter_type, &[(position.hash, header)], position)
                        .await?;
                    db.store_filters(
                        filter_type,
                        &[(position.hash, filter.element_count(), filter.content().to_vec())],
                        position,
                    )
                    .await?;
                }

                // Unblock the successor only after our pair is durable.
                let _ = own_tx.send(header);
                Ok((position, header))
            });
        }

        // Drain every job; a failing job drops its link sender, which fails
        // its successors with `Stale`. Surface the root cause.
        let mut newest: Option<(BlockPosition, FilterHeader)> = None;
        let mut failure: Option<OracleError> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| OracleError::Collaborator(e.into()))?;
            match outcome {
                Ok((position, header)) => {
                    if newest.map_or(true, |(p, _)| position.height > p.height) {
                        newest = Some((position, header));
                    }
                }
                Err(e) => {
                    let keep_new = match &failure {
                        None => true,
                        Some(OracleError::Stale) => !matches!(e, OracleError::Stale),
                        Some(_) => false,
                    };
                    if keep_new {
                        failure = Some(e);
                    }
                }
            }
        }
        // Jobs persist strictly in height order, so everything at or below
        // the newest successful height is durable even when a later height
        // failed.
        if let Some((tip, tip_header)) = newest {
            let mut st = self.state.lock().await;
            if st.epoch == epoch {
                st.tip = tip;
                st.prev_header = tip_header;
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        let (tip, _) = newest.expect("at least one height was indexed");
        info!(
            filter_type = %self.filter_type,
            height = tip.height, "indexed filter tip advanced"
        );
        Ok(tip)
    }

    /// Discard in-flight jobs (their epoch check fails on persist) and
    /// resume from `position`.
    pub async fn reset(&self, position: BlockPosition, prev_header: FilterHeader) {
        let mut st = self.state.lock().await;
        st.epoch += 1;
        st.tip = position;
        st.prev_header = prev_header;
        info!(
            filter_type = %self.filter_type,
            height = position.height, "indexer reset"
        );
    }
}
