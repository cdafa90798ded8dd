//! Pipeline A: downloads and verifies compact-filter *headers* in order.
//!
//! Peers only ever supply per-block filter hashes; the chained headers are
//! recomputed locally from the already-verified predecessor, so a lying peer
//! can delay sync but cannot splice a bogus chain. Verified ranges are
//! persisted before the in-memory tip moves.
use std::sync::Arc;

use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, FilterHeader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::{BlockPosition, FilterType};
use crate::checkpoints::CheckpointTable;
use crate::error::{OracleError, Result};
use crate::filter_source::{BatchRequest, CfHeaderBatch};
use crate::headers::HeaderOracle;
use crate::store::FilterDatabase;

/// How many cfheaders to advance per request window.
pub(crate) const HEADER_BATCH: u32 = 2_000;

/// Outstanding-request cap (flow control).
pub(crate) const MAX_INFLIGHT_BATCHES: usize = 8;

struct DownloadState {
    tip: BlockPosition,
    prev_header: FilterHeader,
    epoch: u64,
    requested_through: u32,
    inflight: usize,
}

/// Ordered cfheaders download pipeline for one filter type.
pub struct HeaderDownloader<D, H> {
    db: Arc<D>,
    headers: Arc<H>,
    checkpoints: CheckpointTable,
    filter_type: FilterType,
    state: Mutex<DownloadState>,
}

impl<D, H> HeaderDownloader<D, H>
where
    D: FilterDatabase + 'static,
    H: HeaderOracle + 'static,
{
    /// Resume from the persisted header tip (or genesis on a fresh store).
    pub async fn open(
        db: Arc<D>,
        headers: Arc<H>,
        checkpoints: CheckpointTable,
        filter_type: FilterType,
    ) -> anyhow::Result<Self> {
        let tip = match db.header_tip(filter_type).await? {
            Some(tip) => tip,
            None => {
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
            // A recorded tip whose header row is gone is local corruption;
            // resuming from genesis here would poison every later chain link.
            db.load_filter_header(filter_type, &tip.hash)
                .await?
                .ok_or(OracleError::MissingFilter(tip))?
        };
        Ok(Self {
            db,
            headers,
            checkpoints,
            filter_type,
            state: Mutex::new(DownloadState {
                tip,
                prev_header,
                epoch: 0,
                requested_through: tip.height,
                inflight: 0,
            }),
        })
    }

    /// Current contiguous verified header tip.
    pub async fn tip(&self) -> BlockPosition {
        self.state.lock().await.tip
    }

    /// Chained header at the current tip (the seed for the next height).
    pub async fn tip_header(&self) -> FilterHeader {
        self.state.lock().await.prev_header
    }

    /// Reset-generation counter; bumped on every [`Self::reset`].
    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// Next contiguous range still missing a verified header, or `None` when
    /// caught up with the best chain or at the in-flight cap.
    pub async fn next_batch(&self) -> Result<Option<BatchRequest>> {
        let chain_tip = self.headers.tip().await?;
        let mut st = self.state.lock().await;
        if st.inflight >= MAX_INFLIGHT_BATCHES {
            return Ok(None);
        }
        let start = st.requested_through.max(st.tip.height) + 1;
        if start > chain_tip.height {
            return Ok(None);
        }
        let stop_height = (start + HEADER_BATCH - 1).min(chain_tip.height);
        let stop_hash = self
            .headers
            .best_hash(stop_height)
            .await?
            .ok_or(OracleError::BlockUnavailable(stop_height))?;

        st.requested_through = stop_height;
        st.inflight += 1;
        debug!(
            filter_type = %self.filter_type,
            start, stop_height, "requesting cfheaders batch"
        );
        Ok(Some(BatchRequest { start_height: start, stop_height, stop_hash }))
    }

    /// Verify and persist a peer-supplied batch. Returns the new tip on
    /// advance, `None` when the batch was a no-op re-delivery.
    ///
    /// Any failure rewinds the request window to the verified tip so the
    /// range is re-requested; checkpoint mismatches additionally require the
    /// coordinator to roll the chain back.
    pub async fn accept(&self, batch: CfHeaderBatch) -> Result<Option<BlockPosition>> {
        let mut st = self.state.lock().await;
        st.inflight = st.inflight.saturating_sub(1);

        let expected = st.tip.height + 1;
        let len = batch.filter_hashes.len() as u32;
        if len == 0 || batch.start_height > expected {
            st.requested_through = st.tip.height;
            return Err(OracleError::BatchStart { got: batch.start_height, expected });
        }
        let last = batch.start_height + len - 1;
        if last <= st.tip.height {
            // Already verified and persisted; nothing to do.
            return Ok(None);
        }

        let skip = (expected - batch.start_height) as usize;
        let mut rolling = st.prev_header;
        let mut entries: Vec<(BlockHash, FilterHeader)> = Vec::with_capacity(len as usize - skip);
        for (i, filter_hash) in batch.filter_hashes.iter().enumerate().skip(skip) {
            let height = batch.start_height + i as u32;
            let header = filter_hash.filter_header(&rolling);
            if let Some(pinned) = self.checkpoints.lookup(height) {
                if *pinned != header {
                    warn!(
                        filter_type = %self.filter_type,
                        height, "cfheader disagrees with compiled checkpoint"
                    );
                    st.requested_through = st.tip.height;
                    return Err(OracleError::CheckpointMismatch { height });
                }
            }
            let hash = match self.headers.best_hash(height).await {
                Ok(Some(hash)) => hash,
                Ok(None) => {
                    st.requested_through = st.tip.height;
                    return Err(OracleError::BlockUnavailable(height));
                }
                Err(e) => {
                    st.requested_through = st.tip.height;
                    return Err(e.into());
                }
            };
            entries.push((hash, header));
            rolling = header;
        }

        let new_tip = BlockPosition::new(last, entries.last().expect("non-empty").0);
        if let Err(e) = self
            .db
            .store_filter_headers(self.filter_type, &entries, new_tip)
            .await
        {
            st.requested_through = st.tip.height;
            return Err(e.into());
        }

        st.tip = new_tip;
        st.prev_header = rolling;
        st.requested_through = st.requested_through.max(new_tip.height);
        info!(
            filter_type = %self.filter_type,
            height = new_tip.height, "cfheader tip advanced"
        );
        Ok(Some(new_tip))
    }

    /// Discard in-flight work and resume from `position` with the supplied
    /// header as the new chain root.
    pub async fn reset(&self, position: BlockPosition, prev_header: FilterHeader) {
        let mut st = self.state.lock().await;
        st.epoch += 1;
        st.tip = position;
        st.prev_header = prev_header;
        st.requested_through = position.height;
        st.inflight = 0;
        info!(
            filter_type = %self.filter_type,
            height = position.height, "header pipeline reset"
        );
    }
}
