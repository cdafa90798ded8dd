//! Pipeline B: downloads and validates compact-filter *bodies*.
//!
//! Every received body is validated twice: it must decode as a GCS stream,
//! and re-chaining it from the verified predecessor must reproduce the header
//! pipeline A already committed for that height. A body failing the second
//! check is a protocol violation by the serving peer, not grounds for
//! touching the header chain.
use std::sync::Arc;

use bitcoin::{BlockHash, FilterHeader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::{BlockPosition, FilterType};
use crate::error::{OracleError, Result};
use crate::filter_source::{BatchRequest, CfilterBatch};
use crate::gcs::GcsFilter;
use crate::headers::HeaderOracle;
use crate::store::FilterDatabase;

/// How many filter bodies to request per window (BIP157 caps cfilters
/// responses well below the cfheaders window).
pub(crate) const FILTER_BATCH: u32 = 1_000;

use crate::header_sync::MAX_INFLIGHT_BATCHES;

struct BodyState {
    tip: BlockPosition,
    prev_header: FilterHeader,
    epoch: u64,
    requested_through: u32,
    inflight: usize,
}

/// Ordered cfilter download pipeline for one filter type.
pub struct FilterDownloader<D, H> {
    db: Arc<D>,
    headers: Arc<H>,
    filter_type: FilterType,
    state: Mutex<BodyState>,
}

impl<D, H> FilterDownloader<D, H>
where
    D: FilterDatabase + 'static,
    H: HeaderOracle + 'static,
{
    /// Resume from the persisted filter tip (or genesis on a fresh store).
    pub async fn open(
        db: Arc<D>,
        headers: Arc<H>,
        filter_type: FilterType,
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
            // Corruption, not a fresh start: the tip claims a header that
            // was never stored (or no longer is).
            db.load_filter_header(filter_type, &tip.hash)
                .await?
                .ok_or(OracleError::MissingFilter(tip))?
        };
        Ok(Self {
            db,
            headers,
            filter_type,
            state: Mutex::new(BodyState {
                tip,
                prev_header,
                epoch: 0,
                requested_through: tip.height,
                inflight: 0,
            }),
        })
    }

    /// Current contiguous verified filter-body tip.
    pub async fn tip(&self) -> BlockPosition {
        self.state.lock().await.tip
    }

    /// Reset-generation counter; bumped on every [`Self::reset`].
    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// Next range of bodies to fetch. Never runs ahead of the committed
    /// header chain: bodies can only be validated against accepted headers.
    pub async fn next_batch(&self) -> Result<Option<BatchRequest>> {
        let header_tip = match self.db.header_tip(self.filter_type).await? {
            Some(tip) => tip,
            None => return Ok(None),
        };
        let mut st = self.state.lock().await;
        if st.inflight >= MAX_INFLIGHT_BATCHES {
            return Ok(None);
        }
        let start = st.requested_through.max(st.tip.height) + 1;
        if start > header_tip.height {
            return Ok(None);
        }
        let stop_height = (start + FILTER_BATCH - 1).min(header_tip.height);
        let stop_hash = self
            .headers
            .best_hash(stop_height)
            .await?
            .ok_or(OracleError::BlockUnavailable(stop_height))?;

        st.requested_through = stop_height;
        st.inflight += 1;
        debug!(
            filter_type = %self.filter_type,
            start, stop_height, "requesting cfilters batch"
        );
        Ok(Some(BatchRequest { start_height: start, stop_height, stop_hash }))
    }

    /// Validate and persist a batch of bodies. Returns the new tip on
    /// advance, `None` for a no-op re-delivery.
    pub async fn accept(&self, batch: CfilterBatch) -> Result<Option<BlockPosition>> {
        let mut st = self.state.lock().await;
        st.inflight = st.inflight.saturating_sub(1);

        let expected = st.tip.height + 1;
        let len = batch.filters.len() as u32;
        if len == 0 || batch.start_height > expected {
            st.requested_through = st.tip.height;
            return Err(OracleError::BatchStart { got: batch.start_height, expected });
        }
        let last = batch.start_height + len - 1;
        if last <= st.tip.height {
            return Ok(None);
        }

        let skip = (expected - batch.start_height) as usize;
        let mut rolling = st.prev_header;
        let mut rows: Vec<(BlockHash, u64, Vec<u8>)> = Vec::with_capacity(len as usize - skip);
        for (i, (block_hash, encoded)) in batch.filters.iter().enumerate().skip(skip) {
            let height = batch.start_height + i as u32;
            let position = BlockPosition::new(height, *block_hash);

            let outcome = self
                .validate_body(&position, encoded, &rolling)
                .await;
            let (filter, committed) = match outcome {
                Ok(pair) => pair,
                Err(e) => {
                    // Keep the verified prefix: everything before the bad
                    // body already reproduced its committed header.
                    if !rows.is_empty() {
                        let salvaged =
                            BlockPosition::new(height - 1, rows.last().expect("non-empty").0);
                        if self
                            .db
                            .store_filters(self.filter_type, &rows, salvaged)
                            .await
                            .is_ok()
                        {
                            st.tip = salvaged;
                            st.prev_header = rolling;
                        }
                    }
                    st.requested_through = st.tip.height;
                    return Err(e);
                }
            };

            rows.push((
                *block_hash,
                filter.element_count(),
                filter.content().to_vec(),
            ));
            rolling = committed;
        }

        let new_tip = BlockPosition::new(last, rows.last().expect("non-empty").0);
        if let Err(e) = self
            .db
            .store_filters(self.filter_type, &rows, new_tip)
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
            height = new_tip.height, "cfilter tip advanced"
        );
        Ok(Some(new_tip))
    }

    /// Discard in-flight work and resume from `position` with the supplied
    /// header as the new validation root.
    pub async fn reset(&self, position: BlockPosition, prev_header: FilterHeader) {
        let mut st = self.state.lock().await;
        st.epoch += 1;
        st.tip = position;
        st.prev_header = prev_header;
        st.requested_through = position.height;
        st.inflight = 0;
        info!(
            filter_type = %self.filter_type,
            height = position.height, "filter pipeline reset"
        );
    }

    /// Decode a body and confirm it reproduces the committed header.
    async fn validate_body(
        &self,
        position: &BlockPosition,
        encoded: &[u8],
        prev_header: &FilterHeader,
    ) -> Result<(GcsFilter, FilterHeader)> {
        let filter = GcsFilter::from_encoded(&position.hash, encoded)?;
        filter.validate()?;

        let committed = self
            .db
            .load_filter_header(self.filter_type, &position.hash)
            .await?
            .ok_or(OracleError::BlockUnavailable(position.height))?;

        let recomputed = filter.header(prev_header);
        if recomputed != committed {
            warn!(
                filter_type = %self.filter_type,
                position = %position, "filter body does not reproduce committed header"
            );
            return Err(OracleError::HeaderMismatch { position: *position });
        }
        Ok((filter, committed))
    }
}
