//! Coordinator for the three sync pipelines: startup reconciliation,
//! rollback, the query surface, bulk sync-server ingestion, and tip
//! notifications.
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, FilterHeader};
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::blocks::BlockSource;
use crate::chain::{BlockPosition, Chain, FilterEvent, FilterType};
use crate::chained::{await_link, header_links};
use crate::checkpoints::CheckpointTable;
use crate::error::{OracleError, Result};
use crate::filter_source::FilterTransport;
use crate::filter_sync::FilterDownloader;
use crate::gcs::GcsFilter;
use crate::header_sync::HeaderDownloader;
use crate::headers::HeaderOracle;
use crate::indexer::BlockIndexer;
use crate::store::FilterDatabase;

/// Which pipelines the oracle instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Filters disabled; the oracle only answers queries.
    Disabled,
    /// Download cfheaders and cfilters from peers (pipelines A + B).
    Download,
    /// Compute filters locally from full blocks (pipeline C).
    Index,
}

/// Oracle configuration.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Network being tracked.
    pub chain: Chain,
    /// Filter type this oracle maintains.
    pub filter_type: FilterType,
    /// Pipeline selection.
    pub mode: SyncMode,
    /// Re-announce the tip if no progress is observed for this long.
    pub stall_timeout: Duration,
    /// Bounded-concurrency limit for compute/ingestion jobs.
    pub max_jobs: usize,
}

impl OracleConfig {
    /// Sensible defaults for a download-mode node on `chain`.
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            filter_type: FilterType::Basic,
            mode: SyncMode::Download,
            stall_timeout: Duration::from_secs(60),
            max_jobs: 4,
        }
    }
}

/// One `(block, filter)` tuple supplied by a trusted sync server.
#[derive(Debug, Clone)]
pub struct SyncData {
    /// Block the filter covers.
    pub position: BlockPosition,
    /// Count-prefixed serialized filter.
    pub encoded_filter: Vec<u8>,
}

/// Consecutive transient failures tolerated per sync phase before the error
/// is surfaced to the caller driving the sync.
const MAX_BATCH_RETRIES: u32 = 3;

struct Progress {
    last_tip: Option<BlockPosition>,
    last_change: Instant,
}

/// The compact-filter oracle: owns the sync pipelines and answers all filter
/// queries. Collaborators are constructor-injected; the oracle depends on
/// them, never the reverse.
pub struct FilterOracle<D, H, T, B> {
    config: OracleConfig,
    db: Arc<D>,
    headers: Arc<H>,
    transport: Arc<T>,
    checkpoints: CheckpointTable,
    header_sync: Option<Arc<HeaderDownloader<D, H>>>,
    filter_sync: Option<Arc<FilterDownloader<D, H>>>,
    indexer: Option<Arc<BlockIndexer<D, H, B>>>,
    events: broadcast::Sender<FilterEvent>,
    progress: Arc<Mutex<Progress>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<D, H, T, B> FilterOracle<D, H, T, B>
where
    D: FilterDatabase + 'static,
    H: HeaderOracle + 'static,
    T: FilterTransport + 'static,
    B: BlockSource + 'static,
{
    /// Construct the oracle, run the startup reconciliation checks, and
    /// start the heartbeat.
    pub async fn start(
        config: OracleConfig,
        db: Arc<D>,
        headers: Arc<H>,
        transport: Arc<T>,
        blocks: Arc<B>,
        checkpoints: CheckpointTable,
    ) -> anyhow::Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(64);

        let mut header_sync = None;
        let mut filter_sync = None;
        let mut indexer = None;
        match config.mode {
            SyncMode::Disabled => {}
            SyncMode::Download => {
                header_sync = Some(Arc::new(
                    HeaderDownloader::open(
                        Arc::clone(&db),
                        Arc::clone(&headers),
                        checkpoints.clone(),
                        config.filter_type,
                    )
                    .await?,
                ));
                filter_sync = Some(Arc::new(
                    FilterDownloader::open(
                        Arc::clone(&db),
                        Arc::clone(&headers),
                        config.filter_type,
                    )
                    .await?,
                ));
            }
            SyncMode::Index => {
                indexer = Some(Arc::new(
                    BlockIndexer::open(
                        Arc::clone(&db),
                        Arc::clone(&headers),
                        Arc::clone(&blocks),
                        config.filter_type,
                        config.max_jobs,
                        shutdown_rx.clone(),
                    )
                    .await?,
                ));
            }
        }

        let oracle = Arc::new(Self {
            config,
            db,
            headers,
            transport,
            checkpoints,
            header_sync,
            filter_sync,
            indexer,
            events,
            progress: Arc::new(Mutex::new(Progress {
                last_tip: None,
                last_change: Instant::now(),
            })),
            shutdown_tx,
            shutdown_rx,
            heartbeat: std::sync::Mutex::new(None),
        });

        oracle.compare_tips_to_header_chain().await?;
        oracle.compare_tips_to_checkpoints().await?;
        oracle.spawn_heartbeat();
        Ok(oracle)
    }

    /// Network this oracle tracks.
    pub fn chain(&self) -> Chain {
        self.config.chain
    }

    /// The filter type served by default.
    pub fn default_type(&self) -> FilterType {
        self.config.filter_type
    }

    /// Subscribe to tip-advance notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<FilterEvent> {
        self.events.subscribe()
    }

    /// Verified filter-header tip (read-through to the database).
    pub async fn header_tip(&self, filter_type: FilterType) -> Result<Option<BlockPosition>> {
        Ok(self.db.header_tip(filter_type).await?)
    }

    /// Verified filter-body tip (read-through to the database).
    pub async fn filter_tip(&self, filter_type: FilterType) -> Result<Option<BlockPosition>> {
        Ok(self.db.filter_tip(filter_type).await?)
    }

    /// Stored chained header for a block.
    pub async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> Result<Option<FilterHeader>> {
        Ok(self.db.load_filter_header(filter_type, block).await?)
    }

    /// Stored filter for a block, reassembled without re-encoding.
    pub async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> Result<Option<GcsFilter>> {
        Ok(self
            .db
            .load_filter(filter_type, block)
            .await?
            .map(|(n, content)| GcsFilter::from_parts(block, n, content)))
    }

    /// Like [`Self::load_filter`], but a hole *below* the filter tip is
    /// treated as corruption: both tips are rolled back to the parent
    /// position and the pipelines reset, and the hole is reported as an
    /// error. Above the tip the filter is simply not yet synced (`None`).
    pub async fn load_filter_or_reset_tip(
        &self,
        filter_type: FilterType,
        position: &BlockPosition,
    ) -> Result<Option<GcsFilter>> {
        if let Some(filter) = self.load_filter(filter_type, &position.hash).await? {
            return Ok(Some(filter));
        }
        let tip = self.db.filter_tip(filter_type).await?;
        if tip.is_some_and(|t| position.height <= t.height) {
            warn!(
                %position,
                "filter missing below the filter tip; rolling back to parent"
            );
            let parent = match self.headers.parent_of(position).await? {
                Some(parent) => parent,
                None => self.genesis_position().await?,
            };
            self.rollback(parent).await?;
            return Err(OracleError::MissingFilter(*position));
        }
        Ok(None)
    }

    /// Drive the configured pipelines until they are caught up with the best
    /// block-header chain, then return the filter tip reached.
    ///
    /// Transient failures are retried a bounded number of times; checkpoint
    /// mismatches trigger a rollback and the sync resumes from the rolled-
    /// back position.
    pub async fn sync_to_tip(&self) -> Result<BlockPosition> {
        // The chain can reorganize at any time, not just across restarts:
        // a persisted tip on an abandoned branch must be rolled back before
        // either pipeline extends it.
        if self.config.mode != SyncMode::Disabled {
            self.compare_tips_to_header_chain().await?;
        }
        match self.config.mode {
            SyncMode::Disabled => {
                let tip = self.db.filter_tip(self.config.filter_type).await?;
                Ok(tip.unwrap_or(BlockPosition::unknown_genesis()))
            }
            SyncMode::Download => {
                self.sync_headers().await?;
                self.sync_filters().await?;
                let tip = self.db.filter_tip(self.config.filter_type).await?;
                Ok(tip.unwrap_or(BlockPosition::unknown_genesis()))
            }
            SyncMode::Index => {
                let indexer = self.indexer.as_ref().expect("index mode has an indexer");
                let target = self.headers.tip().await?;
                let tip = indexer.index_to(target).await?;
                self.publish(tip).await;
                Ok(tip)
            }
        }
    }

    async fn sync_headers(&self) -> Result<()> {
        let pipeline = self
            .header_sync
            .as_ref()
            .expect("download mode has a header pipeline");
        let mut retries = 0u32;
        let mut rollbacks = 0u32;
        loop {
            if *self.shutdown_rx.borrow() {
                return Err(OracleError::Shutdown);
            }
            let Some(request) = pipeline.next_batch().await? else {
                return Ok(());
            };
            let batch = match self.transport.get_cfheaders(&request).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "cfheaders request failed");
                    pipeline
                        .reset(pipeline.tip().await, pipeline.tip_header().await)
                        .await;
                    retries += 1;
                    if retries > MAX_BATCH_RETRIES {
                        return Err(e.into());
                    }
                    continue;
                }
            };
            match pipeline.accept(batch).await {
                Ok(Some(tip)) => {
                    retries = 0;
                    self.publish(tip).await;
                }
                Ok(None) => {}
                Err(OracleError::CheckpointMismatch { height }) => {
                    rollbacks += 1;
                    if rollbacks > MAX_BATCH_RETRIES {
                        return Err(OracleError::CheckpointMismatch { height });
                    }
                    self.rollback_to_checkpoint().await?;
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "cfheaders batch rejected; retrying");
                    retries += 1;
                    if retries > MAX_BATCH_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_filters(&self) -> Result<()> {
        let pipeline = self
            .filter_sync
            .as_ref()
            .expect("download mode has a filter pipeline");
        let mut retries = 0u32;
        loop {
            if *self.shutdown_rx.borrow() {
                return Err(OracleError::Shutdown);
            }
            let Some(request) = pipeline.next_batch().await? else {
                return Ok(());
            };
            let outcome = match self.transport.get_cfilters(&request).await {
                Ok(batch) => pipeline.accept(batch).await,
                Err(e) => Err(OracleError::Collaborator(e)),
            };
            match outcome {
                Ok(Some(tip)) => {
                    retries = 0;
                    self.publish(tip).await;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "cfilters batch rejected; retrying");
                    pipeline
                        .reset(pipeline.tip().await, self.prev_header_at(pipeline.tip().await).await?)
                        .await;
                    retries += 1;
                    if retries > MAX_BATCH_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bulk ingestion from a trusted sync server. Items must continue the
    /// filter chain contiguously; each body is decoded, chained, and checked
    /// against the checkpoint table, with computation fanned out across a
    /// semaphore-gated worker pool.
    pub async fn process_sync_data(&self, items: Vec<SyncData>) -> Result<BlockPosition> {
        let filter_type = self.config.filter_type;
        let start_tip = self.db.filter_tip(filter_type).await?;
        let start_height = start_tip.map_or(0, |t| t.height);

        let pending: Vec<SyncData> = items
            .into_iter()
            .filter(|item| item.position.height > start_height)
            .collect();
        let Some(first) = pending.first() else {
            return Ok(start_tip.unwrap_or(BlockPosition::unknown_genesis()));
        };
        if first.position.height != start_height + 1 {
            return Err(OracleError::BatchStart {
                got: first.position.height,
                expected: start_height + 1,
            });
        }
        for pair in pending.windows(2) {
            if pair[1].position.height != pair[0].position.height + 1 {
                return Err(OracleError::BatchStart {
                    got: pair[1].position.height,
                    expected: pair[0].position.height + 1,
                });
            }
        }

        let seed = match start_tip {
            Some(tip) if tip.height > 0 => self
                .db
                .load_filter_header(filter_type, &tip.hash)
                .await?
                .ok_or(OracleError::MissingFilter(tip))?,
            _ => filter_type.genesis_header(),
        };

        let links = header_links(seed, pending.len());
        let admission = Arc::new(Semaphore::new(self.config.max_jobs.max(1)));
        let mut set: JoinSet<Result<(BlockPosition, FilterHeader, u64, Vec<u8>)>> = JoinSet::new();
        for (item, (prev_rx, own_tx)) in pending.into_iter().zip(links) {
            let permit = Arc::clone(&admission)
                .acquire_owned()
                .await
                .map_err(|_| OracleError::Shutdown)?;
            let checkpoints = self.checkpoints.clone();
            let shutdown = self.shutdown_rx.clone();
            set.spawn(async move {
                let _permit = permit;
                let position = item.position;

                let filter = GcsFilter::from_encoded(&position.hash, &item.encoded_filter)?;
                filter.validate()?;

                let prev = await_link(prev_rx, shutdown, position.height).await?;
                let header = filter.header(&prev);
                if let Some(pinned) = checkpoints.lookup(position.height) {
                    if *pinned != header {
                        return Err(OracleError::CheckpointMismatch {
                            height: position.height,
                        });
                    }
                }

                let _ = own_tx.send(header);
                Ok((position, header, filter.element_count(), filter.content().to_vec()))
            });
        }

        // Drain every job; a failing job drops its link sender, so its
        // successors fail with `Stale`. Report the root cause, not the
        // induced staleness.
        let mut rows = Vec::new();
        let mut failure: Option<OracleError> = None;
        while let Some(joined) = set.join_next().await {
            match joined.map_err(|e| OracleError::Collaborator(e.into()))? {
                Ok(row) => rows.push(row),
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
        if let Some(e) = failure {
            return Err(e);
        }
        rows.sort_by_key(|(position, ..)| position.height);

        // Guard against a rollback racing this ingest: the tip must still be
        // where we started before anything is persisted. Height alone is not
        // enough, a resync can land on the same height of another branch.
        if self.db.filter_tip(filter_type).await? != start_tip {
            return Err(OracleError::Stale);
        }

        let header_rows: Vec<(BlockHash, FilterHeader)> = rows
            .iter()
            .map(|(position, header, ..)| (position.hash, *header))
            .collect();
        let filter_rows: Vec<(BlockHash, u64, Vec<u8>)> = rows
            .iter()
            .map(|(position, _, n, content)| (position.hash, *n, content.clone()))
            .collect();
        let (new_tip, tip_header) = {
            let (position, header, ..) = rows.last().expect("non-empty ingest");
            (*position, *header)
        };

        // The header chain may already extend past the ingested range; its
        // tip never moves backwards.
        let header_tip_ahead = self
            .db
            .header_tip(filter_type)
            .await?
            .filter(|t| t.height >= new_tip.height);
        let header_new_tip = header_tip_ahead.unwrap_or(new_tip);
        self.db
            .store_filter_headers(filter_type, &header_rows, header_new_tip)
            .await?;
        self.db
            .store_filters(filter_type, &filter_rows, new_tip)
            .await?;

        // Bring the download pipelines up to the ingested position so they
        // continue from here instead of re-requesting the range. A header
        // pipeline already past it keeps its verified progress.
        if header_tip_ahead.is_none() {
            if let Some(p) = &self.header_sync {
                p.reset(new_tip, tip_header).await;
            }
        }
        if let Some(p) = &self.filter_sync {
            p.reset(new_tip, tip_header).await;
        }

        info!(height = new_tip.height, "sync-data ingest advanced filter tip");
        self.publish(new_tip).await;
        Ok(new_tip)
    }

    /// Stop all pipelines and the heartbeat. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.heartbeat.lock().expect("heartbeat lock").take() {
            handle.abort();
        }
    }

    // ---- internal ----

    async fn genesis_position(&self) -> Result<BlockPosition> {
        let hash = self
            .headers
            .best_hash(0)
            .await?
            .unwrap_or_else(|| BlockHash::from_byte_array([0u8; 32]));
        Ok(BlockPosition::new(0, hash))
    }

    async fn prev_header_at(&self, position: BlockPosition) -> Result<FilterHeader> {
        if position.height == 0 {
            return Ok(self.config.filter_type.genesis_header());
        }
        // A recorded tip without its header row is local corruption, not a
        // fresh start.
        Ok(self
            .db
            .load_filter_header(self.config.filter_type, &position.hash)
            .await?
            .ok_or(OracleError::MissingFilter(position))?)
    }

    /// Roll both tips back to `position` and reset every owned pipeline.
    async fn rollback(&self, position: BlockPosition) -> Result<()> {
        let filter_type = self.config.filter_type;
        self.db.rollback(filter_type, &position).await?;
        let prev_header = self.prev_header_at(position).await?;
        if let Some(p) = &self.header_sync {
            p.reset(position, prev_header).await;
        }
        if let Some(p) = &self.filter_sync {
            p.reset(position, prev_header).await;
        }
        if let Some(p) = &self.indexer {
            p.reset(position, prev_header).await;
        }
        warn!(%position, "rolled filter chain back");
        Ok(())
    }

    /// Roll back to the highest checkpoint whose persisted header agrees
    /// with the compiled table, or to genesis when none agrees.
    async fn rollback_to_checkpoint(&self) -> Result<()> {
        let filter_type = self.config.filter_type;
        let tip_height = self
            .db
            .header_tip(filter_type)
            .await?
            .map_or(0, |t| t.height);

        for (height, pinned) in self.checkpoints.at_or_below(tip_height) {
            let Some(hash) = self.headers.best_hash(height).await? else {
                continue;
            };
            let stored = self.db.load_filter_header(filter_type, &hash).await?;
            if stored.as_ref() == Some(pinned) {
                return self.rollback(BlockPosition::new(height, hash)).await;
            }
        }
        let genesis = self.genesis_position().await?;
        self.rollback(genesis).await
    }

    /// Startup check: if either persisted tip sits on a branch the best
    /// chain has abandoned, roll back to the common ancestor.
    async fn compare_tips_to_header_chain(&self) -> Result<()> {
        let filter_type = self.config.filter_type;
        for tip in [
            self.db.header_tip(filter_type).await?,
            self.db.filter_tip(filter_type).await?,
        ] {
            let Some(position) = tip else { continue };
            if position.height == 0 {
                continue;
            }
            if self.headers.best_hash(position.height).await? == Some(position.hash) {
                continue;
            }
            let (ancestor, best) = self.headers.common_parent(&position).await?;
            warn!(
                stale = %position,
                %ancestor,
                best = %best,
                "persisted filter tip is on an abandoned branch"
            );
            self.rollback(ancestor).await?;
            return Ok(());
        }
        Ok(())
    }

    /// Startup check: if the persisted header at the nearest checkpoint
    /// disagrees with the compiled table, roll back to the last agreeing
    /// checkpoint (or genesis).
    async fn compare_tips_to_checkpoints(&self) -> Result<()> {
        let filter_type = self.config.filter_type;
        let Some(tip) = self.db.header_tip(filter_type).await? else {
            return Ok(());
        };
        let Some((height, pinned)) = self.checkpoints.at_or_below(tip.height).next() else {
            return Ok(());
        };
        let Some(hash) = self.headers.best_hash(height).await? else {
            return Ok(());
        };
        let stored = self.db.load_filter_header(filter_type, &hash).await?;
        if stored.as_ref() == Some(pinned) {
            return Ok(());
        }
        warn!(height, "persisted header disagrees with checkpoint at startup");
        self.rollback_to_checkpoint().await
    }

    async fn publish(&self, position: BlockPosition) {
        let event = FilterEvent {
            chain: self.config.chain,
            filter_type: self.config.filter_type,
            position,
        };
        let _ = self.events.send(event);
        let mut progress = self.progress.lock().await;
        progress.last_tip = Some(position);
        progress.last_change = Instant::now();
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let events = self.events.clone();
        let progress = Arc::clone(&self.progress);
        let db = Arc::clone(&self.db);
        let chain = self.config.chain;
        let filter_type = self.config.filter_type;
        let stall = self.config.stall_timeout;
        let mut shutdown = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stall.max(Duration::from_millis(100)) / 4);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stalled = {
                            let p = progress.lock().await;
                            p.last_change.elapsed() >= stall
                        };
                        if !stalled {
                            continue;
                        }
                        if let Ok(Some(tip)) = db.filter_tip(filter_type).await {
                            debug!(height = tip.height, "re-announcing stalled filter tip");
                            let _ = events.send(FilterEvent { chain, filter_type, position: tip });
                        }
                        progress.lock().await.last_change = Instant::now();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.heartbeat.lock().expect("heartbeat lock") = Some(handle);
    }
}

impl<D, H, T, B> Drop for FilterOracle<D, H, T, B> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut guard) = self.heartbeat.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
