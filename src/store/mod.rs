//! Persistence interfaces and implementations used by the pipelines
//! (filter headers, filter bodies, and the two tips per filter type).
use async_trait::async_trait;
use bitcoin::{BlockHash, FilterHeader};

use crate::chain::{BlockPosition, FilterType};

/// Persistent storage for filter data. No secrets: headers, bodies, and
/// progress markers only.
///
/// The two `store_*` calls are atomic from the oracle's point of view: the
/// rows and the tip move together or not at all, and the in-memory tip is
/// only advanced after the call returns. Filter bodies are stored as
/// `(element_count, content)` so loading never re-encodes.
#[async_trait]
pub trait FilterDatabase: Send + Sync {
    /// Verified filter-*header* tip for a type, if any headers are stored.
    async fn header_tip(&self, filter_type: FilterType)
        -> anyhow::Result<Option<BlockPosition>>;

    /// Verified filter-*body* tip for a type.
    async fn filter_tip(&self, filter_type: FilterType)
        -> anyhow::Result<Option<BlockPosition>>;

    /// Chained header stored for a block, if any.
    async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHeader>>;

    /// Stored filter body for a block as `(element_count, content)`.
    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<(u64, Vec<u8>)>>;

    /// Persist a contiguous run of headers and advance the header tip, as
    /// one unit.
    async fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[(BlockHash, FilterHeader)],
        new_tip: BlockPosition,
    ) -> anyhow::Result<()>;

    /// Persist a contiguous run of filter bodies and advance the filter tip,
    /// as one unit.
    async fn store_filters(
        &self,
        filter_type: FilterType,
        filters: &[(BlockHash, u64, Vec<u8>)],
        new_tip: BlockPosition,
    ) -> anyhow::Result<()>;

    /// Truncate both tips to `position` (whichever currently sits above it).
    /// Stored rows above the position may remain; re-sync overwrites them.
    async fn rollback(
        &self,
        filter_type: FilterType,
        position: &BlockPosition,
    ) -> anyhow::Result<()>;
}

// submodules / concrete stores live here
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteFilterStore;
