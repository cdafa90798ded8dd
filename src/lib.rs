#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! faro-157: a compact-filter (BIP-157/158) oracle for light clients and nodes.
//!
//! ## What you implement
//! - [`HeaderOracle`]: answer block-header questions (tip, hash at height,
//!   common ancestor with a stale branch).
//! - [`FilterTransport`]: fetch cfheaders and cfilters batches from peers
//!   (download mode only).
//! - [`BlockSource`]: fetch full blocks and spent scripts (index mode only).
//! - [`FilterDatabase`]: persist chained headers, filter bodies, and the two
//!   tips (or use the bundled [`SqliteFilterStore`]).
//!
//! ## What the oracle does
//! - Downloads **cfheaders**, recomputes the chain locally, and verifies it
//!   against compiled checkpoints.
//! - Downloads **cfilters**, checks each body against its committed header,
//!   and persists them in strict height order.
//! - Or, in index mode, computes filters from full blocks on a bounded
//!   worker pool.
//! - Rolls both tips back across reorgs and checkpoint disagreements, and
//!   broadcasts every tip advance to subscribers.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use faro_157::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(
//!     db: Arc<SqliteFilterStore>,
//!     headers: Arc<impl HeaderOracle + 'static>,
//!     transport: Arc<impl FilterTransport + 'static>,
//! ) -> anyhow::Result<()> {
//!     let config = OracleConfig::new(Chain::Signet);
//!     let oracle = FilterOracle::start(
//!         config,
//!         db,
//!         headers,
//!         transport,
//!         Arc::new(NullBlocks),
//!         CheckpointTable::for_network(Chain::Signet, FilterType::Basic),
//!     )
//!     .await?;
//!
//!     let mut events = oracle.subscribe();
//!     let tip = oracle.sync_to_tip().await?;
//!     println!("filters synced through {tip}");
//!     while let Ok(event) = events.recv().await {
//!         println!("tip advanced: {}", event.position);
//!     }
//!     Ok(())
//! }
//! ```

/// Block fetching abstraction and filter-element extraction (index mode).
pub mod blocks;

/// Network, filter-type, and block-position primitives.
pub mod chain;

/// Compiled filter-header checkpoints.
pub mod checkpoints;

/// Error taxonomy for the oracle and its pipelines.
pub mod error;

/// Traits and types for fetching cfheaders and cfilters from peers.
pub mod filter_source;

/// Ordered cfilter-body download pipeline.
pub mod filter_sync;

/// BIP-158 Golomb-coded set filters.
pub mod gcs;

/// Ordered cfheader download pipeline.
pub mod header_sync;

/// Block header lookup abstraction.
pub mod headers;

/// Local block-to-filter indexing pipeline.
pub mod indexer;

/// The coordinating oracle: queries, sync driving, rollback, events.
pub mod oracle;

/// Persistence layer (trait and SQLite implementation).
pub mod store;

// Internal helpers:
mod chained;

// Public re-exports
pub use blocks::{BlockSource, NullBlocks};
pub use chain::{BlockPosition, Chain, FilterEvent, FilterType};
pub use checkpoints::CheckpointTable;
pub use error::{OracleError, Result};
pub use filter_source::{BatchRequest, CfHeaderBatch, CfilterBatch, FilterTransport, NullTransport};
pub use filter_sync::FilterDownloader;
pub use gcs::GcsFilter;
pub use header_sync::HeaderDownloader;
pub use headers::HeaderOracle;
pub use indexer::BlockIndexer;
pub use oracle::{FilterOracle, OracleConfig, SyncData, SyncMode};
pub use store::FilterDatabase;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteFilterStore;

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        BlockPosition, BlockSource, Chain, CheckpointTable, FilterDatabase, FilterEvent,
        FilterOracle, FilterTransport, FilterType, GcsFilter, HeaderOracle, NullBlocks,
        NullTransport, OracleConfig, OracleError, SyncData, SyncMode,
    };
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteFilterStore;
}
