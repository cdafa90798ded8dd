#![allow(dead_code)]
//! Shared in-memory fakes for the integration tests: a database, a block
//! header chain, and an honest (optionally misbehaving) filter peer.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, FilterHeader};
use faro_157::filter_source::{BatchRequest, CfHeaderBatch, CfilterBatch};
use faro_157::prelude::*;

/// Deterministic block hash for `(height, fork)`.
pub fn hash_at(height: u32, fork: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0..4].copy_from_slice(&height.to_le_bytes());
    bytes[4] = fork;
    bytes[5] = 0xc5;
    BlockHash::from_byte_array(bytes)
}

/// Filter elements every honest party derives for a block.
pub fn elements_at(height: u32, hash: &BlockHash) -> Vec<Vec<u8>> {
    vec![
        format!("spk_{height}").into_bytes(),
        hash.to_byte_array()[..8].to_vec(),
    ]
}

/// ------- An honest chain of blocks, filters, and chained headers -------
#[derive(Clone)]
pub struct World {
    /// Block hash per height (index = height).
    pub hashes: Vec<BlockHash>,
    /// Filter per height (height 0 entry is an empty placeholder).
    pub filters: Vec<GcsFilter>,
    /// Chained header per height (height 0 entry is the genesis anchor).
    pub headers: Vec<FilterHeader>,
}

impl World {
    pub fn generate(tip: u32, fork: u8) -> Self {
        Self::from_hashes((0..=tip).map(|h| hash_at(h, fork)).collect())
    }

    pub fn from_hashes(hashes: Vec<BlockHash>) -> Self {
        let genesis = FilterType::Basic.genesis_header();
        let mut filters = vec![GcsFilter::construct(&hashes[0], std::iter::empty::<&[u8]>())];
        let mut headers = vec![genesis];
        let mut prev = genesis;
        for (height, hash) in hashes.iter().enumerate().skip(1) {
            let filter = GcsFilter::construct(hash, elements_at(height as u32, hash));
            prev = filter.header(&prev);
            filters.push(filter);
            headers.push(prev);
        }
        Self { hashes, filters, headers }
    }

    pub fn position(&self, height: u32) -> BlockPosition {
        BlockPosition::new(height, self.hashes[height as usize])
    }

    pub fn tip(&self) -> BlockPosition {
        self.position(self.hashes.len() as u32 - 1)
    }
}

/// ------- Minimal in-memory FilterDatabase -------
#[derive(Default)]
struct DbInner {
    header_tip: HashMap<u8, BlockPosition>,
    filter_tip: HashMap<u8, BlockPosition>,
    headers: HashMap<(u8, BlockHash), FilterHeader>,
    filters: HashMap<(u8, BlockHash), (u64, Vec<u8>)>,
}

#[derive(Default)]
pub struct MemDb {
    inner: Mutex<DbInner>,
}

impl MemDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate local corruption by dropping one stored filter body.
    pub fn remove_filter(&self, filter_type: FilterType, block: &BlockHash) {
        self.inner
            .lock()
            .unwrap()
            .filters
            .remove(&(filter_type.to_u8(), *block));
    }
}

#[async_trait]
impl FilterDatabase for MemDb {
    async fn header_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<BlockPosition>> {
        Ok(self.inner.lock().unwrap().header_tip.get(&filter_type.to_u8()).copied())
    }

    async fn filter_tip(&self, filter_type: FilterType) -> anyhow::Result<Option<BlockPosition>> {
        Ok(self.inner.lock().unwrap().filter_tip.get(&filter_type.to_u8()).copied())
    }

    async fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<FilterHeader>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .headers
            .get(&(filter_type.to_u8(), *block))
            .copied())
    }

    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> anyhow::Result<Option<(u64, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .filters
            .get(&(filter_type.to_u8(), *block))
            .cloned())
    }

    async fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[(BlockHash, FilterHeader)],
        new_tip: BlockPosition,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for (block, header) in headers {
            inner.headers.insert((filter_type.to_u8(), *block), *header);
        }
        inner.header_tip.insert(filter_type.to_u8(), new_tip);
        Ok(())
    }

    async fn store_filters(
        &self,
        filter_type: FilterType,
        filters: &[(BlockHash, u64, Vec<u8>)],
        new_tip: BlockPosition,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for (block, n, content) in filters {
            inner
                .filters
                .insert((filter_type.to_u8(), *block), (*n, content.clone()));
        }
        inner.filter_tip.insert(filter_type.to_u8(), new_tip);
        Ok(())
    }

    async fn rollback(
        &self,
        filter_type: FilterType,
        position: &BlockPosition,
    ) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for tips in [&mut inner.header_tip, &mut inner.filter_tip] {
            if let Some(tip) = tips.get(&filter_type.to_u8()) {
                if tip.height > position.height {
                    tips.insert(filter_type.to_u8(), *position);
                }
            }
        }
        Ok(())
    }
}

/// ------- Fake best-chain header oracle -------
struct ChainInner {
    hashes: Vec<BlockHash>,
    /// Height `common_parent` answers with for stale positions.
    ancestor: u32,
}

pub struct FakeChain {
    inner: Mutex<ChainInner>,
}

impl FakeChain {
    pub fn new(world: &World) -> Arc<Self> {
        Self::from_hashes(world.hashes.clone())
    }

    pub fn from_hashes(hashes: Vec<BlockHash>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ChainInner { hashes, ancestor: 0 }),
        })
    }

    /// Replace the best chain (a reorg) and record where the old branch
    /// forked off.
    pub fn apply(&self, world: &World, common_ancestor: u32) {
        self.apply_hashes(world.hashes.clone(), common_ancestor);
    }

    pub fn apply_hashes(&self, hashes: Vec<BlockHash>, common_ancestor: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.hashes = hashes;
        inner.ancestor = common_ancestor;
    }
}

#[async_trait]
impl HeaderOracle for FakeChain {
    async fn tip(&self) -> anyhow::Result<BlockPosition> {
        let inner = self.inner.lock().unwrap();
        let height = inner.hashes.len() as u32 - 1;
        Ok(BlockPosition::new(height, inner.hashes[height as usize]))
    }

    async fn best_hash(&self, height: u32) -> anyhow::Result<Option<BlockHash>> {
        Ok(self.inner.lock().unwrap().hashes.get(height as usize).copied())
    }

    async fn common_parent(
        &self,
        _position: &BlockPosition,
    ) -> anyhow::Result<(BlockPosition, BlockPosition)> {
        let inner = self.inner.lock().unwrap();
        let tip_height = inner.hashes.len() as u32 - 1;
        Ok((
            BlockPosition::new(inner.ancestor, inner.hashes[inner.ancestor as usize]),
            BlockPosition::new(tip_height, inner.hashes[tip_height as usize]),
        ))
    }

    async fn parent_of(&self, position: &BlockPosition) -> anyhow::Result<Option<BlockPosition>> {
        if position.height == 0 {
            return Ok(None);
        }
        let inner = self.inner.lock().unwrap();
        let parent = position.height - 1;
        Ok(inner
            .hashes
            .get(parent as usize)
            .map(|hash| BlockPosition::new(parent, *hash)))
    }
}

/// ------- Block source backed by a map of real blocks -------
#[derive(Default)]
pub struct FakeBlocks {
    blocks: Mutex<HashMap<BlockHash, (bitcoin::Block, Vec<bitcoin::ScriptBuf>)>>,
}

impl FakeBlocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, block: bitcoin::Block, spent: Vec<bitcoin::ScriptBuf>) {
        self.blocks
            .lock()
            .unwrap()
            .insert(block.block_hash(), (block, spent));
    }
}

#[async_trait]
impl BlockSource for FakeBlocks {
    async fn fetch_block(&self, position: &BlockPosition) -> anyhow::Result<bitcoin::Block> {
        self.blocks
            .lock()
            .unwrap()
            .get(&position.hash)
            .map(|(block, _)| block.clone())
            .ok_or_else(|| anyhow::anyhow!("no block for {position}"))
    }

    async fn spent_scripts(
        &self,
        position: &BlockPosition,
    ) -> anyhow::Result<Vec<bitcoin::ScriptBuf>> {
        self.blocks
            .lock()
            .unwrap()
            .get(&position.hash)
            .map(|(_, spent)| spent.clone())
            .ok_or_else(|| anyhow::anyhow!("no block for {position}"))
    }
}

/// ------- Filter peer serving an honest world, optionally tampered -------
pub struct HonestPeer {
    world: Mutex<World>,
    /// When set, the cfilter body at this height is replaced by a valid GCS
    /// filter over different elements.
    bad_body_at: Mutex<Option<u32>>,
}

impl HonestPeer {
    pub fn new(world: &World) -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(world.clone()),
            bad_body_at: Mutex::new(None),
        })
    }

    pub fn set_world(&self, world: &World) {
        *self.world.lock().unwrap() = world.clone();
    }

    pub fn tamper_body_at(&self, height: u32) {
        *self.bad_body_at.lock().unwrap() = Some(height);
    }
}

#[async_trait]
impl FilterTransport for HonestPeer {
    async fn get_cfheaders(&self, request: &BatchRequest) -> anyhow::Result<CfHeaderBatch> {
        let world = self.world.lock().unwrap();
        let filter_hashes = (request.start_height..=request.stop_height)
            .map(|h| world.filters[h as usize].filter_hash())
            .collect();
        Ok(CfHeaderBatch {
            start_height: request.start_height,
            stop_hash: request.stop_hash,
            filter_hashes,
        })
    }

    async fn get_cfilters(&self, request: &BatchRequest) -> anyhow::Result<CfilterBatch> {
        let world = self.world.lock().unwrap();
        let bad = *self.bad_body_at.lock().unwrap();
        let filters = (request.start_height..=request.stop_height)
            .map(|h| {
                let hash = world.hashes[h as usize];
                if bad == Some(h) {
                    (hash, GcsFilter::construct(&hash, [b"tampered".as_slice()]).encode())
                } else {
                    (hash, world.filters[h as usize].encode())
                }
            })
            .collect();
        Ok(CfilterBatch { start_height: request.start_height, filters })
    }
}
