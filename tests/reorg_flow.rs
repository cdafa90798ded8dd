//! Reorg and checkpoint reconciliation: persisted tips must follow the best
//! chain and the compiled checkpoint table, never a stale branch.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{hash_at, FakeChain, HonestPeer, MemDb, World};
use faro_157::prelude::*;

fn config() -> OracleConfig {
    let mut config = OracleConfig::new(Chain::Regtest);
    config.stall_timeout = Duration::from_secs(600);
    config
}

async fn start_oracle(
    config: OracleConfig,
    db: Arc<MemDb>,
    chain: Arc<FakeChain>,
    peer: Arc<HonestPeer>,
    checkpoints: CheckpointTable,
) -> anyhow::Result<Arc<FilterOracle<MemDb, FakeChain, HonestPeer, NullBlocks>>> {
    FilterOracle::start(config, db, chain, peer, Arc::new(NullBlocks), checkpoints).await
}

/// A 13-block branch that shares heights 0..=6 with the fork-0 world.
fn reorged_world() -> World {
    let hashes = (0..=12u32)
        .map(|h| if h <= 6 { hash_at(h, 0) } else { hash_at(h, 1) })
        .collect();
    World::from_hashes(hashes)
}

#[tokio::test]
async fn startup_rolls_back_to_the_common_ancestor_after_a_reorg() -> anyhow::Result<()> {
    let old_world = World::generate(10, 0);
    let db = MemDb::new();
    let chain = FakeChain::new(&old_world);
    let peer = HonestPeer::new(&old_world);
    let checkpoints = CheckpointTable::for_network(Chain::Regtest, FilterType::Basic);

    {
        let oracle = start_oracle(
            config(),
            db.clone(),
            chain.clone(),
            peer.clone(),
            checkpoints.clone(),
        )
        .await?;
        assert_eq!(oracle.sync_to_tip().await?, old_world.position(10));
        oracle.shutdown();
    }

    // Heights 7..=10 get abandoned; the new branch extends to 12.
    let new_world = reorged_world();
    chain.apply(&new_world, 6);
    peer.set_world(&new_world);

    let oracle = start_oracle(config(), db.clone(), chain, peer, checkpoints).await?;

    // Startup reconciliation already moved both tips off the stale branch.
    assert_eq!(oracle.header_tip(FilterType::Basic).await?, Some(new_world.position(6)));
    assert_eq!(oracle.filter_tip(FilterType::Basic).await?, Some(new_world.position(6)));

    assert_eq!(oracle.sync_to_tip().await?, new_world.position(12));
    for height in 7..=12u32 {
        let stored = oracle
            .load_filter_header(FilterType::Basic, &new_world.hashes[height as usize])
            .await?;
        assert_eq!(stored, Some(new_world.headers[height as usize]));
        assert!(oracle
            .load_filter(FilterType::Basic, &new_world.hashes[height as usize])
            .await?
            .is_some());
    }

    oracle.shutdown();
    Ok(())
}

#[tokio::test]
async fn live_reorg_is_reconciled_on_the_next_sync() -> anyhow::Result<()> {
    let old_world = World::generate(10, 0);
    let db = MemDb::new();
    let chain = FakeChain::new(&old_world);
    let peer = HonestPeer::new(&old_world);

    let oracle = start_oracle(
        config(),
        db.clone(),
        chain.clone(),
        peer.clone(),
        CheckpointTable::for_network(Chain::Regtest, FilterType::Basic),
    )
    .await?;
    assert_eq!(oracle.sync_to_tip().await?, old_world.position(10));

    // The chain reorganizes under the running oracle, no restart involved.
    let new_world = reorged_world();
    chain.apply(&new_world, 6);
    peer.set_world(&new_world);

    assert_eq!(oracle.sync_to_tip().await?, new_world.position(12));

    // Every new-branch height below the tip is populated: headers chain from
    // the common ancestor and the bodies are present, no holes.
    for height in 7..=12u32 {
        let hash = new_world.hashes[height as usize];
        assert_eq!(
            oracle.load_filter_header(FilterType::Basic, &hash).await?,
            Some(new_world.headers[height as usize]),
            "header hole at height {height}"
        );
        assert!(
            oracle.load_filter(FilterType::Basic, &hash).await?.is_some(),
            "filter hole at height {height}"
        );
    }
    assert_eq!(oracle.filter_tip(FilterType::Basic).await?, Some(new_world.position(12)));

    oracle.shutdown();
    Ok(())
}

#[tokio::test]
async fn checkpoint_disagreement_rolls_back_to_the_last_agreeing_one() -> anyhow::Result<()> {
    use bitcoin::hashes::Hash as _;

    let world = World::generate(100, 0);
    let db = MemDb::new();
    let chain = FakeChain::new(&world);
    let peer = HonestPeer::new(&world);

    // First pass: sync honestly with only the (correct) height-50 checkpoint.
    {
        let table = CheckpointTable::from_entries(
            Chain::Regtest,
            FilterType::Basic,
            [(50, world.headers[50])],
        );
        let oracle =
            start_oracle(config(), db.clone(), chain.clone(), peer.clone(), table).await?;
        assert_eq!(oracle.sync_to_tip().await?, world.position(100));
        oracle.shutdown();
    }

    // Restart with a table whose height-100 entry contradicts what was
    // persisted. Startup must rewind to the last agreeing checkpoint.
    let poisoned = CheckpointTable::from_entries(
        Chain::Regtest,
        FilterType::Basic,
        [
            (50, world.headers[50]),
            (100, bitcoin::FilterHeader::from_byte_array([0xee; 32])),
        ],
    );
    let oracle = start_oracle(config(), db.clone(), chain, peer, poisoned).await?;

    assert_eq!(oracle.header_tip(FilterType::Basic).await?, Some(world.position(50)));
    assert_eq!(oracle.filter_tip(FilterType::Basic).await?, Some(world.position(50)));

    oracle.shutdown();
    Ok(())
}

#[tokio::test]
async fn mismatched_download_against_checkpoints_surfaces_after_rollbacks() -> anyhow::Result<()> {
    use bitcoin::hashes::Hash as _;

    let world = World::generate(60, 0);
    let db = MemDb::new();
    let chain = FakeChain::new(&world);
    let peer = HonestPeer::new(&world);

    // Every peer response disagrees with this table, so no amount of
    // rolling back helps; the mismatch must reach the caller.
    let table = CheckpointTable::from_entries(
        Chain::Regtest,
        FilterType::Basic,
        [(40, bitcoin::FilterHeader::from_byte_array([0xee; 32]))],
    );
    let oracle = start_oracle(config(), db.clone(), chain, peer, table).await?;

    let got = oracle.sync_to_tip().await;
    assert!(matches!(
        got,
        Err(OracleError::CheckpointMismatch { height: 40 })
    ));
    // Nothing past the disputed range was committed.
    assert_eq!(oracle.header_tip(FilterType::Basic).await?, None);

    oracle.shutdown();
    Ok(())
}

#[tokio::test]
async fn missing_filter_below_the_tip_rolls_back_to_the_parent() -> anyhow::Result<()> {
    let world = World::generate(10, 0);
    let db = MemDb::new();
    let chain = FakeChain::new(&world);
    let peer = HonestPeer::new(&world);
    let checkpoints = CheckpointTable::for_network(Chain::Regtest, FilterType::Basic);

    let oracle = start_oracle(config(), db.clone(), chain, peer, checkpoints).await?;
    oracle.sync_to_tip().await?;

    // Corrupt the store: drop the body at height 5 while the tip says 10.
    db.remove_filter(FilterType::Basic, &world.hashes[5]);

    let position = world.position(5);
    let got = oracle
        .load_filter_or_reset_tip(FilterType::Basic, &position)
        .await;
    assert!(matches!(got, Err(OracleError::MissingFilter(p)) if p == position));

    // Both tips were truncated to the parent of the hole.
    assert_eq!(oracle.header_tip(FilterType::Basic).await?, Some(world.position(4)));
    assert_eq!(oracle.filter_tip(FilterType::Basic).await?, Some(world.position(4)));

    // Above the tip there is no corruption, just absence.
    let beyond = BlockPosition::new(20, hash_at(20, 0));
    assert!(oracle
        .load_filter_or_reset_tip(FilterType::Basic, &beyond)
        .await?
        .is_none());

    oracle.shutdown();
    Ok(())
}
