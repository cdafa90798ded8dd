//! Per-height promise/future links enforcing in-order header chaining.
//!
//! Filter computation for different heights can run in parallel, but the
//! header for height `h` needs the header for `h-1`. Each job therefore gets
//! a receiver for its predecessor's header and a sender for its own; only the
//! chaining step serializes, not the whole computation.
use std::time::Duration;

use bitcoin::FilterHeader;
use tokio::sync::{oneshot, watch};

use crate::error::OracleError;

/// Upper bound on waiting for a predecessor header. A reset that drops the
/// chain is expected to surface well before this fires.
pub(crate) const LINK_WAIT: Duration = Duration::from_secs(30);

/// Build `count` consecutive links seeded with the header preceding the
/// range. `links[i]` holds the receiver for height `start + i - 1` and the
/// sender for height `start + i`.
pub(crate) fn header_links(
    seed: FilterHeader,
    count: usize,
) -> Vec<(oneshot::Receiver<FilterHeader>, oneshot::Sender<FilterHeader>)> {
    let (seed_tx, mut prev_rx) = oneshot::channel();
    let _ = seed_tx.send(seed);

    let mut links = Vec::with_capacity(count);
    for _ in 0..count {
        let (tx, rx) = oneshot::channel();
        links.push((std::mem::replace(&mut prev_rx, rx), tx));
    }
    links
}

/// Wait for the predecessor header with a bounded timeout, exiting promptly
/// on shutdown. A dropped sender means the chain was torn down by a reset.
pub(crate) async fn await_link(
    link: oneshot::Receiver<FilterHeader>,
    mut shutdown: watch::Receiver<bool>,
    height: u32,
) -> Result<FilterHeader, OracleError> {
    tokio::select! {
        header = link => header.map_err(|_| OracleError::Stale),
        changed = shutdown.changed() => {
            if changed.is_ok() && *shutdown.borrow() {
                Err(OracleError::Shutdown)
            } else {
                Err(OracleError::Stale)
            }
        }
        _ = tokio::time::sleep(LINK_WAIT) => Err(OracleError::ChainWait(height)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;

    fn header(byte: u8) -> FilterHeader {
        FilterHeader::from_byte_array([byte; 32])
    }

    #[tokio::test]
    async fn links_deliver_in_order() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let links = header_links(header(0), 3);

        let mut tasks = Vec::new();
        for (i, (rx, tx)) in links.into_iter().enumerate() {
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let prev = await_link(rx, shutdown, i as u32).await?;
                let own = header(prev.to_byte_array()[0] + 1);
                let _ = tx.send(own);
                Ok::<_, OracleError>(own)
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let own = task.await.unwrap().unwrap();
            assert_eq!(own, header(i as u8 + 1));
        }
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn dropped_predecessor_is_reported_stale() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut links = header_links(header(0), 2);
        let (rx, _tx) = links.pop().unwrap();
        drop(links); // drops the sender feeding `rx`

        let got = await_link(rx, shutdown_rx, 1).await;
        assert!(matches!(got, Err(OracleError::Stale)));
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_wait() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut links = header_links(header(0), 2);
        let (rx, _keepalive) = links.pop().unwrap();

        let waiter = tokio::spawn(await_link(rx, shutdown_rx, 1));
        shutdown_tx.send(true).unwrap();
        let got = waiter.await.unwrap();
        assert!(matches!(got, Err(OracleError::Shutdown)));
    }
}
