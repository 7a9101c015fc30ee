use std::sync::Arc;

use chain::{ChainView, HeaderChain};
use containers::devnet::generate_chain;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use super::{TEST_TIMEOUT, fast_config, hashes_of, shared_chain};
use crate::loopback::LoopbackPeer;
use crate::sync::{BlockCatchup, CatchupConfig, CatchupError, CatchupState, DeliveredBlock};
use crate::types::{Message, Peer};

async fn collect(catchup: &mut crate::sync::Catchup) -> Result<Vec<DeliveredBlock>, CatchupError> {
    let mut delivered = Vec::new();
    while let Some(block) = tokio::time::timeout(TEST_TIMEOUT, catchup.next_block())
        .await
        .expect("catch-up stalled")?
    {
        delivered.push(block);
    }
    Ok(delivered)
}

fn heights(blocks: &[DeliveredBlock]) -> Vec<u64> {
    blocks.iter().map(|block| block.height).collect()
}

#[tokio::test]
async fn test_catchup_from_genesis_delivers_in_order() {
    let blocks = generate_chain(4, 1);
    let (chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));

    let mut catchup = BlockCatchup::new(fast_config(), view, peer.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(catchup.state(), CatchupState::Syncing);

    let delivered = collect(&mut catchup).await.unwrap();
    assert_eq!(heights(&delivered), vec![1, 2, 3]);
    let hashes: Vec<_> = delivered.iter().map(DeliveredBlock::hash).collect();
    assert_eq!(hashes, hashes_of(&blocks[1..]));

    assert_eq!(catchup.state(), CatchupState::Synced);
    assert_eq!(chain.lock().last_height(), Some(3));
    let header_requests = peer
        .sent()
        .iter()
        .filter(|message| matches!(message, Message::GetHeaders { .. }))
        .count();
    assert_eq!(header_requests, 2);

    // A finished run stays finished.
    assert!(catchup.next_block().await.unwrap().is_none());
}

#[tokio::test]
async fn test_catchup_recovers_omitted_initial_block() {
    let blocks = generate_chain(6, 2);
    let (chain, view) = shared_chain(HeaderChain::new(blocks[0].hash()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));

    let mut catchup = BlockCatchup::new(fast_config(), view, peer)
        .start()
        .await
        .unwrap();
    let delivered = collect(&mut catchup).await.unwrap();

    assert_eq!(heights(&delivered), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(delivered[0].hash(), blocks[0].hash());
    assert_eq!(chain.lock().identity_at_height(0), Some(blocks[0].hash()));
}

#[tokio::test]
async fn test_catchup_respects_min_height() {
    let blocks = generate_chain(8, 3);
    let (_chain, view) = shared_chain(HeaderChain::new(blocks[0].hash()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));
    let config = CatchupConfig {
        min_height: 5,
        ..fast_config()
    };

    let mut catchup = BlockCatchup::new(config, view, peer.clone())
        .start()
        .await
        .unwrap();
    let delivered = collect(&mut catchup).await.unwrap();

    assert_eq!(heights(&delivered), vec![5, 6, 7]);
    let requested: Vec<_> = peer.requested_batches().into_iter().flatten().collect();
    assert!(!requested.contains(&blocks[3].hash()));
}

#[tokio::test]
async fn test_catchup_follows_several_header_rounds() {
    let blocks = generate_chain(30, 4);
    let (chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()).with_headers_per_message(7));

    let mut catchup = BlockCatchup::new(fast_config(), view, peer)
        .start()
        .await
        .unwrap();
    let delivered = collect(&mut catchup).await.unwrap();

    assert_eq!(heights(&delivered), (1..30).collect::<Vec<u64>>());
    assert_eq!(chain.lock().last_height(), Some(29));
}

#[tokio::test]
async fn test_catchup_combines_peers_with_disjoint_blocks() {
    let blocks = generate_chain(21, 5);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));

    let odd_missing = Arc::new(LoopbackPeer::new(blocks.clone()));
    odd_missing.withhold(blocks.iter().skip(1).step_by(2).map(|block| block.hash()));
    let even_missing = Arc::new(LoopbackPeer::new(blocks.clone()));
    even_missing.withhold(blocks.iter().step_by(2).map(|block| block.hash()));

    let config = CatchupConfig {
        initial_batch_size: 4,
        batch_timeout_ms: Some(50),
        ..fast_config()
    };
    let mut catchup = BlockCatchup::new(config, view, odd_missing.clone())
        .with_peer(even_missing.clone())
        .start()
        .await
        .unwrap();
    let delivered = collect(&mut catchup).await.unwrap();

    assert_eq!(heights(&delivered), (1..21).collect::<Vec<u64>>());
    let hashes: Vec<_> = delivered.iter().map(DeliveredBlock::hash).collect();
    assert_eq!(hashes, hashes_of(&blocks[1..]));

    // A peer is never asked twice for a block it failed to deliver.
    for (peer, withheld) in [
        (&odd_missing, blocks.iter().skip(1).step_by(2).collect::<Vec<_>>()),
        (&even_missing, blocks.iter().step_by(2).collect::<Vec<_>>()),
    ] {
        let requested: Vec<_> = peer.requested_batches().into_iter().flatten().collect();
        for block in withheld {
            let asks = requested.iter().filter(|hash| **hash == block.hash()).count();
            assert!(asks <= 1, "block requested {asks} times from the same peer");
        }
    }
    assert_eq!(catchup.peers().len(), 2);
}

#[tokio::test]
async fn test_catchup_as_stream() {
    let blocks = generate_chain(5, 6);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));

    let catchup = BlockCatchup::new(fast_config(), view, peer)
        .start()
        .await
        .unwrap();
    let delivered: Vec<_> = tokio::time::timeout(TEST_TIMEOUT, catchup.into_stream().collect::<Vec<_>>())
        .await
        .unwrap();

    let heights: Vec<u64> = delivered
        .into_iter()
        .map(|block| block.unwrap().height)
        .collect();
    assert_eq!(heights, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_catchup_fails_when_no_peer_has_block() {
    let blocks = generate_chain(5, 7);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));
    peer.withhold([blocks[3].hash()]);

    let config = CatchupConfig {
        batch_timeout_ms: Some(50),
        ..fast_config()
    };
    let mut catchup = BlockCatchup::new(config, view, peer)
        .start()
        .await
        .unwrap();

    let mut delivered = Vec::new();
    let failure = loop {
        match tokio::time::timeout(TEST_TIMEOUT, catchup.next_block())
            .await
            .unwrap()
        {
            Ok(Some(block)) => delivered.push(block.height),
            Ok(None) => panic!("catch-up finished without block 3"),
            Err(err) => break err,
        }
    };

    assert!(matches!(failure, CatchupError::BlockUnavailable { height: 3, .. }));
    assert!(delivered.iter().all(|height| *height < 3));
    assert_eq!(catchup.state(), CatchupState::Failed);
}

#[tokio::test]
async fn test_catchup_fails_when_header_peer_disconnects() {
    let blocks = generate_chain(5, 8);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks));
    peer.disconnect();

    let mut catchup = BlockCatchup::new(fast_config(), view, peer.clone())
        .start()
        .await
        .unwrap();
    let failure = tokio::time::timeout(TEST_TIMEOUT, catchup.next_block())
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(failure, CatchupError::PeerDisconnected(id) if id == peer.peer_id()));
    assert_eq!(catchup.state(), CatchupState::Failed);
}

#[tokio::test]
async fn test_cancel_stops_run() {
    let blocks = generate_chain(5, 9);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));
    peer.withhold(hashes_of(&blocks));

    let config = CatchupConfig {
        batch_timeout_ms: None,
        ..fast_config()
    };
    let mut catchup = BlockCatchup::new(config, view, peer)
        .start()
        .await
        .unwrap();

    catchup.cancel();
    assert_eq!(catchup.state(), CatchupState::Failed);
    assert!(matches!(catchup.next_block().await, Err(CatchupError::Cancelled)));
    assert!(catchup.next_block().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_stream_ends_with_cancelled_error() {
    let blocks = generate_chain(5, 10);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let peer = Arc::new(LoopbackPeer::new(blocks.clone()));
    peer.withhold(hashes_of(&blocks));

    let mut catchup = BlockCatchup::new(fast_config(), view, peer)
        .start()
        .await
        .unwrap();
    catchup.cancel();

    let outcomes: Vec<_> = catchup.into_stream().collect().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], Err(CatchupError::Cancelled)));
}

#[tokio::test]
async fn test_catchup_continues_after_secondary_peer_disconnects() {
    let blocks = generate_chain(9, 11);
    let (_chain, view) = shared_chain(HeaderChain::from_genesis(blocks[0].header.clone()));
    let header_peer = Arc::new(LoopbackPeer::new(blocks.clone()));
    let departed = Arc::new(LoopbackPeer::new(blocks.clone()));
    departed.disconnect();

    let config = CatchupConfig {
        initial_batch_size: 2,
        batch_timeout_ms: None,
        ..fast_config()
    };
    let mut catchup = BlockCatchup::new(config, view, header_peer.clone())
        .with_peer(departed.clone())
        .start()
        .await
        .unwrap();
    let delivered = collect(&mut catchup).await.unwrap();

    assert_eq!(heights(&delivered), (1..9).collect::<Vec<u64>>());
    assert_eq!(catchup.state(), CatchupState::Synced);

    let departed_stats = catchup.peer(&departed.peer_id()).unwrap();
    assert!(!departed_stats.is_connected());
    assert_eq!(departed_stats.batches_in_flight, 0);
    assert_eq!(departed_stats.blocks_delivered, 0);
    let header_stats = catchup.peer(&header_peer.peer_id()).unwrap();
    assert_eq!(header_stats.blocks_delivered, 8);
}
