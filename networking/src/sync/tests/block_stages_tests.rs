use std::sync::Arc;

use containers::devnet::generate_chain;
use pretty_assertions::assert_eq;

use super::{TEST_TIMEOUT, hashes_of};
use crate::pipeline::{PipelineBuilder, Shutdown, StageConfig};
use crate::sync::{
    BlockFetchScheduler, CompletionWaiter, FetchRequestFactory, HeaderRange, PendingBlockIndex,
};

fn indexes() -> (Arc<BlockFetchScheduler>, Arc<PendingBlockIndex>) {
    (
        Arc::new(BlockFetchScheduler::new()),
        Arc::new(PendingBlockIndex::new()),
    )
}

#[tokio::test]
async fn test_factory_schedules_each_height_once() {
    let blocks = generate_chain(4, 1);
    let (scheduler, pending) = indexes();

    let mut pipeline = PipelineBuilder::new(
        Shutdown::new(),
        StageConfig::named("fetch_requests"),
        FetchRequestFactory::new(scheduler.clone(), pending.clone()),
    )
    .build();
    pipeline
        .submit(HeaderRange {
            start_height: 1,
            hashes: hashes_of(&blocks[1..]),
        })
        .await
        .unwrap();

    let mut heights = Vec::new();
    for _ in 0..3 {
        let pending_block = pipeline.receive().await.unwrap();
        assert!(pending.get(&pending_block.signal.hash()).is_some());
        heights.push(pending_block.height);
    }
    assert_eq!(heights, vec![1, 2, 3]);

    let priorities: Vec<u64> = std::iter::from_fn(|| scheduler.try_pop())
        .map(|request| request.priority)
        .collect();
    assert_eq!(priorities, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_factory_skips_heights_below_minimum() {
    let blocks = generate_chain(6, 2);
    let (scheduler, pending) = indexes();

    let mut pipeline = PipelineBuilder::new(
        Shutdown::new(),
        StageConfig::named("fetch_requests"),
        FetchRequestFactory::new(scheduler.clone(), pending.clone()).with_min_height(4),
    )
    .build();
    pipeline
        .submit(HeaderRange {
            start_height: 0,
            hashes: hashes_of(&blocks),
        })
        .await
        .unwrap();

    assert_eq!(pipeline.receive().await.map(|block| block.height), Some(4));
    assert_eq!(pipeline.receive().await.map(|block| block.height), Some(5));
    assert_eq!(scheduler.len(), 2);
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn test_factory_does_not_reschedule_resolved_blocks() {
    let blocks = generate_chain(3, 3);
    let (scheduler, pending) = indexes();
    pending
        .signal_for(blocks[1].hash())
        .resolve(Arc::new(blocks[1].clone()));

    let mut pipeline = PipelineBuilder::new(
        Shutdown::new(),
        StageConfig::named("fetch_requests"),
        FetchRequestFactory::new(scheduler.clone(), pending.clone()),
    )
    .build();
    pipeline
        .submit(HeaderRange {
            start_height: 1,
            hashes: hashes_of(&blocks[1..]),
        })
        .await
        .unwrap();

    let first = pipeline.receive().await.unwrap();
    assert!(first.signal.is_resolved());
    pipeline.receive().await.unwrap();

    assert_eq!(scheduler.len(), 1);
    assert_eq!(scheduler.try_pop().map(|request| request.priority), Some(2));
}

#[tokio::test]
async fn test_waiter_delivers_in_height_order() {
    let blocks = generate_chain(5, 4);
    let (scheduler, pending) = indexes();

    let mut pipeline = PipelineBuilder::new(
        Shutdown::new(),
        StageConfig::named("fetch_requests"),
        FetchRequestFactory::new(scheduler.clone(), pending.clone()),
    )
    .then(
        StageConfig::named("completion_waiter").capacity(100),
        CompletionWaiter::new(pending.clone()),
    )
    .build();
    pipeline
        .submit(HeaderRange {
            start_height: 1,
            hashes: hashes_of(&blocks[1..]),
        })
        .await
        .unwrap();

    // Blocks arrive newest first.
    for block in blocks[1..].iter().rev() {
        let signal = loop {
            if let Some(signal) = pending.get(&block.hash()) {
                break signal;
            }
            tokio::task::yield_now().await;
        };
        signal.resolve(Arc::new(block.clone()));
    }

    let mut delivered = Vec::new();
    for _ in 1..blocks.len() {
        let block = tokio::time::timeout(TEST_TIMEOUT, pipeline.receive())
            .await
            .unwrap()
            .unwrap();
        delivered.push((block.height, block.hash()));
    }

    let expected: Vec<_> = blocks
        .iter()
        .enumerate()
        .skip(1)
        .map(|(height, block)| (height as u64, block.hash()))
        .collect();
    assert_eq!(delivered, expected);
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_waiter_stops_quietly_on_cancelled_signal() {
    let blocks = generate_chain(2, 5);
    let (scheduler, pending) = indexes();
    let shutdown = Shutdown::new();

    let mut pipeline = PipelineBuilder::new(
        shutdown.clone(),
        StageConfig::named("fetch_requests"),
        FetchRequestFactory::new(scheduler, pending.clone()),
    )
    .then(
        StageConfig::named("completion_waiter"),
        CompletionWaiter::new(pending.clone()),
    )
    .build();
    pipeline
        .submit(HeaderRange {
            start_height: 1,
            hashes: hashes_of(&blocks[1..]),
        })
        .await
        .unwrap();

    while pending.is_empty() {
        tokio::task::yield_now().await;
    }
    pending.cancel_all();

    let received = tokio::time::timeout(TEST_TIMEOUT, pipeline.receive())
        .await
        .unwrap();
    assert_eq!(received, None);
    assert!(shutdown.take_failure().is_none());
}
