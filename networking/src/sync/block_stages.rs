/// Block pipeline stages downstream of header sync.
///
/// `FetchRequestFactory` turns each confirmed header range into scheduled
/// fetches plus one pending entry per height. `CompletionWaiter` then waits
/// on those entries strictly in the order they arrive, which keeps delivery
/// in height order no matter which peer answers first.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use metrics::SharedMetrics;
use tracing::{debug, info, trace};

use super::{
    pending::PendingBlockIndex,
    request::{DeliveredBlock, FetchRequest, HeaderRange, PendingBlock},
    scheduler::BlockFetchScheduler,
};
use crate::pipeline::{Emitter, Flow, Stage};

pub struct FetchRequestFactory {
    scheduler: Arc<BlockFetchScheduler>,
    pending: Arc<PendingBlockIndex>,
    min_height: u64,
    metrics: Option<SharedMetrics>,
}

impl FetchRequestFactory {
    pub fn new(scheduler: Arc<BlockFetchScheduler>, pending: Arc<PendingBlockIndex>) -> Self {
        Self {
            scheduler,
            pending,
            min_height: 0,
            metrics: None,
        }
    }

    /// Heights below `min_height` are neither fetched nor delivered.
    pub fn with_min_height(mut self, min_height: u64) -> Self {
        self.min_height = min_height;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[async_trait]
impl Stage<HeaderRange, PendingBlock> for FetchRequestFactory {
    async fn process(&self, range: HeaderRange, out: &Emitter<PendingBlock>) -> Result<Flow> {
        info!(
            start_height = range.start_height,
            count = range.hashes.len(),
            "Got new headers, scheduling block fetches"
        );

        for (height, hash) in range.iter() {
            if height < self.min_height {
                continue;
            }

            // Reuses the signal of an in-flight or already fetched block.
            let signal = self.pending.signal_for(hash);
            if !signal.is_done() {
                self.scheduler.push(FetchRequest::new(height, signal.clone()));
            }

            if let Some(metrics) = &self.metrics {
                metrics.set_pending_blocks(self.pending.len() as i64);
                metrics.set_scheduler_depth(self.scheduler.len() as i64);
            }

            out.emit(PendingBlock { height, signal }).await?;
        }

        Ok(Flow::Continue)
    }
}

pub struct CompletionWaiter {
    pending: Arc<PendingBlockIndex>,
    metrics: Option<SharedMetrics>,
}

impl CompletionWaiter {
    pub fn new(pending: Arc<PendingBlockIndex>) -> Self {
        Self {
            pending,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[async_trait]
impl Stage<PendingBlock, DeliveredBlock> for CompletionWaiter {
    async fn process(&self, pending: PendingBlock, out: &Emitter<DeliveredBlock>) -> Result<Flow> {
        let PendingBlock { height, signal } = pending;
        let Ok(block) = signal.wait().await else {
            debug!(height, hash = %signal.hash(), "Pending block cancelled, stopping");
            return Ok(Flow::Finish);
        };

        self.pending.remove(&signal.hash());
        trace!(height, hash = %signal.hash(), "Block ready");
        if let Some(metrics) = &self.metrics {
            metrics.inc_blocks_delivered();
            metrics.set_pending_blocks(self.pending.len() as i64);
        }

        out.emit(DeliveredBlock { height, block }).await?;
        Ok(Flow::Continue)
    }
}
