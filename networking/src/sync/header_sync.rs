/// Header synchronization stage.
///
/// Drives the local header chain forward against one peer: ask for headers
/// after our locator, hand them to the chain view, and emit the range of
/// heights that became confirmed. Exactly one `getheaders` is in flight at a
/// time. The stage finishes the block pipeline once the chain view accepts no
/// more headers (caught up, or no progress possible).
///
/// ## Initial header workaround
///
/// Peers answer a locator that only names the initial block with the headers
/// *after* it, so a chain that does not hold the initial header yet could
/// never connect them. In that one case the stage fetches the initial block
/// through the scheduler, waits for it, and prepends its header before
/// extending. This is deliberately limited to the initial block; any other
/// missing ancestor is a rejection.
///
/// ## Reorganizations
///
/// A longer competing branch that forks below a height this run already
/// emitted would hand those heights out a second time. The stage fails the
/// run with `UnexpectedState` instead.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chain::SharedChainView;
use containers::{Block, BlockHeader, Bytes32};
use metrics::SharedMetrics;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info};

use super::{
    error::CatchupError,
    pending::PendingBlockIndex,
    request::{FetchRequest, HeaderRange},
    scheduler::BlockFetchScheduler,
};
use crate::pipeline::{Emitter, Flow, Stage};
use crate::types::{Message, Peer};

/// Input of the header stage: which peer to follow and which chain to extend.
#[derive(Clone)]
pub struct HeaderSyncJob {
    pub peer: Arc<dyn Peer>,
    pub chain: SharedChainView,
}

pub struct HeaderSync {
    headers: AsyncMutex<mpsc::UnboundedReceiver<Vec<BlockHeader>>>,
    scheduler: Arc<BlockFetchScheduler>,
    pending: Arc<PendingBlockIndex>,
    hash_stop: Bytes32,
    min_height: u64,
    metrics: Option<SharedMetrics>,
}

impl HeaderSync {
    pub fn new(
        headers: mpsc::UnboundedReceiver<Vec<BlockHeader>>,
        scheduler: Arc<BlockFetchScheduler>,
        pending: Arc<PendingBlockIndex>,
    ) -> Self {
        Self {
            headers: AsyncMutex::new(headers),
            scheduler,
            pending,
            hash_stop: Bytes32::ZERO,
            min_height: 0,
            metrics: None,
        }
    }

    pub fn with_hash_stop(mut self, hash_stop: Bytes32) -> Self {
        self.hash_stop = hash_stop;
        self
    }

    pub fn with_min_height(mut self, min_height: u64) -> Self {
        self.min_height = min_height;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// One request/response round. Returns `None` once the chain view
    /// rejects the peer's headers.
    async fn sync_round(
        &self,
        job: &HeaderSyncJob,
        headers_rx: &mut mpsc::UnboundedReceiver<Vec<BlockHeader>>,
    ) -> Result<Option<HeaderRange>> {
        let peer_id = job.peer.peer_id();
        let (locator, last_height) = {
            let chain = job.chain.lock();
            (chain.locator_hashes(), chain.last_height())
        };

        debug!(peer = %peer_id, last_height = ?last_height, "Requesting headers");
        job.peer
            .send_message(Message::get_headers(locator.clone(), self.hash_stop));
        if let Some(metrics) = &self.metrics {
            metrics.inc_header_requests();
        }

        let mut headers = headers_rx
            .recv()
            .await
            .ok_or(CatchupError::PeerDisconnected(peer_id))?;

        if let Some(parent) = missing_initial_header(&job.chain, &locator, &headers) {
            let initial = self.fetch_initial_block(parent).await?;
            headers.insert(0, initial.header.clone());
        }

        let range = {
            let mut chain = job.chain.lock();
            let Some(start_height) = chain.extend(&headers) else {
                info!(
                    peer = %peer_id,
                    received = headers.len(),
                    last_height = ?chain.last_height(),
                    "Header chain accepted no more headers"
                );
                return Ok(None);
            };

            let tip = chain.last_height().ok_or_else(|| {
                CatchupError::UnexpectedState("extended chain reports no tip".to_string())
            })?;
            if tip < start_height {
                return Err(CatchupError::UnexpectedState(format!(
                    "extension starts at {start_height} above tip {tip}"
                ))
                .into());
            }

            let hashes = (start_height..=tip)
                .map(|height| {
                    chain.identity_at_height(height).ok_or_else(|| {
                        CatchupError::UnexpectedState(format!("no header at height {height}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            HeaderRange {
                start_height,
                hashes,
            }
        };

        if let Some((metrics, tip)) = self.metrics.as_ref().zip(range.end_height()) {
            metrics.set_header_height(tip as i64);
        }
        debug!(
            peer = %peer_id,
            start_height = range.start_height,
            count = range.hashes.len(),
            "Header chain extended"
        );

        Ok(Some(range))
    }

    async fn fetch_initial_block(&self, hash: Bytes32) -> Result<Arc<Block>> {
        info!(%hash, "Peer omitted the initial header, fetching the initial block");

        let signal = self.pending.signal_for(hash);
        self.scheduler.push(FetchRequest::new(0, signal.clone()));
        let block = signal.wait().await.map_err(|_| CatchupError::Cancelled)?;

        // Below the fetch floor the factory never consumes this entry.
        if self.min_height > 0 {
            self.pending.remove(&hash);
        }
        Ok(block)
    }
}

/// Parent hash to fetch when the response skipped the initial header the
/// chain still lacks.
fn missing_initial_header(
    chain: &SharedChainView,
    locator: &[Bytes32],
    headers: &[BlockHeader],
) -> Option<Bytes32> {
    let chain = chain.lock();
    let initial = chain.initial_block_hash();
    let first = headers.first()?;

    (locator.last() == Some(&initial)
        && first.previous_block_hash == initial
        && chain.identity_at_height(0).is_none())
    .then_some(initial)
}

#[async_trait]
impl Stage<HeaderSyncJob, HeaderRange> for HeaderSync {
    async fn process(&self, job: HeaderSyncJob, out: &Emitter<HeaderRange>) -> Result<Flow> {
        let mut headers_rx = self.headers.lock().await;
        let mut emitted_tip: Option<u64> = None;
        loop {
            let Some(range) = self.sync_round(&job, &mut headers_rx).await? else {
                return Ok(Flow::Finish);
            };

            if let Some(tip) = emitted_tip.filter(|tip| range.start_height <= *tip) {
                return Err(CatchupError::UnexpectedState(format!(
                    "header chain reorganized at height {} below emitted height {tip}",
                    range.start_height
                ))
                .into());
            }
            emitted_tip = range.end_height().or(emitted_tip);
            out.emit(range).await?;
        }
    }
}
