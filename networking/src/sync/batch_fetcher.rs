/// Per-peer batch fetching.
///
/// Every peer runs its own two-stage pipeline fed with peer slots. A slot is
/// permission to have one batch in flight on that peer:
///
/// 1. `BatchAssembler` turns a slot into a `Batch` by draining the shared
///    scheduler, lowest height first.
/// 2. `BatchFetcher` sends the batch as one `GetData`, waits for the blocks,
///    requeues whatever the peer failed to deliver, and hands the slot back
///    to the assembler with an adjusted batch size.
///
/// The number of slots seeded per peer bounds its concurrent batches. Once the
/// peer's dispatcher reports a disconnect, in-flight batches are requeued at
/// once and every slot is retired instead of handed back.
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    config::CatchupConfig, error::CatchupError, peer_manager::PeerManager,
    request::FetchRequest, scheduler::BlockFetchScheduler,
};
use crate::pipeline::{Emitter, Flow, Shutdown, Stage, Submitter};
use crate::types::{Message, Peer};

/// Capacity token for one in-flight batch on `peer`.
#[derive(Clone)]
pub struct PeerSlot {
    pub peer: Arc<dyn Peer>,
    pub max_batch_size: usize,
}

pub struct Batch {
    pub peer: Arc<dyn Peer>,
    pub requests: Vec<FetchRequest>,
    pub max_batch_size: usize,
}

pub struct BatchAssembler {
    scheduler: Arc<BlockFetchScheduler>,
    grace: Duration,
    disconnected: Shutdown,
}

impl BatchAssembler {
    pub fn new(scheduler: Arc<BlockFetchScheduler>, grace: Duration) -> Self {
        Self {
            scheduler,
            grace,
            disconnected: Shutdown::new(),
        }
    }

    /// Signal cancelled by the peer's dispatcher when the peer goes away.
    pub fn with_disconnect_signal(mut self, disconnected: Shutdown) -> Self {
        self.disconnected = disconnected;
        self
    }
}

#[async_trait]
impl Stage<PeerSlot, Batch> for BatchAssembler {
    async fn process(&self, slot: PeerSlot, out: &Emitter<Batch>) -> Result<Flow> {
        let peer_id = slot.peer.peer_id();
        let limit = slot.max_batch_size.max(1);

        if self.disconnected.is_cancelled() {
            debug!(peer = %peer_id, "Peer disconnected, retiring slot");
            return Ok(Flow::Continue);
        }

        // Lets more work pile up before committing to a batch.
        tokio::time::sleep(self.grace).await;

        let mut batch: Vec<FetchRequest> = Vec::with_capacity(limit);
        let mut skipped = Vec::new();

        loop {
            while batch.len() < limit {
                let next = if batch.is_empty() && skipped.is_empty() {
                    let popped = tokio::select! {
                        popped = self.scheduler.pop() => popped,
                        _ = self.disconnected.cancelled() => {
                            debug!(peer = %peer_id, "Peer disconnected, retiring slot");
                            return Ok(Flow::Continue);
                        }
                    };
                    match popped {
                        Some(request) => Some(request),
                        None => return Ok(Flow::Finish),
                    }
                } else {
                    self.scheduler.try_pop()
                };

                let Some(mut request) = next else {
                    break;
                };
                if request.is_done() {
                    continue;
                }
                if request.was_tried_by(&peer_id) {
                    skipped.push(request);
                } else {
                    request.peers_tried.insert(peer_id);
                    batch.push(request);
                }
            }

            let generation = self.scheduler.requeue(skipped.drain(..));
            if !batch.is_empty() {
                break;
            }

            debug!(peer = %peer_id, "Only already tried blocks queued, waiting for new work");
            let pushed = tokio::select! {
                pushed = self.scheduler.wait_for_push(generation) => pushed,
                _ = self.disconnected.cancelled() => {
                    debug!(peer = %peer_id, "Peer disconnected, retiring slot");
                    return Ok(Flow::Continue);
                }
            };
            if !pushed {
                return Ok(Flow::Finish);
            }
        }

        debug!(peer = %peer_id, size = batch.len(), limit, "Assembled block batch");
        out.emit(Batch {
            peer: slot.peer,
            requests: batch,
            max_batch_size: limit,
        })
        .await?;

        Ok(Flow::Continue)
    }
}

pub struct BatchFetcher {
    config: CatchupConfig,
    scheduler: Arc<BlockFetchScheduler>,
    peers: Arc<Mutex<PeerManager>>,
    slots: Submitter<PeerSlot>,
    disconnected: Shutdown,
    metrics: Option<SharedMetrics>,
}

impl BatchFetcher {
    pub fn new(
        config: CatchupConfig,
        scheduler: Arc<BlockFetchScheduler>,
        peers: Arc<Mutex<PeerManager>>,
        slots: Submitter<PeerSlot>,
    ) -> Self {
        Self {
            config,
            scheduler,
            peers,
            slots,
            disconnected: Shutdown::new(),
            metrics: None,
        }
    }

    /// Signal cancelled by the peer's dispatcher when the peer goes away.
    pub fn with_disconnect_signal(mut self, disconnected: Shutdown) -> Self {
        self.disconnected = disconnected;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// `false` if the batch timed out or the peer disconnected first.
    async fn wait_for_batch(&self, requests: &[FetchRequest]) -> bool {
        let waits = join_all(requests.iter().map(|request| request.signal.wait()));
        let bounded = async {
            match self.config.batch_timeout() {
                Some(limit) => tokio::time::timeout(limit, waits).await.is_ok(),
                None => {
                    waits.await;
                    true
                }
            }
        };
        tokio::select! {
            settled = bounded => settled,
            _ = self.disconnected.cancelled() => false,
        }
    }

    /// Push undelivered requests back, failing the run for any block no
    /// connected peer is left to try.
    fn requeue(&self, peer_label: &str, undelivered: Vec<FetchRequest>) -> Result<()> {
        if undelivered.is_empty() {
            return Ok(());
        }

        {
            let peers = self.peers.lock();
            if let Some(request) = undelivered
                .iter()
                .find(|request| peers.all_tried(&request.peers_tried))
            {
                return Err(CatchupError::BlockUnavailable {
                    hash: request.hash(),
                    height: request.priority,
                }
                .into());
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.inc_requests_requeued(peer_label, undelivered.len() as u64);
        }
        self.scheduler.requeue(undelivered);
        Ok(())
    }
}

#[async_trait]
impl Stage<Batch, ()> for BatchFetcher {
    async fn process(&self, batch: Batch, _out: &Emitter<()>) -> Result<Flow> {
        let Batch {
            peer,
            requests,
            max_batch_size,
        } = batch;
        let peer_id = peer.peer_id();
        let peer_label = peer_id.to_string();

        if self.disconnected.is_cancelled() {
            debug!(peer = %peer_id, size = requests.len(), "Peer disconnected, returning batch");
            let undelivered = requests
                .into_iter()
                .filter(|request| !request.is_done())
                .collect();
            self.requeue(&peer_label, undelivered)?;
            return Ok(Flow::Continue);
        }

        self.peers.lock().on_batch_start(&peer_id);
        debug!(peer = %peer_id, size = requests.len(), "Requesting block batch");
        peer.send_message(Message::get_blocks(requests.iter().map(FetchRequest::hash)));
        if let Some(metrics) = &self.metrics {
            metrics.inc_batches_sent(&peer_label);
        }

        let started = Instant::now();
        let settled = self.wait_for_batch(&requests).await;
        let elapsed = started.elapsed();

        let undelivered: Vec<FetchRequest> = requests
            .into_iter()
            .filter(|request| !request.is_done())
            .collect();
        let missed = undelivered.len();

        self.peers
            .lock()
            .on_batch_complete(&peer_id, missed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_batch_latency(elapsed.as_secs_f64());
        }

        let disconnected = self.disconnected.is_cancelled();
        if !undelivered.is_empty() {
            warn!(
                peer = %peer_id,
                missed,
                timed_out = !settled && !disconnected,
                disconnected,
                "Peer did not deliver every block, requeueing"
            );
        }
        self.requeue(&peer_label, undelivered)?;

        if disconnected {
            debug!(peer = %peer_id, "Peer disconnected, retiring slot");
            return Ok(Flow::Continue);
        }

        let next_size = self
            .config
            .next_batch_size(max_batch_size, elapsed, missed);
        if next_size != max_batch_size {
            debug!(peer = %peer_id, from = max_batch_size, to = next_size, "Adjusted batch size");
        }

        let slot = PeerSlot {
            peer,
            max_batch_size: next_size,
        };
        if self.slots.submit(slot).await.is_err() {
            debug!(peer = %peer_id, "Batch assembler gone, retiring peer slot");
            return Ok(Flow::Finish);
        }

        Ok(Flow::Continue)
    }
}
