/// Catch-up orchestration.
///
/// Wires the pieces of one catch-up run together:
///
/// ```text
///   header peer ──► HeaderSync ──► FetchRequestFactory ──► CompletionWaiter ──► caller
///                                        │ push                    ▲ resolve
///                                        ▼                         │
///                               BlockFetchScheduler       PendingBlockIndex
///                                        │ pop                     ▲
///   every peer:  PeerSlot ──► BatchAssembler ──► BatchFetcher ─────┘ (via dispatcher)
///                   ▲                                 │
///                   └────────── slot returned ────────┘
/// ```
///
/// The caller pulls blocks with [`Catchup::next_block`] (or the stream from
/// [`Catchup::into_stream`]); they arrive in height order.
use std::collections::HashSet;
use std::sync::Arc;

use chain::SharedChainView;
use futures::Stream;
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    batch_fetcher::{BatchAssembler, BatchFetcher, PeerSlot},
    block_stages::{CompletionWaiter, FetchRequestFactory},
    config::CatchupConfig,
    dispatcher::EventDispatcher,
    error::CatchupError,
    header_sync::{HeaderSync, HeaderSyncJob},
    peer_manager::{PeerManager, SyncPeer},
    pending::PendingBlockIndex,
    request::DeliveredBlock,
    scheduler::BlockFetchScheduler,
    states::CatchupState,
};
use crate::pipeline::{Pipeline, PipelineBuilder, Shutdown, StageConfig};
use crate::types::{ConnectionState, Peer};

/// Builder for a catch-up run.
pub struct BlockCatchup {
    config: CatchupConfig,
    chain: SharedChainView,
    header_peer: Arc<dyn Peer>,
    extra_peers: Vec<Arc<dyn Peer>>,
    metrics: Option<SharedMetrics>,
}

impl BlockCatchup {
    /// `header_peer` serves headers and blocks; peers added with
    /// [`with_peer`](Self::with_peer) only serve blocks.
    pub fn new(config: CatchupConfig, chain: SharedChainView, header_peer: Arc<dyn Peer>) -> Self {
        Self {
            config,
            chain,
            header_peer,
            extra_peers: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_peer(mut self, peer: Arc<dyn Peer>) -> Self {
        self.extra_peers.push(peer);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn every stage and dispatcher, then start header sync.
    pub async fn start(self) -> Result<Catchup, CatchupError> {
        let BlockCatchup {
            config,
            chain,
            header_peer,
            extra_peers,
            metrics,
        } = self;

        let shutdown = Shutdown::new();
        let scheduler = Arc::new(BlockFetchScheduler::new());
        let pending = Arc::new(PendingBlockIndex::new());
        let peers = Arc::new(Mutex::new(PeerManager::new()));
        let (headers_tx, headers_rx) = mpsc::unbounded_channel();

        let blocks = PipelineBuilder::new(
            shutdown.clone(),
            StageConfig::named("header_sync"),
            HeaderSync::new(headers_rx, scheduler.clone(), pending.clone())
                .with_hash_stop(config.hash_stop)
                .with_min_height(config.min_height)
                .with_metrics(metrics.clone()),
        )
        .then(
            StageConfig::named("fetch_requests").capacity(config.factory_queue_capacity),
            FetchRequestFactory::new(scheduler.clone(), pending.clone())
                .with_min_height(config.min_height)
                .with_metrics(metrics.clone()),
        )
        .then(
            StageConfig::named("completion_waiter").capacity(config.waiter_queue_capacity),
            CompletionWaiter::new(pending.clone()).with_metrics(metrics.clone()),
        )
        .build();

        let mut catchup = Catchup {
            blocks,
            fetchers: Vec::new(),
            dispatchers: JoinSet::new(),
            scheduler,
            pending,
            peers,
            shutdown,
            state: CatchupState::default(),
            cancel_unreported: false,
        };

        catchup
            .blocks
            .submit(HeaderSyncJob {
                peer: header_peer.clone(),
                chain,
            })
            .await?;

        let tokens = config.tokens_per_peer.max(1);
        let mut dispatchers = Vec::new();
        let mut seen = HashSet::new();
        let all_peers = std::iter::once(header_peer).chain(extra_peers);

        for (index, peer) in all_peers.enumerate() {
            let peer_id = peer.peer_id();
            if !seen.insert(peer_id) {
                warn!(peer = %peer_id, "Peer added twice, ignoring duplicate");
                continue;
            }
            catchup
                .peers
                .lock()
                .add_peer(peer_id, ConnectionState::Connected);

            let disconnected = Shutdown::new();
            let builder = PipelineBuilder::new(
                catchup.shutdown.clone(),
                StageConfig::named("batch_assembler").capacity(tokens),
                BatchAssembler::new(catchup.scheduler.clone(), config.batch_grace())
                    .with_disconnect_signal(disconnected.clone()),
            );
            let fetcher = BatchFetcher::new(
                config.clone(),
                catchup.scheduler.clone(),
                catchup.peers.clone(),
                builder.submitter(),
            )
            .with_disconnect_signal(disconnected.clone())
            .with_metrics(metrics.clone());
            let fetch_pipeline = builder
                .then(
                    StageConfig::named("batch_fetcher")
                        .workers(tokens)
                        .capacity(tokens),
                    fetcher,
                )
                .build();

            for _ in 0..tokens {
                fetch_pipeline
                    .submit(PeerSlot {
                        peer: peer.clone(),
                        max_batch_size: config.initial_batch_size.max(1),
                    })
                    .await?;
            }
            catchup.fetchers.push(fetch_pipeline);

            let mut dispatcher = EventDispatcher::new(
                peer.clone(),
                catchup.pending.clone(),
                catchup.peers.clone(),
            )
            .with_disconnect_signal(disconnected)
            .with_metrics(metrics.clone());
            if index == 0 {
                dispatcher = dispatcher.with_headers(headers_tx.clone());
            }
            dispatchers.push(dispatcher);
        }

        // Nothing can fail before the dispatchers start reading.
        for dispatcher in dispatchers {
            catchup
                .dispatchers
                .spawn(dispatcher.run(catchup.shutdown.clone()));
        }
        // The header dispatcher holds the only sender; header sync sees its
        // departure as a disconnect.
        drop(headers_tx);

        catchup.transition(CatchupState::Syncing);
        info!(
            peers = catchup.fetchers.len(),
            tokens_per_peer = tokens,
            initial_batch_size = config.initial_batch_size,
            "Block catch-up started"
        );
        Ok(catchup)
    }
}

/// Handle to a running catch-up.
pub struct Catchup {
    blocks: Pipeline<HeaderSyncJob, DeliveredBlock>,
    fetchers: Vec<Pipeline<PeerSlot, ()>>,
    dispatchers: JoinSet<()>,
    scheduler: Arc<BlockFetchScheduler>,
    pending: Arc<PendingBlockIndex>,
    peers: Arc<Mutex<PeerManager>>,
    shutdown: Shutdown,
    state: CatchupState,
    /// Set by `cancel` until `next_block` has reported it.
    cancel_unreported: bool,
}

impl Catchup {
    /// Next block in height order.
    ///
    /// `Ok(None)` once the header chain stopped growing and every block of
    /// the confirmed ranges was delivered. After [`cancel`](Self::cancel) the
    /// next call returns `Err(CatchupError::Cancelled)`. After an error or
    /// the end of the run this keeps returning `Ok(None)`.
    pub async fn next_block(&mut self) -> Result<Option<DeliveredBlock>, CatchupError> {
        if self.state.is_finished() {
            if std::mem::take(&mut self.cancel_unreported) {
                return Err(CatchupError::Cancelled);
            }
            return Ok(None);
        }

        if let Some(block) = self.blocks.receive().await {
            return Ok(Some(block));
        }

        let outcome = match self.shutdown.take_failure() {
            Some(failure) => Err(CatchupError::from_failure(failure)),
            None if self.shutdown.is_cancelled() => Err(CatchupError::Cancelled),
            None => Ok(None),
        };

        match &outcome {
            Ok(_) => {
                info!("Block catch-up complete");
                self.teardown(CatchupState::Synced);
            }
            Err(err) => {
                warn!(error = %err, "Block catch-up failed");
                self.teardown(CatchupState::Failed);
            }
        }
        outcome
    }

    /// The run as a stream; ends after the last block or the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<DeliveredBlock, CatchupError>> {
        futures::stream::unfold(self, |mut catchup| async move {
            match catchup.next_block().await {
                Ok(Some(block)) => Some((Ok(block), catchup)),
                Ok(None) => None,
                Err(err) => Some((Err(err), catchup)),
            }
        })
    }

    /// Stop the run. Pending waits observe cancellation.
    pub fn cancel(&mut self) {
        if !self.state.is_finished() {
            info!("Block catch-up cancelled");
            self.teardown(CatchupState::Failed);
            self.cancel_unreported = true;
        }
    }

    pub fn state(&self) -> CatchupState {
        self.state
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.lock().get_peer(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<SyncPeer> {
        self.peers.lock().get_all_peers().cloned().collect()
    }

    fn transition(&mut self, target: CatchupState) {
        if self.state.can_transition_to(target) {
            debug!(from = ?self.state, to = ?target, "Catch-up state transition");
            self.state = target;
        }
    }

    fn teardown(&mut self, state: CatchupState) {
        self.shutdown.cancel();
        self.blocks.close();
        for fetcher in &mut self.fetchers {
            fetcher.close();
        }
        self.dispatchers.abort_all();
        self.scheduler.close();
        let cancelled = self.pending.cancel_all();
        debug!(cancelled, "Released pending block fetches");

        self.transition(state);
    }
}

impl Drop for Catchup {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            self.teardown(CatchupState::Failed);
        }
    }
}
