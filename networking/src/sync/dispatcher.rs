/// Per-peer message dispatch.
///
/// Each connected peer gets one read loop that routes inbound messages:
/// pings are answered, headers go to the header stage (header peer only),
/// and blocks resolve whichever pending fetch is waiting for them. A block
/// whose transactions do not match its header's merkle root resolves
/// nothing, so the fetch stays open for another peer.
use std::sync::Arc;

use containers::{Block, BlockHeader};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{error::CatchupError, peer_manager::PeerManager, pending::PendingBlockIndex};
use crate::pipeline::Shutdown;
use crate::types::{Message, Peer};

/// What happened to an inbound block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDisposition {
    Resolved,
    Duplicate,
    Unsolicited,
    /// Payload does not match the header's merkle root.
    Invalid,
}

pub struct EventDispatcher {
    peer: Arc<dyn Peer>,
    peer_id: PeerId,
    headers: Option<mpsc::UnboundedSender<Vec<BlockHeader>>>,
    pending: Arc<PendingBlockIndex>,
    peers: Arc<Mutex<PeerManager>>,
    disconnected: Shutdown,
    metrics: Option<SharedMetrics>,
}

impl EventDispatcher {
    pub fn new(
        peer: Arc<dyn Peer>,
        pending: Arc<PendingBlockIndex>,
        peers: Arc<Mutex<PeerManager>>,
    ) -> Self {
        Self {
            peer_id: peer.peer_id(),
            peer,
            headers: None,
            pending,
            peers,
            disconnected: Shutdown::new(),
            metrics: None,
        }
    }

    /// Cancelled once the peer disconnects, so its fetch loop can retire.
    pub fn with_disconnect_signal(mut self, disconnected: Shutdown) -> Self {
        self.disconnected = disconnected;
        self
    }

    /// Makes this the header peer: its `Headers` replies feed header sync
    /// and losing it ends the run.
    pub fn with_headers(mut self, headers: mpsc::UnboundedSender<Vec<BlockHeader>>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_header_peer(&self) -> bool {
        self.headers.is_some()
    }

    /// Route one inbound message.
    pub fn dispatch(&self, message: Message) {
        match message {
            Message::Ping { nonce } => {
                trace!(peer = %self.peer_id, nonce, "Answering ping");
                self.peer.send_message(Message::Pong { nonce });
            }
            Message::Headers(headers) => match &self.headers {
                Some(tx) => {
                    trace!(peer = %self.peer_id, count = headers.len(), "Received headers");
                    if tx.send(headers).is_err() {
                        debug!(peer = %self.peer_id, "Header sync no longer listening");
                    }
                }
                None => {
                    trace!(peer = %self.peer_id, "Ignoring headers from non-header peer");
                }
            },
            Message::Block(block) | Message::MerkleBlock(block) => {
                self.on_block(block);
            }
            other => {
                trace!(peer = %self.peer_id, message = %other, "Ignoring message");
            }
        }
    }

    pub fn on_block(&self, block: Block) -> BlockDisposition {
        let hash = block.hash();
        let disposition = match self.pending.get(&hash) {
            Some(_) if !block.has_valid_merkle_root() => BlockDisposition::Invalid,
            Some(signal) => {
                if signal.resolve(Arc::new(block)) {
                    BlockDisposition::Resolved
                } else {
                    BlockDisposition::Duplicate
                }
            }
            None => BlockDisposition::Unsolicited,
        };

        match disposition {
            BlockDisposition::Resolved => {
                trace!(peer = %self.peer_id, %hash, "Block resolved");
                self.peers.lock().on_block_delivered(&self.peer_id);
            }
            BlockDisposition::Duplicate => {
                trace!(peer = %self.peer_id, %hash, "Duplicate block");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_duplicate_blocks();
                }
            }
            BlockDisposition::Unsolicited => {
                trace!(peer = %self.peer_id, %hash, "Unsolicited block");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_unsolicited_blocks();
                }
            }
            BlockDisposition::Invalid => {
                debug!(peer = %self.peer_id, %hash, "Block payload does not match merkle root");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_unsolicited_blocks();
                }
            }
        }
        disposition
    }

    /// Read loop. Returns when the peer disconnects or the run is cancelled.
    pub async fn run(self, shutdown: Shutdown) {
        debug!(peer = %self.peer_id, header_peer = self.is_header_peer(), "Dispatcher started");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                message = self.peer.next_message() => message,
            };

            match message {
                Some(message) => self.dispatch(message),
                None => {
                    self.on_disconnect(&shutdown);
                    return;
                }
            }
        }
    }

    pub fn on_disconnect(&self, shutdown: &Shutdown) {
        let peers_left = {
            let mut peers = self.peers.lock();
            peers.mark_disconnected(&self.peer_id);
            peers.connected_peers().count()
        };
        self.disconnected.cancel();

        if self.is_header_peer() || peers_left == 0 {
            warn!(
                peer = %self.peer_id,
                header_peer = self.is_header_peer(),
                peers_left,
                "Lost required peer"
            );
            shutdown.fail(CatchupError::PeerDisconnected(self.peer_id).into());
        } else {
            info!(peer = %self.peer_id, peers_left, "Peer disconnected, continuing with remaining peers");
        }
    }
}
