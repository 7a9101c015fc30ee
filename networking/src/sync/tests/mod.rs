mod block_stages_tests;
mod catchup_tests;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chain::{HeaderChain, SharedChainView};
use containers::{Block, BlockHeader, Bytes32};
use libp2p_identity::PeerId;
use parking_lot::Mutex;

use crate::sync::CatchupConfig;
use crate::types::{Message, Peer};

/// Peer that records what it is sent and never says anything back.
struct SilentPeer {
    peer_id: PeerId,
    sent: Mutex<Vec<Message>>,
}

impl SilentPeer {
    fn new() -> Self {
        Self {
            peer_id: PeerId::random(),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Peer for SilentPeer {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn send_message(&self, message: Message) {
        self.sent.lock().push(message);
    }

    async fn next_message(&self) -> Option<Message> {
        std::future::pending().await
    }
}

fn headers_of(blocks: &[Block]) -> Vec<BlockHeader> {
    blocks.iter().map(|block| block.header.clone()).collect()
}

fn hashes_of(blocks: &[Block]) -> Vec<Bytes32> {
    blocks.iter().map(Block::hash).collect()
}

fn shared_chain(chain: HeaderChain) -> (Arc<Mutex<HeaderChain>>, SharedChainView) {
    let chain = Arc::new(Mutex::new(chain));
    let view: SharedChainView = chain.clone();
    (chain, view)
}

/// Short timers so tests never sit through production grace periods.
fn fast_config() -> CatchupConfig {
    CatchupConfig {
        batch_grace_ms: 1,
        batch_timeout_ms: Some(200),
        ..CatchupConfig::default()
    }
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
