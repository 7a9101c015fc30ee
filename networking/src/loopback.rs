/// In-process peer serving a fixed chain.
///
/// Answers `getheaders` and `getdata` from a list of blocks the way a full
/// node would, including leaving the locator's own block out of the reply.
/// Used by the demo binary and by tests; individual blocks can be withheld
/// and arbitrary messages injected.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use containers::{Block, Bytes32};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::trace;

use crate::types::{InvKind, MAX_HEADERS_PER_MESSAGE, Message, Peer};

pub struct LoopbackPeer {
    peer_id: PeerId,
    blocks: Vec<Block>,
    heights: HashMap<Bytes32, usize>,
    headers_per_message: usize,
    withheld: Mutex<HashSet<Bytes32>>,
    sent: Mutex<Vec<Message>>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    disconnected: watch::Sender<bool>,
}

impl LoopbackPeer {
    /// `blocks[h]` is the block at height `h`.
    pub fn new(blocks: Vec<Block>) -> Self {
        let heights = blocks
            .iter()
            .enumerate()
            .map(|(height, block)| (block.hash(), height))
            .collect();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (disconnected, _) = watch::channel(false);

        Self {
            peer_id: PeerId::random(),
            blocks,
            heights,
            headers_per_message: MAX_HEADERS_PER_MESSAGE,
            withheld: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
            disconnected,
        }
    }

    pub fn with_headers_per_message(mut self, count: usize) -> Self {
        self.headers_per_message = count.max(1);
        self
    }

    /// Never answer `getdata` for these blocks.
    pub fn withhold(&self, hashes: impl IntoIterator<Item = Bytes32>) {
        self.withheld.lock().extend(hashes);
    }

    pub fn release(&self, hash: &Bytes32) {
        self.withheld.lock().remove(hash);
    }

    /// Queue a message as if the remote side had sent it.
    pub fn inject(&self, message: Message) {
        let _ = self.inbox_tx.send(message);
    }

    pub fn disconnect(&self) {
        self.disconnected.send_replace(true);
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.borrow()
    }

    /// Everything sent to this peer, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Block hashes of every `getdata` received, one entry per message.
    pub fn requested_batches(&self) -> Vec<Vec<Bytes32>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::GetData(items) => Some(items.iter().map(|item| item.hash).collect()),
                _ => None,
            })
            .collect()
    }

    fn headers_after(&self, locator: &[Bytes32], hash_stop: Bytes32) -> Message {
        // Unknown locators fall back to the block after genesis.
        let start = locator
            .iter()
            .find_map(|hash| self.heights.get(hash))
            .map_or(1, |height| height + 1);

        let mut headers = Vec::new();
        for block in self.blocks.iter().skip(start).take(self.headers_per_message) {
            headers.push(block.header.clone());
            if !hash_stop.is_zero() && block.hash() == hash_stop {
                break;
            }
        }
        Message::Headers(headers)
    }

    fn answer(&self, message: &Message) {
        match message {
            Message::GetHeaders {
                locator, hash_stop, ..
            } => self.inject(self.headers_after(locator, *hash_stop)),
            Message::GetData(items) => {
                let withheld = self.withheld.lock().clone();
                for item in items {
                    if withheld.contains(&item.hash) {
                        trace!(peer = %self.peer_id, hash = %item.hash, "Withholding block");
                        continue;
                    }
                    let Some(block) = self.heights.get(&item.hash).map(|h| &self.blocks[*h]) else {
                        continue;
                    };
                    match item.kind {
                        InvKind::Block => self.inject(Message::Block(block.clone())),
                        InvKind::FilteredBlock => self.inject(Message::MerkleBlock(block.clone())),
                        InvKind::Transaction => {}
                    }
                }
            }
            Message::Ping { nonce } => self.inject(Message::Pong { nonce: *nonce }),
            _ => {}
        }
    }
}

#[async_trait]
impl Peer for LoopbackPeer {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn send_message(&self, message: Message) {
        if self.is_disconnected() {
            return;
        }
        self.sent.lock().push(message.clone());
        self.answer(&message);
    }

    async fn next_message(&self) -> Option<Message> {
        let mut disconnected = self.disconnected.subscribe();
        let mut inbox = self.inbox_rx.lock().await;
        tokio::select! {
            biased;
            _ = disconnected.wait_for(|gone| *gone) => None,
            message = inbox.recv() => message,
        }
    }
}
