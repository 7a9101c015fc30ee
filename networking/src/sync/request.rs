/// Work items flowing through the catch-up pipelines.
use std::collections::HashSet;
use std::sync::Arc;

use containers::{Block, Bytes32};
use libp2p_identity::PeerId;
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum SignalState {
    Pending,
    Resolved(Arc<Block>),
    Cancelled,
}

/// Awaiting a signal that was cancelled before any peer delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("completion signal cancelled")]
pub struct SignalCancelled;

/// One-shot completion signal for a block.
///
/// Cloning shares the signal. It settles at most once, either resolved with
/// the block whose identity it was created for or cancelled; any number of
/// clones may await it.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    hash: Bytes32,
    state: Arc<watch::Sender<SignalState>>,
}

impl CompletionSignal {
    pub fn new(hash: Bytes32) -> Self {
        let (state, _) = watch::channel(SignalState::Pending);
        Self {
            hash,
            state: Arc::new(state),
        }
    }

    pub fn hash(&self) -> Bytes32 {
        self.hash
    }

    /// Whether the signal has settled, resolved or cancelled.
    pub fn is_done(&self) -> bool {
        !matches!(*self.state.borrow(), SignalState::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.borrow(), SignalState::Resolved(_))
    }

    /// Settle with `block`. Returns `false` if the signal had already settled
    /// or the block does not match the expected identity.
    pub fn resolve(&self, block: Arc<Block>) -> bool {
        if block.hash() != self.hash {
            return false;
        }
        self.settle(SignalState::Resolved(block))
    }

    /// Settle as cancelled. Returns `false` if already settled.
    pub fn cancel(&self) -> bool {
        self.settle(SignalState::Cancelled)
    }

    fn settle(&self, outcome: SignalState) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, SignalState::Pending) {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    pub async fn wait(&self) -> Result<Arc<Block>, SignalCancelled> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, SignalState::Pending))
            .await
            .map_err(|_| SignalCancelled)?;

        match &*state {
            SignalState::Resolved(block) => Ok(block.clone()),
            _ => Err(SignalCancelled),
        }
    }

    /// Whether two handles share the same underlying signal.
    pub fn same_as(&self, other: &CompletionSignal) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// A unit of work: obtain the full block for one identity.
///
/// Owned by exactly one component at a time; it moves by value between the
/// factory, the scheduler and a peer batch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub priority: u64,
    pub signal: CompletionSignal,
    pub peers_tried: HashSet<PeerId>,
}

impl FetchRequest {
    pub fn new(priority: u64, signal: CompletionSignal) -> Self {
        Self {
            priority,
            signal,
            peers_tried: HashSet::new(),
        }
    }

    pub fn hash(&self) -> Bytes32 {
        self.signal.hash()
    }

    pub fn is_done(&self) -> bool {
        self.signal.is_done()
    }

    pub fn was_tried_by(&self, peer: &PeerId) -> bool {
        self.peers_tried.contains(peer)
    }
}

/// Newly confirmed headers: identities for heights `start_height..`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRange {
    pub start_height: u64,
    pub hashes: Vec<Bytes32>,
}

impl HeaderRange {
    pub fn iter(&self) -> impl Iterator<Item = (u64, Bytes32)> + '_ {
        self.hashes
            .iter()
            .enumerate()
            .map(|(offset, hash)| (self.start_height + offset as u64, *hash))
    }

    pub fn end_height(&self) -> Option<u64> {
        (self.hashes.len() as u64)
            .checked_sub(1)
            .map(|last| self.start_height + last)
    }
}

/// A requested block the completion waiter still has to await.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub height: u64,
    pub signal: CompletionSignal,
}

/// A block handed to the caller, in height order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredBlock {
    pub height: u64,
    pub block: Arc<Block>,
}

impl DeliveredBlock {
    pub fn hash(&self) -> Bytes32 {
        self.block.hash()
    }
}
