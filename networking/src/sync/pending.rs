/// Index of blocks the run is still waiting for.
///
/// Maps a block identity to its completion signal from the moment a request
/// for it enters circulation until the completion waiter consumes the block.
/// The dispatcher resolves signals through it when blocks arrive.
use std::collections::HashMap;

use containers::Bytes32;
use parking_lot::Mutex;

use super::request::CompletionSignal;

#[derive(Debug, Default)]
pub struct PendingBlockIndex {
    signals: Mutex<HashMap<Bytes32, CompletionSignal>>,
}

impl PendingBlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal for `hash`, created and registered on first use.
    ///
    /// Every requester of the same block shares one signal.
    pub fn signal_for(&self, hash: Bytes32) -> CompletionSignal {
        self.signals
            .lock()
            .entry(hash)
            .or_insert_with(|| CompletionSignal::new(hash))
            .clone()
    }

    pub fn get(&self, hash: &Bytes32) -> Option<CompletionSignal> {
        self.signals.lock().get(hash).cloned()
    }

    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.signals.lock().contains_key(hash)
    }

    /// Drop the entry once nobody needs to hear about `hash` any more.
    pub fn remove(&self, hash: &Bytes32) -> Option<CompletionSignal> {
        self.signals.lock().remove(hash)
    }

    pub fn len(&self) -> usize {
        self.signals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.lock().is_empty()
    }

    /// Cancel and forget every outstanding signal, releasing all awaiters.
    ///
    /// Returns how many signals were still unsettled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<CompletionSignal> =
            self.signals.lock().drain().map(|(_, signal)| signal).collect();
        drained.iter().filter(|signal| signal.cancel()).count()
    }
}
