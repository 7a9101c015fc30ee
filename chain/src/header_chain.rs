/// In-memory header chain.
///
/// Keeps the best known chain of headers, indexed both by height and by
/// hash, and switches to a competing branch when it is strictly longer.
use std::collections::HashMap;

use containers::{BlockHeader, Bytes32};
use tracing::{debug, warn};

use crate::config::{LOCATOR_DENSE_ENTRIES, MAX_LOCATOR_HASHES};
use crate::view::ChainView;

/// Header chain anchored on an initial block hash.
///
/// The chain may start empty (only the initial hash is known) or with the
/// initial header already in place. Chain length is the fork-choice rule:
/// a branch replaces the current tip only if it ends strictly higher.
#[derive(Debug, Clone)]
pub struct HeaderChain {
    initial_block_hash: Bytes32,
    /// Best chain; index is height.
    headers: Vec<(Bytes32, BlockHeader)>,
    heights: HashMap<Bytes32, u64>,
}

impl HeaderChain {
    /// Chain that only knows the hash of its initial block.
    pub fn new(initial_block_hash: Bytes32) -> Self {
        Self {
            initial_block_hash,
            headers: Vec::new(),
            heights: HashMap::new(),
        }
    }

    /// Chain seeded with the initial header at height 0.
    pub fn from_genesis(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let mut chain = Self::new(hash);
        chain.heights.insert(hash, 0);
        chain.headers.push((hash, genesis));
        chain
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn header_at_height(&self, height: u64) -> Option<&BlockHeader> {
        self.headers.get(height as usize).map(|(_, header)| header)
    }

    pub fn height_of(&self, hash: &Bytes32) -> Option<u64> {
        self.heights.get(hash).copied()
    }

    /// Height at which `first` would sit, if it connects to the chain.
    fn attach_height(&self, first: &BlockHeader) -> Option<u64> {
        let hash = first.hash();
        if hash == self.initial_block_hash {
            return Some(0);
        }
        self.heights
            .get(&first.previous_block_hash)
            .map(|parent| parent + 1)
    }

    fn truncate(&mut self, height: u64) {
        for (hash, _) in self.headers.drain(height as usize..) {
            self.heights.remove(&hash);
        }
    }
}

impl ChainView for HeaderChain {
    fn locator_hashes(&self) -> Vec<Bytes32> {
        let Some(mut height) = self.last_height() else {
            return vec![self.initial_block_hash];
        };

        let mut hashes = Vec::new();
        let mut step = 1;
        while height > 0 && hashes.len() < MAX_LOCATOR_HASHES - 1 {
            hashes.push(self.headers[height as usize].0);
            if hashes.len() >= LOCATOR_DENSE_ENTRIES {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        hashes.push(self.initial_block_hash);
        hashes
    }

    fn initial_block_hash(&self) -> Bytes32 {
        self.initial_block_hash
    }

    fn last_height(&self) -> Option<u64> {
        (self.headers.len() as u64).checked_sub(1)
    }

    fn last_block_hash(&self) -> Bytes32 {
        self.headers
            .last()
            .map(|(hash, _)| *hash)
            .unwrap_or(self.initial_block_hash)
    }

    fn extend(&mut self, headers: &[BlockHeader]) -> Option<u64> {
        let first = headers.first()?;

        let Some(start) = self.attach_height(first) else {
            debug!(
                parent = %first.previous_block_hash,
                "Headers do not connect to the known chain"
            );
            return None;
        };

        let hashes: Vec<Bytes32> = headers.iter().map(BlockHeader::hash).collect();
        for (idx, pair) in headers.windows(2).enumerate() {
            if pair[1].previous_block_hash != hashes[idx] {
                warn!(offset = idx + 1, "Header sequence is not linked");
                return None;
            }
        }

        // Skip the prefix we already hold.
        let known = hashes
            .iter()
            .enumerate()
            .take_while(|(offset, hash)| {
                self.identity_at_height(start + *offset as u64) == Some(**hash)
            })
            .count();

        if known == headers.len() {
            return None;
        }

        let new_tip = start + headers.len() as u64 - 1;
        if let Some(tip) = self.last_height() {
            if new_tip <= tip {
                debug!(new_tip, tip, "Competing branch is not longer than ours");
                return None;
            }
        }

        let first_new = start + known as u64;
        if self.last_height().is_some_and(|tip| first_new <= tip) {
            debug!(fork_height = first_new, "Switching to a longer branch");
        }

        self.truncate(first_new);
        for (hash, header) in hashes.into_iter().zip(headers.iter()).skip(known) {
            self.heights.insert(hash, self.headers.len() as u64);
            self.headers.push((hash, header.clone()));
        }

        Some(first_new)
    }

    fn identity_at_height(&self, height: u64) -> Option<Bytes32> {
        self.headers.get(height as usize).map(|(hash, _)| *hash)
    }
}
