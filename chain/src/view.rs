use std::sync::Arc;

use containers::{BlockHeader, Bytes32};
use parking_lot::Mutex;

/// Locally known header chain, as seen by the catch-up pipeline.
///
/// Heights are zero-based: the initial (genesis) block sits at height 0.
/// Implementations own header validation and locator construction; the
/// catch-up core only drives them through this interface.
pub trait ChainView: Send {
    /// Sparse list of known hashes, newest first, coarsening with distance.
    /// The last entry is always the initial block hash.
    fn locator_hashes(&self) -> Vec<Bytes32>;

    /// Hash of the block the chain is anchored on.
    fn initial_block_hash(&self) -> Bytes32;

    /// Height of the best known header, `None` while no header is known.
    fn last_height(&self) -> Option<u64>;

    /// Hash of the best known header, or the initial hash if none is known.
    fn last_block_hash(&self) -> Bytes32;

    /// Try to extend (or reorganise) the chain with a linked header sequence.
    ///
    /// Returns the first height whose header changed, or `None` when the
    /// headers are rejected or bring no progress.
    fn extend(&mut self, headers: &[BlockHeader]) -> Option<u64>;

    /// Identity of the header at `height` on the best chain.
    fn identity_at_height(&self, height: u64) -> Option<Bytes32>;
}

pub type SharedChainView = Arc<Mutex<dyn ChainView>>;
