/// Synthetic devnet chains.
///
/// Generates deterministic, linked chains of small blocks so the catch-up
/// pipeline can be driven end to end without a real network.
use alloy_primitives::Bytes;

use crate::{Block, BlockHeader, Bytes32, merkle_root};

pub const DEVNET_VERSION: u32 = 1;
pub const DEVNET_BITS: u32 = 0x207f_ffff;
pub const DEVNET_GENESIS_TIMESTAMP: u32 = 1_700_000_000;
pub const DEVNET_BLOCK_INTERVAL: u32 = 600;

/// Build the block at `height` on top of `previous_block_hash`.
///
/// `seed` distinguishes otherwise identical chains (e.g. competing forks).
pub fn build_block(height: u64, previous_block_hash: Bytes32, seed: u64) -> Block {
    let coinbase = Bytes::from([height.to_le_bytes(), seed.to_le_bytes()].concat());
    let transactions = vec![coinbase];

    let header = BlockHeader {
        version: DEVNET_VERSION,
        previous_block_hash,
        merkle_root: merkle_root(&transactions),
        timestamp: DEVNET_GENESIS_TIMESTAMP
            .wrapping_add((height as u32).wrapping_mul(DEVNET_BLOCK_INTERVAL)),
        bits: DEVNET_BITS,
        nonce: seed as u32,
    };

    Block::new(header, transactions)
}

/// Generate `length` linked blocks starting with a genesis block at height 0.
pub fn generate_chain(length: usize, seed: u64) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(length);
    for height in 0..length as u64 {
        let previous = blocks.last().map(Block::hash).unwrap_or(Bytes32::ZERO);
        blocks.push(build_block(height, previous, seed));
    }
    blocks
}

/// Extend `base` (truncated to `fork_height` blocks) with `extra` new blocks
/// built from a different seed.
pub fn fork_chain(base: &[Block], fork_height: usize, extra: usize, seed: u64) -> Vec<Block> {
    let mut blocks = base[..fork_height.min(base.len())].to_vec();
    for _ in 0..extra {
        let height = blocks.len() as u64;
        let previous = blocks.last().map(Block::hash).unwrap_or(Bytes32::ZERO);
        blocks.push(build_block(height, previous, seed));
    }
    blocks
}
