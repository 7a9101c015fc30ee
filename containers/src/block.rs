use alloy_primitives::Bytes;
use sha2::{Digest, Sha256};

use crate::Bytes32;

/// Size of a serialized header on the wire.
pub const HEADER_SIZE: usize = 80;

/// Compact block metadata: enough to verify chain linkage without the
/// transaction payload.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_block_hash: Bytes32,
    pub merkle_root: Bytes32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Little-endian 80-byte serialization used for hashing.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.previous_block_hash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Block identity: double SHA-256 of the encoded header.
    pub fn hash(&self) -> Bytes32 {
        double_sha256(&self.encode())
    }
}

/// A full block: header plus opaque transaction payloads.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Bytes>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Bytes>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }

    pub fn previous_block_hash(&self) -> Bytes32 {
        self.header.previous_block_hash
    }

    /// Whether the header commits to the carried transactions.
    pub fn has_valid_merkle_root(&self) -> bool {
        merkle_root(&self.transactions) == self.header.merkle_root
    }
}

pub(crate) fn double_sha256(data: &[u8]) -> Bytes32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Bytes32::from_slice(&second)
}

/// Merkle root over transaction hashes, duplicating the last node on odd
/// levels. An empty transaction list commits to the zero hash.
pub fn merkle_root(transactions: &[Bytes]) -> Bytes32 {
    if transactions.is_empty() {
        return Bytes32::ZERO;
    }

    let mut level: Vec<Bytes32> = transactions.iter().map(|tx| double_sha256(tx)).collect();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }

        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(pair[0].as_bytes());
                buf[32..].copy_from_slice(pair[1].as_bytes());
                double_sha256(&buf)
            })
            .collect();
    }

    level[0]
}
