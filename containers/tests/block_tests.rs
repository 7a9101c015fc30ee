use alloy_primitives::Bytes;
use containers::devnet::{fork_chain, generate_chain};
use containers::{Block, BlockHeader, Bytes32, merkle_root};
use pretty_assertions::assert_eq;
use rstest::rstest;

#[test]
fn test_header_encoding_layout() {
    let header = BlockHeader {
        version: 2,
        previous_block_hash: Bytes32::from([1u8; 32]),
        merkle_root: Bytes32::from([2u8; 32]),
        timestamp: 3,
        bits: 4,
        nonce: 5,
    };

    let encoded = header.encode();
    assert_eq!(&encoded[0..4], &2u32.to_le_bytes());
    assert_eq!(&encoded[4..36], &[1u8; 32]);
    assert_eq!(&encoded[36..68], &[2u8; 32]);
    assert_eq!(&encoded[68..72], &3u32.to_le_bytes());
    assert_eq!(&encoded[72..76], &4u32.to_le_bytes());
    assert_eq!(&encoded[76..80], &5u32.to_le_bytes());
}

#[test]
fn test_hash_changes_with_nonce() {
    let header = BlockHeader::default();
    let mut other = header.clone();
    other.nonce = 1;

    assert_ne!(header.hash(), other.hash());
    assert_eq!(header.hash(), BlockHeader::default().hash());
}

#[test]
fn test_block_identity_is_header_identity() {
    let block = Block::new(BlockHeader::default(), vec![Bytes::from_static(b"tx")]);
    assert_eq!(block.hash(), block.header.hash());
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(7)]
fn test_merkle_root_is_deterministic(#[case] count: usize) {
    let txs: Vec<Bytes> = (0..count as u8).map(|i| Bytes::from(vec![i; 4])).collect();
    assert_eq!(merkle_root(&txs), merkle_root(&txs.clone()));
    assert_eq!(merkle_root(&txs).is_zero(), count == 0);
}

#[test]
fn test_merkle_root_distinguishes_duplicated_leaf() {
    let txs = vec![Bytes::from_static(b"coinbase")];
    let pair_root = merkle_root(&[txs[0].clone(), txs[0].clone()]);
    assert_ne!(merkle_root(&txs), pair_root);
}

#[test]
fn test_generated_chain_is_linked() {
    let chain = generate_chain(16, 0);
    assert_eq!(chain.len(), 16);
    assert!(chain[0].previous_block_hash().is_zero());

    for pair in chain.windows(2) {
        assert_eq!(pair[1].previous_block_hash(), pair[0].hash());
        assert!(pair[1].has_valid_merkle_root());
    }
}

#[test]
fn test_fork_shares_prefix_only() {
    let base = generate_chain(10, 0);
    let fork = fork_chain(&base, 6, 8, 1);

    assert_eq!(fork.len(), 14);
    assert_eq!(fork[5].hash(), base[5].hash());
    assert_ne!(fork[6].hash(), base[6].hash());
    assert_eq!(fork[6].previous_block_hash(), base[5].hash());
}
