pub mod block;
pub mod devnet;
pub mod types;

pub use block::{Block, BlockHeader, merkle_root};
pub use types::Bytes32;
