pub mod config;
pub mod header_chain;
pub mod view;

pub use header_chain::HeaderChain;
pub use view::{ChainView, SharedChainView};
