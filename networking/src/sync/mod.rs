/// Block catch-up for a header-first chain.
///
/// This module downloads a peer's chain in two passes: headers first, to
/// learn which blocks exist and in what order, then the blocks themselves,
/// fetched in batches from every available peer and delivered in height
/// order. It includes:
///
/// - **Header Sync**: extends the local header chain and emits new height ranges
/// - **Fetch Scheduler**: priority queue of outstanding block fetches, lowest height first
/// - **Pending Index**: one completion signal per outstanding block identity
/// - **Batch Fetcher**: per-peer pipeline that sends `GetData` batches and requeues misses
/// - **Dispatcher**: per-peer read loop routing pings, headers and blocks
/// - **Catch-up**: wires all of the above together and hands blocks to the caller
///
/// ## State Machine
///
/// - **IDLE**: built, not started
/// - **SYNCING**: fetching headers and blocks
/// - **SYNCED**: header chain stopped growing and every block was delivered
/// - **FAILED**: cancelled, or a fatal error (peer loss, undeliverable block)
pub mod batch_fetcher;
pub mod block_stages;
pub mod catchup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod header_sync;
pub mod peer_manager;
pub mod pending;
pub mod request;
pub mod scheduler;
pub mod states;

pub use batch_fetcher::{Batch, BatchAssembler, BatchFetcher, PeerSlot};
pub use block_stages::{CompletionWaiter, FetchRequestFactory};
pub use catchup::{BlockCatchup, Catchup};
pub use config::*;
pub use dispatcher::{BlockDisposition, EventDispatcher};
pub use error::CatchupError;
pub use header_sync::{HeaderSync, HeaderSyncJob};
pub use peer_manager::{PeerManager, SyncPeer};
pub use pending::PendingBlockIndex;
pub use request::{
    CompletionSignal, DeliveredBlock, FetchRequest, HeaderRange, PendingBlock, SignalCancelled,
};
pub use scheduler::BlockFetchScheduler;
pub use states::CatchupState;

#[cfg(test)]
mod tests;
