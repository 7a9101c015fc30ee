use containers::Bytes32;
use libp2p_identity::PeerId;
use thiserror::Error;

/// Fatal outcomes of a catch-up run.
///
/// Recoverable conditions (a peer missing a block, duplicate or unsolicited
/// deliveries, the chain view declining headers) never surface here.
#[derive(Debug, Error)]
pub enum CatchupError {
    #[error("peer {0} disconnected")]
    PeerDisconnected(PeerId),

    #[error("no connected peer could deliver block {hash} at height {height}")]
    BlockUnavailable { hash: Bytes32, height: u64 },

    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    #[error("catch-up cancelled")]
    Cancelled,

    #[error(transparent)]
    Stage(#[from] anyhow::Error),
}

impl CatchupError {
    /// Recover the typed error from a stage failure.
    pub fn from_failure(error: anyhow::Error) -> Self {
        match error.downcast::<CatchupError>() {
            Ok(error) => error,
            Err(error) => CatchupError::Stage(error),
        }
    }
}
