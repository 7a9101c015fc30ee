/// Catch-up state machine.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchupState {
    /// Built but not started yet.
    #[default]
    Idle,

    /// Syncing state: headers and blocks are being fetched.
    ///
    /// Blocks are handed to the consumer in height order as they arrive.
    Syncing,

    /// Synced state: the header chain accepted no more headers and every
    /// block in the confirmed ranges has been delivered.
    Synced,

    /// Stopped by a fatal error or by cancellation.
    Failed,
}

impl CatchupState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: CatchupState) -> bool {
        match self {
            CatchupState::Idle => matches!(target, CatchupState::Syncing | CatchupState::Failed),
            CatchupState::Syncing => matches!(target, CatchupState::Synced | CatchupState::Failed),
            CatchupState::Synced | CatchupState::Failed => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, CatchupState::Synced | CatchupState::Failed)
    }
}
