/// The lifecycle of a programming session on one flash region.
///
/// ```text
/// Idle -> Initialized -> Erasing -> Programming -> Verifying -> Finalized
///                    \____________\______________\____________\-> Aborted
/// ```
///
/// Erasing, programming and verifying may each be skipped. Every non-terminal
/// state can move to `Aborted`. The uninit routine runs on entering either
/// terminal state, as long as the algorithm was initialized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlashState {
    /// Nothing was done on the target yet.
    Idle,
    /// The algorithm is loaded and its init routine succeeded.
    Initialized,
    /// Sectors are being erased.
    Erasing,
    /// Pages are being programmed.
    Programming,
    /// The flash contents are being compared to the image.
    Verifying,
    /// The session completed.
    Finalized,
    /// The session stopped on an error.
    Aborted,
}

impl FlashState {
    /// Returns `true` for the states a session ends in.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlashState::Finalized | FlashState::Aborted)
    }

    /// Returns `true` if the session may move from `self` to `next`.
    pub fn can_transition_to(self, next: FlashState) -> bool {
        match (self, next) {
            (from, FlashState::Aborted) => !from.is_terminal(),
            (FlashState::Idle, FlashState::Initialized)
            | (
                FlashState::Initialized,
                FlashState::Erasing | FlashState::Programming | FlashState::Finalized,
            )
            | (FlashState::Erasing, FlashState::Programming | FlashState::Finalized)
            | (FlashState::Programming, FlashState::Verifying | FlashState::Finalized)
            | (FlashState::Verifying, FlashState::Finalized) => true,
            _ => false,
        }
    }
}
