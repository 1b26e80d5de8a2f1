//! Rejections the core reports back to the player that caused them.
//!
//! None of these is fatal: the connection, the session and the rest of the server keep going.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DuelError {
    /// Malformed or unrecognized inbound event.
    #[error("{0}")]
    Protocol(String),
    #[error("you are not in an active game")]
    NotInSession,
    #[error("you are already in a game")]
    AlreadyInSession,
    #[error("your previous submission is still being checked")]
    SubmissionPending,
    #[error("the game is already over")]
    SessionClosed,
}
