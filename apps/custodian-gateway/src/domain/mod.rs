//! Domain Layer - Credentials, backoff and operation outcomes.
//!
//! Pure types with no I/O. Everything here is deterministic given its
//! inputs, which is what makes the envelope testable with a paused clock.

/// Bearer credential with expiry.
pub mod credential;

/// Backoff policy and Retry-After parsing.
pub mod backoff;

/// Remote operation replies, failure taxonomy and the envelope state machine.
pub mod operation;
