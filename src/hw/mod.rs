//! Crypto-engine drivers.
//!
//! The coprocessor owns AES and SHA engines that the rest of the system
//! shares as process-wide singletons. Each engine accepts one command at a
//! time and has no queueing hardware, so the drivers serialize callers
//! internally.

pub mod aes;
pub mod sha;

/// Errors of the crypto engines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineError {
    /// Buffer sizes violate the engine's command limits.
    Invalid,
}
