//! The impersonated kernel services.
//!
//! Each emulator registers an alias path that the open-syscall hook
//! rewrites host opens onto, answers the commands it owns and forwards
//! the rest to the genuine service, byte-for-byte and error-for-error.

pub mod di;
pub mod es;
pub mod fs;
