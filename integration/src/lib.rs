//! Integration tests for ocilayer.
//!
//! This crate doesn't contain any actual functionality.
//! It's just a container for integration tests that run the `ocilayer` binary
//! against live registries.

// This function only exists to satisfy the compiler, as this crate doesn't have any real functionality
#[doc(hidden)]
pub fn _dummy() {}
