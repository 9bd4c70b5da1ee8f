//! Integration tests for afpack CLI
//!
//! These tests spawn the actual binary against a temporary state directory
//! and config file, so they never touch `~/.afpack`.
