//! Infrastructure layer: concrete implementations of application port traits.
//!
//! This module contains all I/O-performing code: process execution, the
//! disk-image and compression tools, the ledger and lock files, and tree
//! copying.
//!
//! Imports from `crate::domain` and `crate::application::ports` are allowed.
//! Imports from `crate::commands` or `crate::output` are forbidden.

pub mod applesauce;
pub mod command_runner;
pub mod config;
pub mod diskutil;
pub mod ledger;
pub mod lock;
pub mod platform;
pub mod tree;
