//! Unit tests for afpack CLI
//!
//! These tests drive the application services against real temp directories
//! with in-repo fakes for the disk-image, compression and platform tools.

mod compression_service;
mod crash_points;
mod lifecycle_properties;
mod mount_service;
mod pack_service;
mod recovery;
