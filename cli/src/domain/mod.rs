//! Domain layer: pure business logic, types, and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod config;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod size;

pub use config::{AfpackConfig, Settings, validate_config_key, validate_config_value};
pub use error::{ConfigError, FailureReport, PackError, SizeError};
pub use layout::{PathLayout, hex_encode, ledger_key};
pub use lifecycle::{Admission, CompressStep, PackStep, Step, UnpackStep, admit};
pub use size::{ImageSizing, diskutil_size, format_size, parse_size};
