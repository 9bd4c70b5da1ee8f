//! Application layer: port trait definitions and use-case orchestration.
//!
//! This module depends only on `crate::domain`, never on `crate::infra`,
//! `crate::commands`, or `crate::output`.

pub mod ports;
pub mod services;

pub use ports::{
    CancelFlag, CommandRunner, CompressionBackend, ConfigStore, ImageBackend, MountGate,
    PathLocker, PlatformProbe, ProgressReporter, StateLedger, TreeOps,
};
pub use services::orchestrator::{
    Backends, CompressOutcome, MountOutcome, Orchestrator, PackOptions, PackOutcome, PackPlan,
    RecoverOutcome, UnpackOutcome,
};
