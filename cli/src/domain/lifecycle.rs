//! Managed-path state machine: step sequences and command admission.
//!
//! Pure functions only, no I/O or async.

use std::path::Path;

use afpack_common::{ManagedPath, OperationKind, PathState};

use crate::domain::error::PackError;

/// Ordered, resumable steps of one operation kind.
pub trait Step: Copy + Eq + Sized + 'static {
    /// Every step in execution order.
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    /// Position of this step in [`Step::ALL`]; persisted in the ledger.
    fn index(self) -> u32 {
        let pos = Self::ALL.iter().position(|s| *s == self).unwrap_or(0);
        u32::try_from(pos).unwrap_or(u32::MAX)
    }

    fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Step name for a persisted index, for display.
    fn name_of(index: u32) -> &'static str {
        Self::from_index(index).map_or("unknown", Self::name)
    }
}

macro_rules! steps {
    ($(#[$meta:meta])* $ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $ty {
            $($variant),+
        }

        impl Step for $ty {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

steps!(
    /// Steps of `pack`. The swap window is `MoveAside..=ConfirmAttach`.
    PackStep {
        Preflight => "preflight",
        CreateImage => "create_image",
        AttachStaging => "attach_staging",
        CopyContent => "copy_content",
        Verify => "verify",
        DetachStaging => "detach_staging",
        FinalizeImage => "finalize_image",
        MoveAside => "move_aside",
        AttachLogical => "attach_logical",
        ConfirmAttach => "confirm_attach",
        DeleteTrash => "delete_trash",
    }
);

steps!(
    /// Steps of `unpack`. The swap window is `DetachLogical..=Swap`.
    UnpackStep {
        Preflight => "preflight",
        PrepareRestore => "prepare_restore",
        CopyOut => "copy_out",
        Verify => "verify",
        DetachLogical => "detach_logical",
        Swap => "swap",
        DeleteImage => "delete_image",
    }
);

steps!(
    /// Steps of `compress` and `decompress`.
    CompressStep {
        Scan => "scan",
        Apply => "apply",
        Verify => "verify",
    }
);

impl PackStep {
    #[must_use]
    pub fn in_swap_window(self) -> bool {
        matches!(
            self,
            Self::MoveAside | Self::AttachLogical | Self::ConfirmAttach
        )
    }

    /// Whether the original directory may already have been moved aside.
    #[must_use]
    pub fn past_move_aside(self) -> bool {
        self.index() >= Self::MoveAside.index()
    }
}

impl UnpackStep {
    #[must_use]
    pub fn in_swap_window(self) -> bool {
        matches!(self, Self::DetachLogical | Self::Swap)
    }
}

/// Display name of the persisted step of `kind`.
#[must_use]
pub fn step_name(kind: OperationKind, index: u32) -> &'static str {
    match kind {
        OperationKind::Pack => PackStep::name_of(index),
        OperationKind::Unpack => UnpackStep::name_of(index),
        OperationKind::Compress | OperationKind::Decompress => CompressStep::name_of(index),
    }
}

// ── Admission ────────────────────────────────────────────────────────────────

/// How a state-changing command proceeds given the current ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Start the operation from its first step.
    Start,
    /// Continue an interrupted or failed operation from `step`.
    Resume { step: u32 },
    /// The path is already in the requested end state.
    AlreadyDone,
}

/// Decide whether `kind` may run against `entry`.
///
/// Must be called with the per-path lock held: an in-flight state observed
/// under the lock belongs to a process that died and is resumed.
///
/// # Errors
///
/// Returns [`PackError::NotManaged`] when a managed path is required and
/// [`PackError::InvalidState`] when the state forbids the command.
pub fn admit(
    kind: OperationKind,
    path: &Path,
    entry: Option<&ManagedPath>,
) -> Result<Admission, PackError> {
    let Some(entry) = entry else {
        return match kind {
            OperationKind::Pack => Ok(Admission::Start),
            _ => Err(PackError::NotManaged {
                path: path.to_path_buf(),
            }),
        };
    };

    let pending = entry.pending_operation.as_ref();
    let same_kind = pending.is_some_and(|p| p.kind == kind);
    let invalid = || PackError::InvalidState {
        path: path.to_path_buf(),
        state: describe(entry),
        operation: kind.verb().to_string(),
    };

    match (&entry.state, kind) {
        (PathState::Failed { resume_step, .. }, _) if same_kind => Ok(match resume_step {
            Some(step) => Admission::Resume { step: *step },
            None => Admission::Start,
        }),
        (state, _) if state.is_in_flight() => match pending {
            Some(p) if p.kind == kind => Ok(Admission::Resume { step: p.step }),
            _ => Err(invalid()),
        },
        (PathState::Unpacked, OperationKind::Pack)
        | (PathState::Packed, OperationKind::Unpack) => Ok(Admission::Start),
        (PathState::Packed, OperationKind::Pack) => Ok(Admission::AlreadyDone),
        (PathState::Packed, OperationKind::Compress) => Ok(if entry.compressed {
            Admission::AlreadyDone
        } else {
            Admission::Start
        }),
        (PathState::Packed, OperationKind::Decompress) => Ok(if entry.compressed {
            Admission::Start
        } else {
            Admission::AlreadyDone
        }),
        _ => Err(invalid()),
    }
}

fn describe(entry: &ManagedPath) -> String {
    match entry.pending_operation.as_ref() {
        Some(p) if !entry.state.is_in_flight() => {
            format!("{} (interrupted {})", entry.state.label(), p.kind)
        }
        _ => entry.state.label().to_string(),
    }
}

/// In-flight state entered when `kind` starts.
#[must_use]
pub fn in_flight_state(kind: OperationKind) -> PathState {
    match kind {
        OperationKind::Pack => PathState::Packing,
        OperationKind::Unpack => PathState::Unpacking,
        OperationKind::Compress => PathState::Compressing,
        OperationKind::Decompress => PathState::Decompressing,
    }
}
