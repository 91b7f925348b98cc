//! The five synthesis stage inferences.
//!
//! Each stage owns its backend session(s) and follows the same lifecycle: a
//! fresh stage is `Created`, `initialize` opens its sessions and moves it to
//! `Idle`, a successful `start` runs `Running -> Idle`, any error lands in
//! `Failed` and `stop` lands in `Terminated`. A `Failed` stage must be
//! reinitialized before it can run again.
//!
//! Many threads may observe a stage's `state()` and `result()`; only one may
//! drive `initialize`/`start`/`stop` at a time. The session handles live
//! behind an exclusive lock, cached results behind a shared one.

pub mod acoustic;
pub mod duration;
pub mod pitch;
pub mod variance;
pub mod vocoder;

use std::sync::RwLock;

use super::error::{DiffSingerError, Result};

pub use acoustic::{AcousticInference, AcousticResult, AcousticStartInput};
pub use duration::{DurationInference, DurationResult, DurationStartInput};
pub use pitch::{PitchInference, PitchResult, PitchStartInput};
pub use variance::{VarianceInference, VarianceResult, VarianceStartInput};
pub use vocoder::{VocoderInference, VocoderResult, VocoderStartInput};

/// Stage class of an inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Duration,
    Pitch,
    Variance,
    Acoustic,
    Vocoder,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Duration,
        StageKind::Pitch,
        StageKind::Variance,
        StageKind::Acoustic,
        StageKind::Vocoder,
    ];

    /// API name of the stage, used in descriptors and error messages.
    pub fn api_name(self) -> &'static str {
        match self {
            StageKind::Duration => "duration",
            StageKind::Pitch => "pitch",
            StageKind::Variance => "variance",
            StageKind::Acoustic => "acoustic",
            StageKind::Vocoder => "vocoder",
        }
    }

    pub fn from_class(class: &str) -> Option<StageKind> {
        StageKind::ALL.iter().copied().find(|k| k.api_name() == class)
    }
}

/// Execution state of a stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed but not yet initialized.
    Created,
    Idle,
    Running,
    Failed,
    Terminated,
}

/// Initialization arguments, tagged by the stage they are meant for.
///
/// Stages reject arguments of the wrong kind at dispatch, so a caller wiring
/// stages together cannot cross them accidentally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskInitArgs {
    Duration,
    Pitch,
    Variance,
    Acoustic,
    Vocoder,
}

impl TaskInitArgs {
    pub fn kind(self) -> StageKind {
        match self {
            TaskInitArgs::Duration => StageKind::Duration,
            TaskInitArgs::Pitch => StageKind::Pitch,
            TaskInitArgs::Variance => StageKind::Variance,
            TaskInitArgs::Acoustic => StageKind::Acoustic,
            TaskInitArgs::Vocoder => StageKind::Vocoder,
        }
    }
}

/// Checks init args against the stage kind they were dispatched to.
pub(crate) fn check_init_args(expected: StageKind, args: &TaskInitArgs) -> Result<()> {
    if args.kind() == expected {
        Ok(())
    } else {
        Err(DiffSingerError::InvalidArgument(format!(
            "invalid {} task init args name: expected \"{}\", got \"{}\"",
            expected.api_name(),
            expected.api_name(),
            args.kind().api_name()
        )))
    }
}

/// Locks a stage's inner state for reading, surviving poisoning: a panicked
/// run leaves the stage `Failed`, not unusable.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Shared-readable stage state.
pub(crate) struct StateCell(RwLock<TaskState>);

impl StateCell {
    pub(crate) fn new() -> StateCell {
        StateCell(RwLock::new(TaskState::Created))
    }

    pub(crate) fn get(&self) -> TaskState {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set(&self, state: TaskState) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = state;
    }
}
