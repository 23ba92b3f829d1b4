//! Progress reporting for the update flow.

use std::fmt;

/// Phase of an update, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Phase {
    /// Checking whether the coprocessor runs its bootloader.
    Detecting,
    /// Waiting for the bootloader to answer `SYNC`.
    Syncing,
    /// Reading the flash geometry.
    QueryingInfo,
    /// Erasing the application region.
    Erasing,
    /// Transferring image blocks.
    Writing,
    /// Committing the image.
    Sealing,
    /// Starting the new application.
    Jumping,
    /// Update finished.
    Done,
    /// Update failed.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detecting => "detecting",
            Self::Syncing => "syncing",
            Self::QueryingInfo => "querying info",
            Self::Erasing => "erasing",
            Self::Writing => "writing",
            Self::Sealing => "sealing",
            Self::Jumping => "jumping",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Receives progress updates.
///
/// `percentage` is only set while image blocks are transferred.
pub trait ProgressSink {
    /// Report entering or advancing a phase.
    fn report(&mut self, phase: Phase, message: &str, percentage: Option<u8>);
}

impl<F> ProgressSink for F
where
    F: FnMut(Phase, &str, Option<u8>),
{
    fn report(&mut self, phase: Phase, message: &str, percentage: Option<u8>) {
        self(phase, message, percentage);
    }
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&mut self, _phase: Phase, _message: &str, _percentage: Option<u8>) {}
}

/// Percentage of `done` out of `total`, clamped to 100.
#[allow(clippy::cast_possible_truncation)]
pub fn percentage(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    (u64::from(done) * 100 / u64::from(total)).min(100) as u8
}
