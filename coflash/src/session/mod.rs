//! Bootloader update session.
//!
//! The session drives one update from handshake to jump. Every state carries
//! only the data it needs, and each step consumes the previous state:
//!
//! ```text
//!   Idle
//!    |
//!    v
//!   Syncing ----------------(policy exhausted)--------------.
//!    |                                                       |
//!    v                                                       |
//!   QueryingInfo -----------(error / bad geometry)----------+
//!    |                                                       |
//!    v                                                       |
//!   Erasing ----------------(rejected / too large)----------+
//!    |                                                       |
//!    v                                                       |
//!   Writing <--. CRC mismatch: resync, same block            |
//!    |   '-----'  ----------(resync exhausted)--------------+
//!    v                                                       |
//!   Sealing ----------------(rejected)----------------------+
//!    |                                                       v
//!    v                                                 Done(Failed)
//!   Jumping
//!    |
//!    v
//!   Done(Success)
//! ```
//!
//! Only the write loop recovers from errors. Info, erase and seal are
//! attempted once; an update that fails anywhere starts over at `Syncing`.

pub mod retry;
pub mod transfer;

use crate::coprocessor::APP_BASE;
use crate::image::FirmwareImage;
use crate::progress::{Phase, ProgressSink, percentage};
use crate::protocol::client::Bootloader;
use crate::protocol::geometry::FlashGeometry;
use log::{debug, error, info, warn};
use retry::RetryPolicy;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use transfer::TransferState;

/// Interval between `SYNC` attempts while waiting for the bootloader.
pub const SYNC_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between `SYNC` attempts after a failed block write.
pub const RESYNC_INTERVAL: Duration = Duration::from_millis(20);

/// Pause after a successful seal, before jumping to the application.
pub const JUMP_DELAY: Duration = Duration::from_secs(2);

/// Headline shown above every failure cause.
pub const FAILURE_SUMMARY: &str = "RP2040 update failed";

/// Session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Policy for the initial handshake.
    pub sync: RetryPolicy,
    /// Policy for re-establishing sync after a failed block.
    pub resync: RetryPolicy,
    /// Pause between a successful seal and `GOGO`.
    pub jump_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync: RetryPolicy::fixed(SYNC_INTERVAL),
            resync: RetryPolicy::fixed(RESYNC_INTERVAL),
            jump_delay: JUMP_DELAY,
        }
    }
}

/// Why an update failed.
///
/// `Display` renders the cause line; [`FailureReason::summary`] is the
/// headline above it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// The application firmware version could not be read.
    #[error("Failed to read firmware version")]
    FirmwareVersion,
    /// The bootloader version could not be read.
    #[error("Communication error (1)")]
    BootloaderVersion,
    /// The bootloader state could not be read.
    #[error("Communication error (2)")]
    BootloaderState,
    /// The bootloader reported a state past ready.
    #[error("Unknown BL state 0x{0:02X}")]
    UnknownBootloaderState(u8),
    /// A bounded sync policy ran out.
    #[error("No bootloader sync after {attempts} attempts")]
    SyncExhausted {
        /// Sync attempts made.
        attempts: u32,
    },
    /// The geometry query failed or returned an unusable layout.
    #[error("Failed to read information")]
    InfoQuery,
    /// The padded image does not fit in the application region.
    #[error("Image of {image_len} bytes ({padded_len} bytes padded) exceeds {capacity} bytes of flash")]
    ImageTooLarge {
        /// Image length in bytes.
        image_len: u32,
        /// Image length padded to whole write blocks.
        padded_len: u64,
        /// Erase-aligned application space.
        capacity: u32,
    },
    /// The bootloader rejected the erase.
    #[error("Failed to erase flash")]
    Erase,
    /// A block kept failing verification and resync gave up.
    #[error("Write failed @ 0x{address:08X}")]
    WriteCrcMismatch {
        /// Flash address of the block.
        address: u32,
        /// Resync attempts made before giving up.
        attempts: u32,
    },
    /// The bootloader rejected the sealed image.
    #[error("Failed to seal image")]
    Seal,
}

impl FailureReason {
    /// Headline line of the failure message.
    pub fn summary(&self) -> &'static str {
        FAILURE_SUMMARY
    }

    /// Cause line of the failure message.
    pub fn cause(&self) -> String {
        self.to_string()
    }
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The image was sealed and the jump issued.
    Success,
    /// The session stopped early.
    Failed(FailureReason),
}

impl SessionOutcome {
    /// Whether the session succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Geometry reported by the bootloader, if it got that far.
    pub geometry: Option<FlashGeometry>,
    /// Transfer state when the write loop ended.
    pub transfer: TransferState,
    /// Attempts needed for the initial sync.
    pub sync_attempts: u32,
    /// `WRIT` commands sent, retries included.
    pub write_attempts: u32,
    /// Blocks that needed a resync.
    pub resyncs: u32,
}

enum State {
    Idle,
    Syncing,
    QueryingInfo,
    Erasing {
        geometry: FlashGeometry,
        erase_length: u32,
    },
    Writing {
        geometry: FlashGeometry,
        transfer: TransferState,
    },
    Sealing {
        geometry: FlashGeometry,
        transfer: TransferState,
    },
    Jumping {
        entry: u32,
    },
    Done(SessionOutcome),
}

/// One update run against a bootloader.
pub struct BootloaderSession<'a, B: Bootloader, S: ProgressSink + ?Sized> {
    bootloader: B,
    progress: &'a mut S,
    image: &'a FirmwareImage,
    config: SessionConfig,
    geometry: Option<FlashGeometry>,
    transfer: TransferState,
    sync_attempts: u32,
    write_attempts: u32,
    resyncs: u32,
}

impl<'a, B: Bootloader, S: ProgressSink + ?Sized> BootloaderSession<'a, B, S> {
    /// Create a session for `image`.
    pub fn new(
        bootloader: B,
        progress: &'a mut S,
        image: &'a FirmwareImage,
        config: SessionConfig,
    ) -> Self {
        Self {
            bootloader,
            progress,
            image,
            config,
            geometry: None,
            transfer: TransferState::new(),
            sync_attempts: 0,
            write_attempts: 0,
            resyncs: 0,
        }
    }

    /// Run the session to completion.
    pub fn run(mut self) -> SessionReport {
        let mut state = State::Idle;
        let outcome = loop {
            state = match self.step(state) {
                State::Done(outcome) => break outcome,
                next => next,
            };
        };

        if let SessionOutcome::Failed(reason) = &outcome {
            error!("{}: {reason}", reason.summary());
            self.progress
                .report(Phase::Failed, &reason.cause(), None);
        } else {
            self.progress
                .report(Phase::Done, "Update complete", Some(100));
        }

        SessionReport {
            outcome,
            geometry: self.geometry,
            transfer: self.transfer,
            sync_attempts: self.sync_attempts,
            write_attempts: self.write_attempts,
            resyncs: self.resyncs,
        }
    }

    fn step(&mut self, state: State) -> State {
        match state {
            State::Idle => State::Syncing,
            State::Syncing => self.sync(),
            State::QueryingInfo => self.query_info(),
            State::Erasing {
                geometry,
                erase_length,
            } => self.erase(geometry, erase_length),
            State::Writing { geometry, transfer } => self.write_block(geometry, transfer),
            State::Sealing { geometry, transfer } => self.seal(&geometry, &transfer),
            State::Jumping { entry } => self.jump(entry),
            State::Done(outcome) => State::Done(outcome),
        }
    }

    fn sync(&mut self) -> State {
        self.progress
            .report(Phase::Syncing, "Waiting for bootloader sync", None);

        let policy = self.config.sync;
        let bootloader = &mut self.bootloader;
        match policy.poll(|attempt| try_sync(&mut *bootloader, attempt)) {
            Ok(((), attempts)) => {
                info!("Bootloader synced after {attempts} attempt(s)");
                self.sync_attempts = attempts;
                State::QueryingInfo
            },
            Err(exhausted) => {
                self.sync_attempts = exhausted.attempts;
                State::Done(SessionOutcome::Failed(FailureReason::SyncExhausted {
                    attempts: exhausted.attempts,
                }))
            },
        }
    }

    fn query_info(&mut self) -> State {
        self.progress
            .report(Phase::QueryingInfo, "Reading flash information", None);

        let geometry = match self
            .bootloader
            .get_info()
            .and_then(|geometry| {
                geometry.validate()?;
                Ok(geometry)
            }) {
            Ok(geometry) => geometry,
            Err(e) => {
                warn!("Geometry query failed: {e}");
                return State::Done(SessionOutcome::Failed(FailureReason::InfoQuery));
            },
        };
        info!("Bootloader geometry: {geometry}");
        self.geometry = Some(geometry);

        if geometry.flash_start != APP_BASE {
            warn!(
                "Bootloader flash start 0x{:08X} differs from application base 0x{APP_BASE:08X}",
                geometry.flash_start
            );
        }

        let image_len = self.image.len();
        match geometry.erase_length(image_len) {
            Some(erase_length) => State::Erasing {
                geometry,
                erase_length,
            },
            None => State::Done(SessionOutcome::Failed(FailureReason::ImageTooLarge {
                image_len,
                padded_len: geometry.padded_length(image_len),
                capacity: geometry.aligned_capacity(),
            })),
        }
    }

    fn erase(&mut self, geometry: FlashGeometry, erase_length: u32) -> State {
        self.progress
            .report(Phase::Erasing, "Erasing flash", None);

        match self
            .bootloader
            .erase(geometry.flash_start, erase_length)
        {
            Ok(true) => {
                debug!("Erased {erase_length:#x} bytes");
                State::Writing {
                    geometry,
                    transfer: TransferState::new(),
                }
            },
            Ok(false) => State::Done(SessionOutcome::Failed(FailureReason::Erase)),
            Err(e) => {
                warn!("Erase failed: {e}");
                State::Done(SessionOutcome::Failed(FailureReason::Erase))
            },
        }
    }

    fn write_block(&mut self, geometry: FlashGeometry, mut transfer: TransferState) -> State {
        let Some(block) = transfer.next_block(self.image, geometry.write_size) else {
            self.transfer = transfer;
            return State::Sealing { geometry, transfer };
        };

        let address = geometry.flash_start + block.offset;
        self.progress.report(
            Phase::Writing,
            &format!("Writing @ 0x{address:08X}"),
            Some(percentage(transfer.position, self.image.len())),
        );

        self.write_attempts += 1;
        let verified = match self
            .bootloader
            .write(address, &block.data)
        {
            Ok(Some(device_crc)) if device_crc == block.crc => true,
            Ok(Some(device_crc)) => {
                warn!(
                    "CRC mismatch @ 0x{address:08X}: expected 0x{:08X}, device 0x{device_crc:08X}",
                    block.crc
                );
                false
            },
            Ok(None) => {
                warn!("Write rejected @ 0x{address:08X}");
                false
            },
            Err(e) => {
                warn!("Write failed @ 0x{address:08X}: {e}");
                false
            },
        };

        if verified {
            transfer.commit(&block);
            self.transfer = transfer;
            return State::Writing { geometry, transfer };
        }

        self.resyncs += 1;
        let policy = self.config.resync;
        let bootloader = &mut self.bootloader;
        match policy.poll(|attempt| try_sync(&mut *bootloader, attempt)) {
            Ok(_) => State::Writing { geometry, transfer },
            Err(exhausted) => {
                self.transfer = transfer;
                State::Done(SessionOutcome::Failed(FailureReason::WriteCrcMismatch {
                    address,
                    attempts: exhausted.attempts,
                }))
            },
        }
    }

    fn seal(&mut self, geometry: &FlashGeometry, transfer: &TransferState) -> State {
        self.progress
            .report(Phase::Sealing, "Sealing...", None);

        let entry = geometry.flash_start;
        let sealed = match self.bootloader.seal(
            geometry.flash_start,
            entry,
            transfer.total_written,
            transfer.running_image_crc,
        ) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Seal failed: {e}");
                false
            },
        };

        let result = if sealed { "Result: OK" } else { "Result: FAIL" };
        self.progress
            .report(Phase::Sealing, result, None);

        if sealed {
            info!(
                "Sealed {} bytes, crc 0x{:08X}",
                transfer.total_written, transfer.running_image_crc
            );
            State::Jumping { entry }
        } else {
            State::Done(SessionOutcome::Failed(FailureReason::Seal))
        }
    }

    fn jump(&mut self, entry: u32) -> State {
        if !self
            .config
            .jump_delay
            .is_zero()
        {
            thread::sleep(self.config.jump_delay);
        }

        self.progress
            .report(Phase::Jumping, "Waiting for reset...", None);
        if let Err(e) = self
            .bootloader
            .go(entry)
        {
            // The image is sealed, the bootloader boots it on the next reset
            warn!("Jump command failed: {e}");
        }
        State::Done(SessionOutcome::Success)
    }
}

fn try_sync<B: Bootloader>(bootloader: &mut B, attempt: u32) -> Option<()> {
    match bootloader.sync() {
        Ok(true) => Some(()),
        Ok(false) => {
            debug!("Sync attempt {attempt}: unexpected response");
            None
        },
        Err(e) => {
            debug!("Sync attempt {attempt}: {e}");
            None
        },
    }
}
