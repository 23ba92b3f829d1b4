//! Coprocessor control interface.
//!
//! Besides the bootloader UART, the host reads a few status registers over a
//! separate control channel. They tell whether the coprocessor runs its
//! application or the bootloader, and when the bootloader is ready for
//! `SYNC`.

use crate::error::Result;

/// Firmware version reported while the bootloader is running.
pub const BOOTLOADER_SENTINEL: u8 = 0xFF;

/// Bootloader state meaning "ready for the serial protocol".
pub const BOOTLOADER_READY: u8 = 0xB0;

/// Load and entry address of the application image.
///
/// The first 64 KiB of flash hold the bootloader.
pub const APP_BASE: u32 = 0x1001_0000;

/// Status registers of the coprocessor.
pub trait Coprocessor {
    /// Application firmware version, or [`BOOTLOADER_SENTINEL`].
    fn firmware_version(&mut self) -> Result<u8>;

    /// Bootloader version.
    fn bootloader_version(&mut self) -> Result<u8>;

    /// Bootloader state; [`BOOTLOADER_READY`] once it accepts commands.
    fn bootloader_state(&mut self) -> Result<u8>;
}

impl<C: Coprocessor + ?Sized> Coprocessor for &mut C {
    fn firmware_version(&mut self) -> Result<u8> {
        (**self).firmware_version()
    }

    fn bootloader_version(&mut self) -> Result<u8> {
        (**self).bootloader_version()
    }

    fn bootloader_state(&mut self) -> Result<u8> {
        (**self).bootloader_state()
    }
}

/// Probe for hosts without a control channel.
///
/// Reports the bootloader as running and ready, so the update goes straight
/// to `SYNC`. Used when the coprocessor was put into its bootloader by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeBootloader {
    /// Bootloader version to report.
    pub version: u8,
}

impl Coprocessor for AssumeBootloader {
    fn firmware_version(&mut self) -> Result<u8> {
        Ok(BOOTLOADER_SENTINEL)
    }

    fn bootloader_version(&mut self) -> Result<u8> {
        Ok(self.version)
    }

    fn bootloader_state(&mut self) -> Result<u8> {
        Ok(BOOTLOADER_READY)
    }
}
