//! # coflash
//!
//! A library for updating an RP2040 coprocessor through its serial
//! bootloader.
//!
//! This crate provides the host side of the update:
//!
//! - Serial port access and device discovery
//! - The bootloader wire protocol (`SYNC`, `INFO`, `ERAS`, `WRIT`, `SEAL`, `GOGO`)
//! - An update session with per-block CRC-32 verification and resync
//! - An orchestrator that checks whether an update is needed and decides
//!   what the host does afterwards
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use coflash::{
//!     AssumeBootloader, BootloaderClient, FirmwareImage, HostControl, NullProgress,
//!     UpdateConfig, UpdateOrchestrator,
//! };
//!
//! struct Host;
//!
//! impl HostControl for Host {
//!     fn restart(&mut self) {}
//!     fn hold(&mut self) {}
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let client = BootloaderClient::open("/dev/ttyACM0", 921_600)?;
//!         let mut orchestrator = UpdateOrchestrator::new(
//!             AssumeBootloader::default(),
//!             client,
//!             NullProgress,
//!             Host,
//!             UpdateConfig::default(),
//!         );
//!         let report = orchestrator.run(&image);
//!         println!("{:?}", report.outcome);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coprocessor;
pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod update;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    coprocessor::{APP_BASE, AssumeBootloader, BOOTLOADER_READY, BOOTLOADER_SENTINEL, Coprocessor},
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    error::{Error, Result},
    image::FirmwareImage,
    port::{Port, SerialConfig},
    progress::{NullProgress, Phase, ProgressSink},
    protocol::{Bootloader, BootloaderClient, FlashGeometry},
    session::{
        BootloaderSession, FailureReason, SessionConfig, SessionOutcome, SessionReport,
        retry::{Backoff, RetryPolicy},
    },
    transport::{PortTransport, Transport},
    update::{
        FailureAction, FailurePolicy, HostAction, HostControl, UpdateConfig, UpdateOrchestrator,
        UpdateOutcome, UpdateReport,
    },
};
