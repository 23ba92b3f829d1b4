//! RP2040 serial bootloader protocol.

pub mod client;
pub mod crc;
pub mod frame;
pub mod geometry;

// Re-export common types
pub use client::{Bootloader, BootloaderClient};
pub use frame::{Command, CommandFrame, Status};
pub use geometry::FlashGeometry;
