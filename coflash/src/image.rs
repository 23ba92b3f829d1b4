//! Raw firmware images.

use crate::error::{Error, Result};
use crate::protocol::crc::crc32;
use log::debug;
use std::fs;
use std::path::Path;

/// Raw application image, as linked for the coprocessor's load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    len: u32,
}

impl FirmwareImage {
    /// Wrap image bytes.
    ///
    /// Empty images and images longer than `u32::MAX` are rejected.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        let len = u32::try_from(data.len()).map_err(|_| {
            Error::InvalidImage(format!("image is too large ({} bytes)", data.len()))
        })?;
        Ok(Self { data, len })
    }

    /// Load an image from a `.bin` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data)
    }

    /// Image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Always `false`; empty images cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CRC-32 of the unpadded image.
    pub fn crc32(&self) -> u32 {
        crc32(&self.data)
    }
}

impl AsRef<[u8]> for FirmwareImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
