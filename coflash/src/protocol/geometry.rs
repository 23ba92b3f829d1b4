//! Flash layout reported by the bootloader.

use crate::error::{Error, Result};
use crate::protocol::frame::read_words;

/// Flash geometry returned by the `INFO` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashGeometry {
    /// First address the bootloader lets the host program.
    pub flash_start: u32,
    /// Size of the programmable region in bytes.
    pub flash_size: u32,
    /// Erase granularity in bytes.
    pub erase_size: u32,
    /// Size of every `WRIT` block in bytes.
    pub write_size: u32,
    /// Largest payload a single request may carry.
    pub max_data_len: u32,
}

impl FlashGeometry {
    /// Size of the `INFO` result payload.
    pub const WIRE_LEN: usize = 20;

    /// Decode the `INFO` result payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let [flash_start, flash_size, erase_size, write_size, max_data_len] =
            read_words::<5>(bytes)?;
        Ok(Self {
            flash_start,
            flash_size,
            erase_size,
            write_size,
            max_data_len,
        })
    }

    /// Check that the layout can be used for an update.
    pub fn validate(&self) -> Result<()> {
        if self.write_size == 0 {
            return Err(Error::InvalidGeometry("write size is zero".into()));
        }
        if self.erase_size == 0 {
            return Err(Error::InvalidGeometry("erase size is zero".into()));
        }
        if self.flash_size <= self.erase_size {
            return Err(Error::InvalidGeometry(format!(
                "flash size {:#x} leaves no room after one {:#x} erase block",
                self.flash_size, self.erase_size
            )));
        }
        if self.write_size > self.max_data_len {
            return Err(Error::InvalidGeometry(format!(
                "write size {} exceeds max data length {}",
                self.write_size, self.max_data_len
            )));
        }
        if self
            .flash_start
            .checked_add(self.flash_size)
            .is_none()
        {
            return Err(Error::InvalidGeometry(format!(
                "flash region {:#010x}+{:#x} overflows the address space",
                self.flash_start, self.flash_size
            )));
        }
        Ok(())
    }

    /// Application space: the flash region minus the reserved last erase
    /// block.
    pub fn capacity(&self) -> u32 {
        self.flash_size
            .saturating_sub(self.erase_size)
    }

    /// [`capacity`](Self::capacity) rounded down to whole erase blocks.
    pub fn aligned_capacity(&self) -> u32 {
        self.capacity()
            .checked_div(self.erase_size)
            .map_or(0, |blocks| blocks * self.erase_size)
    }

    /// Number of `WRIT` blocks needed for an image of `image_len` bytes.
    pub fn block_count(&self, image_len: u32) -> u32 {
        image_len.div_ceil(self.write_size)
    }

    /// Bytes sent for an image of `image_len` bytes once every block is
    /// padded to `write_size`.
    pub fn padded_length(&self, image_len: u32) -> u64 {
        u64::from(self.block_count(image_len)) * u64::from(self.write_size)
    }

    /// Bytes to erase before writing an image of `image_len` bytes.
    ///
    /// The result covers every padded block, is a multiple of `erase_size`
    /// and never exceeds [`aligned_capacity`](Self::aligned_capacity).
    /// Returns `None` when the padded image does not fit.
    pub fn erase_length(&self, image_len: u32) -> Option<u32> {
        let padded = self.padded_length(image_len);
        if padded > u64::from(self.aligned_capacity()) {
            return None;
        }
        let erase_size = u64::from(self.erase_size);
        u32::try_from(padded.div_ceil(erase_size) * erase_size).ok()
    }
}

impl std::fmt::Display for FlashGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "flash {:#010x}..{:#010x} ({} KiB), erase {} B, write {} B, max data {} B",
            self.flash_start,
            u64::from(self.flash_start) + u64::from(self.flash_size),
            self.flash_size / 1024,
            self.erase_size,
            self.write_size,
            self.max_data_len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(flash_size: u32, erase_size: u32, write_size: u32) -> FlashGeometry {
        FlashGeometry {
            flash_start: 0x1001_0000,
            flash_size,
            erase_size,
            write_size,
            max_data_len: write_size,
        }
    }

    #[test]
    fn test_from_bytes() {
        let mut raw = Vec::new();
        for word in [0x1001_0000u32, 0x001F_0000, 4096, 256, 1024] {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        let geo = FlashGeometry::from_bytes(&raw).unwrap();
        assert_eq!(geo.flash_start, 0x1001_0000);
        assert_eq!(geo.flash_size, 0x001F_0000);
        assert_eq!(geo.erase_size, 4096);
        assert_eq!(geo.write_size, 256);
        assert_eq!(geo.max_data_len, 1024);
        assert!(geo.validate().is_ok());
    }

    #[test]
    fn test_from_bytes_short() {
        assert!(FlashGeometry::from_bytes(&[0; 16]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        assert!(geometry(0x10000, 4096, 0).validate().is_err());
        assert!(geometry(0x10000, 0, 256).validate().is_err());
        assert!(geometry(4096, 4096, 256).validate().is_err());

        let mut geo = geometry(0x10000, 4096, 256);
        geo.max_data_len = 128;
        assert!(matches!(geo.validate(), Err(Error::InvalidGeometry(_))));

        let mut geo = geometry(0x10000, 4096, 256);
        geo.flash_start = u32::MAX - 0x100;
        assert!(geo.validate().is_err());
    }

    #[test]
    fn test_erase_length_small_image() {
        let geo = geometry(0x10000, 4096, 1024);
        assert_eq!(geo.block_count(2500), 3);
        assert_eq!(geo.erase_length(2500), Some(4096));
    }

    #[test]
    fn test_erase_length_aligned_image() {
        let geo = geometry(0x10000, 4096, 1024);
        assert_eq!(geo.erase_length(8192), Some(8192));
        assert_eq!(geo.erase_length(8193), Some(12288));
    }

    #[test]
    fn test_erase_length_properties() {
        let geo = geometry(0x20000, 4096, 256);
        for len in [1u32, 255, 256, 4095, 4096, 4097, 50_000, 0x1F000] {
            let erase = geo
                .erase_length(len)
                .unwrap();
            assert_eq!(erase % geo.erase_size, 0, "len {len}");
            assert!(erase >= len, "len {len}");
            assert!(erase <= geo.capacity(), "len {len}");
        }
    }

    #[test]
    fn test_erase_length_too_large() {
        let geo = geometry(0x10000, 4096, 1024);
        assert_eq!(geo.erase_length(geo.capacity()), Some(geo.capacity()));
        assert_eq!(geo.erase_length(geo.capacity() + 1), None);
    }

    #[test]
    fn test_padding_can_overflow_capacity() {
        // 21 blocks of 3000 bytes no longer fit in 60 KiB
        let geo = geometry(0x10000, 4096, 3000);
        assert_eq!(geo.aligned_capacity(), 61_440);
        assert_eq!(geo.padded_length(61_440), 63_000);
        assert_eq!(geo.erase_length(61_440), None);
        assert_eq!(geo.erase_length(60_000), Some(61_440));
    }

    #[test]
    fn test_unaligned_flash_size() {
        let geo = geometry(0x10800, 4096, 1024);
        assert_eq!(geo.capacity(), 0xF800);
        assert_eq!(geo.aligned_capacity(), 0xF000);
        assert_eq!(geo.erase_length(0xF000), Some(0xF000));
        assert_eq!(geo.erase_length(0xF001), None);
    }
}
