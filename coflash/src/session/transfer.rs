//! Block bookkeeping for the write loop.

use crate::image::FirmwareImage;
use crate::protocol::crc::{crc32, crc32_update};

/// Progress of the image transfer.
///
/// `position` only advances when the device confirmed a block with a
/// matching CRC, so retrying a block never changes the running checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Image bytes confirmed so far.
    pub position: u32,
    /// CRC-32 of the block currently in flight.
    pub block_crc: u32,
    /// CRC-32 over every confirmed padded block, in order.
    pub running_image_crc: u32,
    /// Padded bytes confirmed so far.
    pub total_written: u32,
}

/// One zero-padded block ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Offset of the block from the start of the image.
    pub offset: u32,
    /// Image bytes carried by the block.
    pub chunk_len: u32,
    /// Block data, padded with zeros to the write size.
    pub data: Vec<u8>,
    /// CRC-32 of `data`.
    pub crc: u32,
}

impl TransferState {
    /// Fresh state at the start of the image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next block, or `None` once the whole image is confirmed.
    pub fn next_block(&mut self, image: &FirmwareImage, write_size: u32) -> Option<Block> {
        let chunk_len = write_size.min(image.len() - self.position);
        if chunk_len == 0 {
            return None;
        }

        let start = self.position as usize;
        let mut data = vec![0u8; write_size as usize];
        data[..chunk_len as usize]
            .copy_from_slice(&image.as_bytes()[start..start + chunk_len as usize]);

        let crc = crc32(&data);
        self.block_crc = crc;
        Some(Block {
            offset: self.position,
            chunk_len,
            data,
            crc,
        })
    }

    /// Record a block the device confirmed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn commit(&mut self, block: &Block) {
        debug_assert_eq!(block.offset, self.position);
        self.position += block.chunk_len;
        self.running_image_crc = crc32_update(self.running_image_crc, &block.data);
        // Blocks are at most write_size long
        self.total_written += block.data.len() as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> FirmwareImage {
        let data = (0..len)
            .map(|i| (i % 251) as u8)
            .collect();
        FirmwareImage::from_bytes(data).unwrap()
    }

    #[test]
    fn test_block_count_and_padding() {
        let image = image(2500);
        let mut state = TransferState::new();
        let mut blocks = Vec::new();

        while let Some(block) = state.next_block(&image, 1024) {
            state.commit(&block);
            blocks.push(block);
        }

        assert_eq!(blocks.len(), 3);
        assert_eq!(
            blocks
                .iter()
                .map(|b| b.chunk_len)
                .collect::<Vec<_>>(),
            vec![1024, 1024, 452]
        );
        assert!(blocks.iter().all(|b| b.data.len() == 1024));
        assert!(blocks[2].data[452..].iter().all(|&b| b == 0));
        assert_eq!(&blocks[2].data[..452], &image.as_bytes()[2048..]);
        assert_eq!(state.position, 2500);
        assert_eq!(state.total_written, 3072);
        assert!(state.next_block(&image, 1024).is_none());
    }

    #[test]
    fn test_running_crc_covers_padded_blocks() {
        let image = image(2500);
        let mut state = TransferState::new();
        let mut padded = Vec::new();

        while let Some(block) = state.next_block(&image, 1024) {
            padded.extend_from_slice(&block.data);
            state.commit(&block);
        }

        assert_eq!(padded.len(), 3072);
        assert_eq!(state.running_image_crc, crc32(&padded));
    }

    #[test]
    fn test_uncommitted_block_is_rebuilt_identically() {
        let image = image(3000);
        let mut state = TransferState::new();

        let first = state
            .next_block(&image, 1024)
            .unwrap();
        state.commit(&first);

        let attempt = state
            .next_block(&image, 1024)
            .unwrap();
        let retry = state
            .next_block(&image, 1024)
            .unwrap();
        assert_eq!(attempt, retry);
        assert_eq!(state.position, 1024);
        assert_eq!(state.block_crc, retry.crc);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let image = image(2048);
        let mut state = TransferState::new();
        let mut count = 0;
        while let Some(block) = state.next_block(&image, 1024) {
            assert_eq!(block.chunk_len, 1024);
            state.commit(&block);
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(state.total_written, 2048);
    }
}
