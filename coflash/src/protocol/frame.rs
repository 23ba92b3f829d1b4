//! RP2040 serial bootloader frame layout.
//!
//! ## Frame Format
//!
//! Every request starts with a four character ASCII opcode followed by
//! little-endian 32-bit arguments and, for `WRIT`, the raw block data:
//!
//! ```text
//! +----------+---------+---------+-----+----------------+
//! |  Opcode  |  Arg 0  |  Arg 1  | ... |  Data (WRIT)   |
//! +----------+---------+---------+-----+----------------+
//! |  4 bytes | u32 LE  | u32 LE  |     |  Arg 1 bytes   |
//! +----------+---------+---------+-----+----------------+
//! ```
//!
//! Responses start with a four byte status. `OKOK` is followed by the
//! command-specific result words, `ERR!` ends the response. `SYNC` is
//! answered with `PICO` instead, and `GOGO` is not answered at all.
//!
//! | Request                  | Response             |
//! |--------------------------|----------------------|
//! | `SYNC`                   | `PICO`               |
//! | `INFO`                   | `OKOK` + 5 × u32     |
//! | `ERAS` addr len          | `OKOK`               |
//! | `WRIT` addr len data     | `OKOK` + crc         |
//! | `SEAL` load entry len crc| `OKOK`               |
//! | `GOGO` entry             | -                    |

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};

/// Length of opcodes and status words.
pub const OPCODE_LEN: usize = 4;

/// Answer to a `SYNC` request.
pub const SYNC_RESPONSE: [u8; OPCODE_LEN] = *b"PICO";

/// Status word of an accepted request.
pub const STATUS_OK: [u8; OPCODE_LEN] = *b"OKOK";

/// Status word of a rejected request.
pub const STATUS_ERR: [u8; OPCODE_LEN] = *b"ERR!";

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Handshake probe.
    Sync,
    /// Flash geometry query.
    Info,
    /// Erase a flash range.
    Erase,
    /// Write one block.
    Write,
    /// Validate and commit the written image.
    Seal,
    /// Jump to the application.
    Go,
}

impl Command {
    /// Wire opcode of the command.
    pub fn opcode(self) -> [u8; OPCODE_LEN] {
        match self {
            Self::Sync => *b"SYNC",
            Self::Info => *b"INFO",
            Self::Erase => *b"ERAS",
            Self::Write => *b"WRIT",
            Self::Seal => *b"SEAL",
            Self::Go => *b"GOGO",
        }
    }

    /// Number of bytes following an `OKOK` status.
    pub fn result_len(self) -> usize {
        match self {
            Self::Info => 5 * 4,
            Self::Write => 4,
            Self::Sync | Self::Erase | Self::Seal | Self::Go => 0,
        }
    }
}

/// Command frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    cmd: Command,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame without arguments.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            data: Vec::new(),
        }
    }

    /// Create a sync frame.
    pub fn sync() -> Self {
        Self::new(Command::Sync)
    }

    /// Create a geometry query frame.
    pub fn info() -> Self {
        Self::new(Command::Info)
    }

    /// Create an erase frame for `[addr, addr + len)`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn erase(addr: u32, len: u32) -> Self {
        let mut frame = Self::new(Command::Erase);
        frame.data.write_u32::<LittleEndian>(addr).unwrap();
        frame.data.write_u32::<LittleEndian>(len).unwrap();
        frame
    }

    /// Create a write frame carrying `block` for `addr`.
    ///
    /// The length argument is the block length, so callers pad the block
    /// before building the frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(addr: u32, block: &[u8]) -> Self {
        let mut frame = Self::new(Command::Write);
        frame.data.reserve(8 + block.len());
        frame.data.write_u32::<LittleEndian>(addr).unwrap();
        // Blocks are bounded by the bootloader's max_data_len
        frame.data.write_u32::<LittleEndian>(block.len() as u32).unwrap();
        frame.data.extend_from_slice(block);
        frame
    }

    /// Create a seal frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn seal(load_addr: u32, entry_addr: u32, len: u32, crc: u32) -> Self {
        let mut frame = Self::new(Command::Seal);
        frame.data.write_u32::<LittleEndian>(load_addr).unwrap();
        frame.data.write_u32::<LittleEndian>(entry_addr).unwrap();
        frame.data.write_u32::<LittleEndian>(len).unwrap();
        frame.data.write_u32::<LittleEndian>(crc).unwrap();
        frame
    }

    /// Create a jump frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn go(entry_addr: u32) -> Self {
        let mut frame = Self::new(Command::Go);
        frame.data.write_u32::<LittleEndian>(entry_addr).unwrap();
        frame
    }

    /// Build the complete frame data.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OPCODE_LEN + self.data.len());
        buf.extend_from_slice(&self.cmd.opcode());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Get the command type.
    pub fn command(&self) -> Command {
        self.cmd
    }
}

/// Response status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `OKOK`: result words follow.
    Ok,
    /// `ERR!`: the bootloader rejected the request.
    Err,
}

impl Status {
    /// Decode a status word.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            b if b == STATUS_OK => Ok(Self::Ok),
            b if b == STATUS_ERR => Ok(Self::Err),
            other => Err(Error::Protocol(format!(
                "unexpected status {:02X?} ({:?})",
                other,
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Read consecutive little-endian words from a result payload.
pub(crate) fn read_words<const N: usize>(bytes: &[u8]) -> Result<[u32; N]> {
    if bytes.len() < N * 4 {
        return Err(Error::Protocol(format!(
            "result too short: {} bytes, expected {}",
            bytes.len(),
            N * 4
        )));
    }
    let mut words = [0u32; N];
    for (word, chunk) in words
        .iter_mut()
        .zip(bytes.chunks_exact(4))
    {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(words)
}
