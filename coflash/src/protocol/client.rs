//! Request/response client for the RP2040 serial bootloader.
//!
//! [`Bootloader`] is the command set the update session drives.
//! [`BootloaderClient`] implements it over any [`Transport`]; test code
//! implements it directly with scripted fakes.

use crate::error::{Error, Result};
use crate::protocol::frame::{Command, CommandFrame, OPCODE_LEN, SYNC_RESPONSE, Status, read_words};
use crate::protocol::geometry::FlashGeometry;
use crate::transport::Transport;
use log::{debug, trace};
use std::time::Duration;

/// Timeout for the `PICO` answer to `SYNC`.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for the `INFO` response.
pub const INFO_TIMEOUT: Duration = Duration::from_millis(500);

/// Base timeout for `ERAS`; [`ERASE_TIMEOUT_PER_KIB`] is added per KiB.
pub const ERASE_TIMEOUT_BASE: Duration = Duration::from_secs(1);

/// Extra erase time allowed per KiB of flash.
pub const ERASE_TIMEOUT_PER_KIB: Duration = Duration::from_millis(25);

/// Timeout for one `WRIT` response.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for the `SEAL` response. Sealing re-reads the whole image.
pub const SEAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bootloader command set.
///
/// Every operation is a single exchange. `Ok(false)` / `Ok(None)` mean the
/// bootloader answered and rejected the request; `Err` means the exchange
/// itself failed.
pub trait Bootloader {
    /// Probe for the bootloader. Returns `true` when it answered `PICO`.
    fn sync(&mut self) -> Result<bool>;

    /// Query the flash geometry.
    fn get_info(&mut self) -> Result<FlashGeometry>;

    /// Erase `len` bytes starting at `addr`.
    fn erase(&mut self, addr: u32, len: u32) -> Result<bool>;

    /// Write one block at `addr`. Returns the CRC-32 the device computed
    /// over the received block, or `None` if the write was rejected.
    fn write(&mut self, addr: u32, block: &[u8]) -> Result<Option<u32>>;

    /// Validate and commit the written image.
    fn seal(&mut self, load_addr: u32, entry_addr: u32, len: u32, crc: u32) -> Result<bool>;

    /// Jump to the application. No response is expected.
    fn go(&mut self, entry_addr: u32) -> Result<()>;
}

impl<B: Bootloader + ?Sized> Bootloader for &mut B {
    fn sync(&mut self) -> Result<bool> {
        (**self).sync()
    }

    fn get_info(&mut self) -> Result<FlashGeometry> {
        (**self).get_info()
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<bool> {
        (**self).erase(addr, len)
    }

    fn write(&mut self, addr: u32, block: &[u8]) -> Result<Option<u32>> {
        (**self).write(addr, block)
    }

    fn seal(&mut self, load_addr: u32, entry_addr: u32, len: u32, crc: u32) -> Result<bool> {
        (**self).seal(load_addr, entry_addr, len, crc)
    }

    fn go(&mut self, entry_addr: u32) -> Result<()> {
        (**self).go(entry_addr)
    }
}

/// Timeout for erasing `len` bytes.
pub fn erase_timeout(len: u32) -> Duration {
    ERASE_TIMEOUT_BASE + ERASE_TIMEOUT_PER_KIB * len.div_ceil(1024)
}

/// [`Bootloader`] implementation speaking the serial wire protocol.
pub struct BootloaderClient<T: Transport> {
    transport: T,
}

impl<T: Transport> BootloaderClient<T> {
    /// Create a client on top of a transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a frame and read its status word.
    ///
    /// Returns the result payload after `OKOK`, or `None` after `ERR!`.
    fn command(&mut self, frame: &CommandFrame, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let cmd = frame.command();
        let data = frame.build();
        trace!("Sending {:?}: {} bytes", cmd, data.len());

        self.transport
            .send(&data)?;
        let status = self
            .transport
            .receive(OPCODE_LEN, timeout)?;

        match Status::parse(&status)? {
            Status::Ok => {
                let result_len = cmd.result_len();
                if result_len == 0 {
                    return Ok(Some(Vec::new()));
                }
                self.transport
                    .receive(result_len, timeout)
                    .map(Some)
            },
            Status::Err => {
                debug!("{cmd:?} rejected by bootloader");
                Ok(None)
            },
        }
    }
}

impl<T: Transport> Bootloader for BootloaderClient<T> {
    fn sync(&mut self) -> Result<bool> {
        self.transport
            .discard_input()?;
        let response = self
            .transport
            .exchange(&CommandFrame::sync().build(), OPCODE_LEN, SYNC_TIMEOUT)?;

        if response == SYNC_RESPONSE {
            Ok(true)
        } else {
            trace!("Unexpected sync response: {response:02X?}");
            Ok(false)
        }
    }

    fn get_info(&mut self) -> Result<FlashGeometry> {
        match self.command(&CommandFrame::info(), INFO_TIMEOUT)? {
            Some(payload) => {
                let geometry = FlashGeometry::from_bytes(&payload)?;
                debug!("Flash geometry: {geometry}");
                Ok(geometry)
            },
            None => Err(Error::Protocol("INFO rejected".into())),
        }
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<bool> {
        debug!("Erasing {len:#x} bytes at 0x{addr:08X}");
        let result = self.command(&CommandFrame::erase(addr, len), erase_timeout(len))?;
        Ok(result.is_some())
    }

    fn write(&mut self, addr: u32, block: &[u8]) -> Result<Option<u32>> {
        match self.command(&CommandFrame::write(addr, block), WRITE_TIMEOUT)? {
            Some(payload) => {
                let [crc] = read_words::<1>(&payload)?;
                Ok(Some(crc))
            },
            None => Ok(None),
        }
    }

    fn seal(&mut self, load_addr: u32, entry_addr: u32, len: u32, crc: u32) -> Result<bool> {
        debug!(
            "Sealing {len} bytes at 0x{load_addr:08X}, entry 0x{entry_addr:08X}, crc 0x{crc:08X}"
        );
        let frame = CommandFrame::seal(load_addr, entry_addr, len, crc);
        Ok(self
            .command(&frame, SEAL_TIMEOUT)?
            .is_some())
    }

    fn go(&mut self, entry_addr: u32) -> Result<()> {
        debug!("Jumping to 0x{entry_addr:08X}");
        self.transport
            .send(&CommandFrame::go(entry_addr).build())
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{BootloaderClient, Error, Result};
    use crate::port::{NativePort, SerialConfig};
    use crate::transport::PortTransport;
    use log::{debug, warn};
    use std::thread;
    use std::time::Duration;

    impl BootloaderClient<PortTransport<NativePort>> {
        /// Open a serial port and create a client on it.
        ///
        /// The coprocessor's USB CDC interface can take a moment to appear
        /// after a reset, so opening is retried a few times.
        pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                let config = SerialConfig::new(port_name, baud_rate);
                match NativePort::open(&config) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(PortTransport::new(port)));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or(Error::DeviceNotFound))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PortTransport;
    use crate::transport::mock::MockPort;

    fn client(response: &[u8]) -> BootloaderClient<PortTransport<MockPort>> {
        BootloaderClient::new(PortTransport::new(MockPort::new(response)))
    }

    fn written(client: &BootloaderClient<PortTransport<MockPort>>) -> &[u8] {
        &client
            .transport()
            .port()
            .write_buf
    }

    fn words(values: &[u32]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_sync_ok() {
        let mut bl = client(b"PICO");
        assert!(bl.sync().unwrap());
        assert_eq!(written(&bl), b"SYNC");
        assert_eq!(
            bl.transport()
                .port()
                .clears,
            1
        );
    }

    #[test]
    fn test_sync_wrong_answer() {
        let mut bl = client(b"OKOK");
        assert!(!bl.sync().unwrap());
    }

    #[test]
    fn test_sync_silence_is_timeout() {
        let mut bl = client(&[]);
        assert!(matches!(bl.sync(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_get_info() {
        let mut response = b"OKOK".to_vec();
        response.extend(words(&[0x1001_0000, 0x001F_0000, 4096, 256, 1024]));
        let mut bl = client(&response);

        let geo = bl.get_info().unwrap();
        assert_eq!(written(&bl), b"INFO");
        assert_eq!(geo.flash_start, 0x1001_0000);
        assert_eq!(geo.write_size, 256);
        assert_eq!(geo.max_data_len, 1024);
    }

    #[test]
    fn test_get_info_rejected() {
        let mut bl = client(b"ERR!");
        assert!(matches!(bl.get_info(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_get_info_truncated() {
        let mut response = b"OKOK".to_vec();
        response.extend(words(&[0x1001_0000, 0x001F_0000]));
        let mut bl = client(&response);
        assert!(matches!(bl.get_info(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_erase() {
        let mut bl = client(b"OKOK");
        assert!(bl.erase(0x1001_0000, 0x1000).unwrap());

        let mut expected = b"ERAS".to_vec();
        expected.extend(words(&[0x1001_0000, 0x1000]));
        assert_eq!(written(&bl), expected.as_slice());

        let mut bl = client(b"ERR!");
        assert!(!bl.erase(0x1001_0000, 0x1000).unwrap());
    }

    #[test]
    fn test_write_returns_device_crc() {
        let mut response = b"OKOK".to_vec();
        response.extend(words(&[0xCAFE_F00D]));
        let mut bl = client(&response);

        let block = [0x5A; 8];
        assert_eq!(bl.write(0x1001_0000, &block).unwrap(), Some(0xCAFE_F00D));

        let sent = written(&bl);
        assert_eq!(&sent[..4], b"WRIT");
        assert_eq!(&sent[4..12], words(&[0x1001_0000, 8]).as_slice());
        assert_eq!(&sent[12..], &block);
    }

    #[test]
    fn test_write_rejected() {
        let mut bl = client(b"ERR!");
        assert_eq!(bl.write(0x1001_0000, &[0; 4]).unwrap(), None);
    }

    #[test]
    fn test_garbled_status_is_protocol_error() {
        let mut bl = client(b"OK!!");
        assert!(matches!(bl.erase(0, 4096), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_seal() {
        let mut bl = client(b"OKOK");
        assert!(bl.seal(0x1001_0000, 0x1001_0000, 3072, 0x1234_5678).unwrap());

        let mut expected = b"SEAL".to_vec();
        expected.extend(words(&[0x1001_0000, 0x1001_0000, 3072, 0x1234_5678]));
        assert_eq!(written(&bl), expected.as_slice());
    }

    #[test]
    fn test_go_expects_no_response() {
        let mut bl = client(&[]);
        bl.go(0x1001_0000).unwrap();

        let mut expected = b"GOGO".to_vec();
        expected.extend(words(&[0x1001_0000]));
        assert_eq!(written(&bl), expected.as_slice());
    }

    #[test]
    fn test_erase_timeout_scales_with_length() {
        assert_eq!(erase_timeout(0), ERASE_TIMEOUT_BASE);
        assert_eq!(erase_timeout(4096), Duration::from_millis(1100));
        assert_eq!(erase_timeout(1), Duration::from_millis(1025));
    }
}
