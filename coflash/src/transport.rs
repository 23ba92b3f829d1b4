//! Byte-level request/response transport to the coprocessor.
//!
//! The frame codec only needs three things from the link: push a request
//! out, pull an exact number of response bytes back within a deadline, and
//! throw away stale input before a handshake. [`PortTransport`] provides
//! those on top of any [`Port`].

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Smallest timeout handed to the port while waiting for a response.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Request/response channel used by the frame codec.
pub trait Transport {
    /// Send a complete request.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly `len` bytes, failing with [`Error::Timeout`] if they do
    /// not all arrive within `timeout`.
    fn receive(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Drop any bytes already buffered on the receive side.
    fn discard_input(&mut self) -> Result<()>;

    /// Send a request and receive a fixed-size response.
    fn exchange(&mut self, request: &[u8], response_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.send(request)?;
        self.receive(response_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).receive(len, timeout)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }
}

/// [`Transport`] implementation over a serial [`Port`].
pub struct PortTransport<P: Port> {
    port: P,
}

impl<P: Port> PortTransport<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }
}

impl<P: Port> Transport for PortTransport<P> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {} bytes: {:02X?}", data.len(), &data[..data.len().min(16)]);
        self.port
            .write_all_bytes(data)
    }

    fn receive(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "received {filled} of {len} bytes within {} ms",
                    timeout.as_millis()
                )));
            }
            self.port
                .set_timeout(remaining.max(MIN_READ_TIMEOUT))?;

            match self
                .port
                .read(&mut buf[filled..])
            {
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        trace!("RX {len} bytes: {:02X?}", &buf[..len.min(16)]);
        Ok(buf)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port
            .clear_buffers()
    }
}
