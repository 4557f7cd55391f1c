//! Port abstraction for serial communication.
//!
//! The update protocol never talks to a serial driver directly. It goes
//! through two small traits:
//!
//! - [`Port`]: an open byte stream with baud control and a bytes-available
//!   check.
//! - [`PortOpener`]: opens (and reopens) ports by name, so the updater can
//!   drop the handle between stages and start again with clean buffers.
//!
//! ```text
//! +---------------------+
//! |   Update protocol   |
//! | (ram/main stage)    |
//! +----------+----------+
//!            |
//!            v
//! +----------+----------+     +------------------+
//! |   Port / PortOpener | --> |  NativePort      |
//! +---------------------+     |  (serialport)    |
//!                             +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use sspflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> sspflash::Result<()> {
//!     port.write_all_bytes(&[0x7F, 0x80, 0x01, 0x11, 0x65, 0x82])?;
//!     if let Some(byte) = port.read_byte_within(std::time::Duration::from_millis(100))? {
//!         println!("Received: {byte:#04x}");
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Baud rate SSP devices use for command traffic.
pub const SSP_BAUD: u32 = 9600;

/// Sleep between bytes-available checks when polling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (SSP uses two).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: SSP_BAUD,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::Two,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    One,
    /// 2 stop bits.
    #[default]
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Whether at least one received byte is waiting in the input buffer.
    fn bytes_available(&mut self) -> Result<bool>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read one byte, giving up once `timeout` has elapsed since the call.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. The default polls
    /// [`Port::bytes_available`] every [`POLL_INTERVAL`]; implementations
    /// with a native blocking read should override it.
    fn read_byte_within(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let start = Instant::now();

        while !self.bytes_available()? {
            if start.elapsed() > timeout {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }

        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(Some(buf[0]))
    }
}

/// Opens ports by name.
///
/// The updater closes and reopens the port around every baud change, so it
/// needs a way to get a fresh handle rather than a single pre-opened port.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Open `name` at `baud_rate`.
    fn open(&mut self, name: &str, baud_rate: u32) -> Result<Self::Port>;
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortOpener};

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory port used by the protocol tests.

    use super::{Port, PortOpener, Result};
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Shared state behind every port handle a [`MockOpener`] hands out.
    #[derive(Debug, Default)]
    pub struct Wire {
        /// Bytes the "device" will send, in order.
        pub rx: VecDeque<u8>,
        /// Every byte written by the host.
        pub tx: Vec<u8>,
        /// Baud rate changes and opens, in order.
        pub bauds: Vec<u32>,
        /// Number of successful opens.
        pub opens: usize,
        /// Number of closes.
        pub closes: usize,
        /// Fail every open after this many successful ones.
        pub fail_open_after: Option<usize>,
    }

    impl Wire {
        pub fn shared() -> Arc<Mutex<Self>> {
            Arc::new(Mutex::new(Self::default()))
        }
    }

    pub struct MockPort {
        wire: Arc<Mutex<Wire>>,
        baud_rate: u32,
        timeout: Duration,
        open: bool,
    }

    impl MockPort {
        pub fn new(wire: Arc<Mutex<Wire>>) -> Self {
            Self {
                wire,
                baud_rate: super::SSP_BAUD,
                timeout: Duration::from_millis(100),
                open: true,
            }
        }
    }

    impl io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut wire = self.wire.lock().unwrap();
            if wire.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(wire.rx.len());
            for b in buf.iter_mut().take(n) {
                *b = wire.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.wire.lock().unwrap().tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
            self.baud_rate = baud_rate;
            self.wire.lock().unwrap().bauds.push(baud_rate);
            Ok(())
        }

        fn baud_rate(&self) -> u32 {
            self.baud_rate
        }

        fn bytes_available(&mut self) -> Result<bool> {
            Ok(!self.wire.lock().unwrap().rx.is_empty())
        }

        fn clear_buffers(&mut self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn close(&mut self) -> Result<()> {
            if self.open {
                self.open = false;
                self.wire.lock().unwrap().closes += 1;
            }
            Ok(())
        }
    }

    pub struct MockOpener {
        pub wire: Arc<Mutex<Wire>>,
    }

    impl PortOpener for MockOpener {
        type Port = MockPort;

        fn open(&mut self, _name: &str, baud_rate: u32) -> Result<MockPort> {
            let mut wire = self.wire.lock().unwrap();
            if wire.fail_open_after.is_some_and(|n| wire.opens >= n) {
                return Err(Error::Port("mock port unavailable".into()));
            }
            wire.opens += 1;
            wire.bauds.push(baud_rate);
            drop(wire);

            let mut port = MockPort::new(self.wire.clone());
            port.baud_rate = baud_rate;
            Ok(port)
        }
    }
}
