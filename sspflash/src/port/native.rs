//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).

use {
    crate::{
        error::{Error, Result},
        port::{
            DataBits, FlowControl, Parity, Port, PortOpener, SSP_BAUD, SerialConfig, StopBits,
        },
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{ErrorKind, Read, Write},
        time::{Duration, Instant},
    },
};

/// Driver timeout used to drain a byte that is already buffered.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .open()?;

        debug!("Opened {} at {} baud", config.port_name, config.baud_rate);

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// Wrap a port that is already open.
    pub fn from_serial(port: Box<dyn serialport::SerialPort>) -> Self {
        let name = port.name().unwrap_or_default();
        let timeout = port.timeout();
        let baud_rate = port.baud_rate().unwrap_or(SSP_BAUD);

        Self {
            port: Some(port),
            name,
            timeout,
            baud_rate,
        }
    }

    /// Open a serial port with SSP line settings (8N2).
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig::new(port_name, baud_rate);
        Self::open(&config)
    }

    fn inner(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Port(format!("{} is closed", self.name)))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        trace!("Setting baud rate to {baud_rate}");
        if let Some(ref mut p) = self.port {
            p.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn bytes_available(&mut self) -> Result<bool> {
        Ok(self.inner()?.bytes_to_read()? > 0)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        if self.port.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn read_byte_within(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let deadline = Instant::now() + timeout;
        let io_timeout = self.timeout;
        let port = self.inner()?;
        let mut buf = [0u8; 1];

        // The driver may return early with nothing, so loop until the
        // deadline passes.
        let received = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Input that already arrived still counts at the deadline.
                if port.bytes_to_read()? == 0 {
                    break None;
                }
                port.set_timeout(MIN_READ_TIMEOUT)?;
            } else {
                port.set_timeout(remaining)?;
            }

            match port.read(&mut buf) {
                Ok(1) => break Some(buf[0]),
                Ok(_) => {},
                Err(e) if e.kind() == ErrorKind::TimedOut => break None,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        };

        // Writes keep the configured timeout
        port.set_timeout(io_timeout)?;
        Ok(received)
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Opens [`NativePort`]s with SSP line settings.
#[derive(Debug, Clone)]
pub struct NativePortOpener {
    timeout: Duration,
}

impl NativePortOpener {
    /// Create an opener whose ports use `timeout` for plain reads and writes.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for NativePortOpener {
    fn default() -> Self {
        Self::new(SerialConfig::default().timeout)
    }
}

impl PortOpener for NativePortOpener {
    type Port = NativePort;

    fn open(&mut self, name: &str, baud_rate: u32) -> Result<NativePort> {
        let config = SerialConfig::new(name, baud_rate).with_timeout(self.timeout);
        NativePort::open(&config).map_err(|e| Error::Port(format!("cannot open {name}: {e}")))
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}
