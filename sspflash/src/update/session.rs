//! Port ownership for one update.

use crate::error::{Error, Result};
use crate::port::{Port, PortOpener};
use log::debug;
use std::thread;
use std::time::Duration;

/// Owns the serial port for the duration of an update.
///
/// The bootloader expects the link to be torn down and brought back up
/// around every baud change, so the session keeps the opener and port name
/// alongside the current handle.
pub struct Session<'a, O: PortOpener> {
    opener: &'a mut O,
    port_name: String,
    port: Option<O::Port>,
    baud_rate: u32,
}

impl<'a, O: PortOpener> Session<'a, O> {
    /// Open `port_name` at `baud_rate`.
    pub fn open(opener: &'a mut O, port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = opener
            .open(port_name, baud_rate)
            .map_err(|e| port_error(port_name, &e))?;

        Ok(Self {
            opener,
            port_name: port_name.to_string(),
            port: Some(port),
            baud_rate,
        })
    }

    /// Port name this session was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Baud rate the port was last opened or switched to.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Whether a port handle is currently held.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// The open port.
    pub fn port_mut(&mut self) -> Result<&mut O::Port> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Port(format!("{} is not open", self.port_name)))
    }

    /// Switch the open port to `baud_rate`.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port_mut()?.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Close the port, wait `settle_delay`, and open it again at `baud_rate`.
    pub fn reopen(&mut self, baud_rate: u32, settle_delay: Duration) -> Result<()> {
        self.close()?;

        if !settle_delay.is_zero() {
            debug!(
                "Waiting {}ms before reopening {}",
                settle_delay.as_millis(),
                self.port_name
            );
            thread::sleep(settle_delay);
        }

        let port = self
            .opener
            .open(&self.port_name, baud_rate)
            .map_err(|e| port_error(&self.port_name, &e))?;
        self.port = Some(port);
        self.baud_rate = baud_rate;
        debug!("Reopened {} at {baud_rate} baud", self.port_name);
        Ok(())
    }

    /// Close the port if it is open.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            port.close()?;
        }
        Ok(())
    }
}

impl<O: PortOpener> Drop for Session<'_, O> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn port_error(port_name: &str, err: &Error) -> Error {
    match err {
        Error::Port(msg) => Error::Port(msg.clone()),
        other => Error::Port(format!("{port_name}: {other}")),
    }
}
