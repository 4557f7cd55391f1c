//! Raw byte transport used while streaming firmware.
//!
//! Outside of SSP command exchanges the bootloader speaks a bare protocol:
//! the host writes blocks of image bytes and the device answers with single
//! bytes (an ACK or the XOR checksum of what it received).

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::time::Duration;

/// Default wait for a checksum echo.
pub const DEFAULT_CHECKSUM_TIMEOUT: Duration = Duration::from_millis(1000);

/// XOR of every byte in `data`, seeded with 0.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Timeout-bounded byte exchange over a borrowed port.
pub struct ChunkedTransport<'a, P: Port> {
    port: &'a mut P,
}

impl<'a, P: Port> ChunkedTransport<'a, P> {
    /// Wrap an open port.
    pub fn new(port: &'a mut P) -> Self {
        Self { port }
    }

    /// Read one byte, or `Error::Timeout` if none arrives within `timeout`.
    pub fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        self.port
            .read_byte_within(timeout)?
            .ok_or_else(|| Error::Timeout(format!("no byte within {}ms", timeout.as_millis())))
    }

    /// Consume one byte and report whether it equals `expected`.
    pub fn wait_for_byte(&mut self, expected: u8, timeout: Duration) -> Result<bool> {
        let byte = self.read_byte(timeout)?;
        trace!("Waited for {expected:#04x}, got {byte:#04x}");
        Ok(byte == expected)
    }

    /// Read the device's checksum and compare it with `expected`.
    pub fn verify_checksum(&mut self, expected: u8, timeout: Duration) -> Result<()> {
        let actual = self.read_byte(timeout)?;
        if actual != expected {
            return Err(Error::BadChecksum { expected, actual });
        }
        Ok(())
    }

    /// Write `data` verbatim and return its XOR checksum.
    pub fn send_block(&mut self, data: &[u8]) -> Result<u8> {
        self.port.write_all_bytes(data)?;
        Ok(xor_checksum(data))
    }

    /// Write a single byte.
    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.port.write_all_bytes(&[byte])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockPort, Wire};
    use std::time::Instant;

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(&[]), 0);
        assert_eq!(xor_checksum(&[0x5A]), 0x5A);
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x04]), 0x07);
        assert_eq!(xor_checksum(&[0xAA, 0xAA]), 0);
    }

    #[test]
    fn test_xor_checksum_split_invariance() {
        let data: Vec<u8> = (0..=255u8).map(|b| b.wrapping_mul(31)).collect();
        for split in [0, 1, 127, 128, 200, data.len()] {
            let (a, b) = data.split_at(split);
            assert_eq!(xor_checksum(&data), xor_checksum(a) ^ xor_checksum(b));
        }
    }

    #[test]
    fn test_wait_for_byte_match_and_mismatch() {
        let wire = Wire::shared();
        wire.lock().unwrap().rx.extend([0x32, 0x33]);
        let mut port = MockPort::new(wire.clone());
        let mut transport = ChunkedTransport::new(&mut port);

        assert!(transport.wait_for_byte(0x32, Duration::ZERO).unwrap());
        assert!(!transport.wait_for_byte(0x32, Duration::ZERO).unwrap());
        // Exactly one byte consumed per call.
        assert!(wire.lock().unwrap().rx.is_empty());
    }

    #[test]
    fn test_wait_for_byte_timeout_within_bound() {
        let mut port = MockPort::new(Wire::shared());
        let mut transport = ChunkedTransport::new(&mut port);
        let timeout = Duration::from_millis(30);

        let start = Instant::now();
        let err = transport.wait_for_byte(0x32, timeout).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn test_verify_checksum() {
        let wire = Wire::shared();
        wire.lock().unwrap().rx.extend([0x10, 0x11]);
        let mut port = MockPort::new(wire);
        let mut transport = ChunkedTransport::new(&mut port);

        transport.verify_checksum(0x10, Duration::ZERO).unwrap();
        let err = transport.verify_checksum(0x10, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            Error::BadChecksum {
                expected: 0x10,
                actual: 0x11
            }
        ));

        let err = transport
            .verify_checksum(0x10, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_send_block_and_byte() {
        let wire = Wire::shared();
        let mut port = MockPort::new(wire.clone());
        let mut transport = ChunkedTransport::new(&mut port);

        assert_eq!(transport.send_block(&[1, 2, 3]).unwrap(), 0);
        transport.send_byte(0xEE).unwrap();

        assert_eq!(wire.lock().unwrap().tx, vec![1, 2, 3, 0xEE]);
    }
}
