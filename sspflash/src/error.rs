//! Error and outcome types for sspflash.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sspflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sspflash operations.
///
/// Every variant maps to exactly one [`Outcome`] code via [`Error::outcome`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial port.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware file does not exist.
    #[error("Firmware file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Firmware file could not be read completely.
    #[error("Firmware file error: {0}")]
    FileError(String),

    /// Image tag mismatch, inconsistent header, or header rejected by the device.
    #[error("Invalid file type: {0}")]
    InvalidFileType(String),

    /// Serial port could not be opened or reopened.
    #[error("Port error: {0}")]
    Port(String),

    /// Device never answered the initial sync.
    #[error("No validator found: {0}")]
    NoValidator(String),

    /// Device rejected the program-device command.
    #[error("Program command rejected: {0}")]
    SendProgramCmd(String),

    /// A bounded wait expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Checksum byte read back from the device did not match.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    BadChecksum {
        /// Checksum computed over the bytes sent.
        expected: u8,
        /// Byte read back from the device.
        actual: u8,
    },

    /// Device answered a handshake step with something other than ACK.
    #[error("Device did not acknowledge {step}: got {received:#04x}")]
    DeviceDidNotAck {
        /// Handshake step that failed.
        step: &'static str,
        /// Byte received instead of ACK.
        received: u8,
    },

    /// Malformed SSP packet.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Map this error onto the closed outcome taxonomy.
    pub fn outcome(&self) -> Outcome {
        match self {
            #[cfg(feature = "native")]
            Self::Serial(_) => Outcome::PortError,
            Self::Io(_) | Self::Port(_) | Self::Protocol(_) => Outcome::PortError,
            Self::FileNotFound(_) => Outcome::FileNotFound,
            Self::FileError(_) => Outcome::FileError,
            Self::InvalidFileType(_) => Outcome::InvalidFileType,
            Self::NoValidator(_) => Outcome::NoValidator,
            Self::SendProgramCmd(_) => Outcome::SendProgramCmdError,
            Self::Timeout(_) => Outcome::Timeout,
            Self::BadChecksum { .. } => Outcome::BadChecksum,
            Self::DeviceDidNotAck { .. } => Outcome::DeviceDidNotAck,
        }
    }
}

/// Outcome code of a firmware update.
///
/// The numeric values are stable and double as CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Outcome {
    /// Update completed and the device resynced.
    Ok = 0x00,
    /// Firmware file does not exist.
    FileNotFound = 0x01,
    /// Firmware file short read.
    FileError = 0x02,
    /// Tag mismatch or header rejected by the device.
    InvalidFileType = 0x03,
    /// Port open/reopen failure.
    PortError = 0x04,
    /// Initial sync never succeeded.
    NoValidator = 0x05,
    /// RAM-stage capability probe rejected.
    SendProgramCmdError = 0x06,
    /// A bounded wait expired.
    Timeout = 0x07,
    /// A checksum mismatch.
    BadChecksum = 0x08,
    /// Handshake ACK mismatch in the main stage.
    DeviceDidNotAck = 0x09,
}

impl Outcome {
    /// Numeric outcome code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this outcome denotes success.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Short machine-friendly name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FileNotFound => "file_not_found",
            Self::FileError => "file_error",
            Self::InvalidFileType => "invalid_file_type",
            Self::PortError => "port_error",
            Self::NoValidator => "no_validator",
            Self::SendProgramCmdError => "send_program_cmd_error",
            Self::Timeout => "timeout",
            Self::BadChecksum => "bad_checksum",
            Self::DeviceDidNotAck => "device_did_not_ack",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.code())
    }
}

impl From<&Error> for Outcome {
    fn from(err: &Error) -> Self {
        err.outcome()
    }
}

impl<T> From<&Result<T>> for Outcome {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => e.outcome(),
        }
    }
}
