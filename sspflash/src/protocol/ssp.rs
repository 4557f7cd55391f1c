//! SSP command framing.
//!
//! Every command and response travels in the same envelope:
//!
//! ```text
//! +-----+----------+-----+-----------------+--------+--------+
//! | STX | SEQ|ADDR | LEN |   DATA (LEN)    | CRC_L  | CRC_H  |
//! +-----+----------+-----+-----------------+--------+--------+
//! | 7F  |    1     |  1  |      0..255     |   1    |   1    |
//! +-----+----------+-----+-----------------+--------+--------+
//! ```
//!
//! The top bit of SEQ|ADDR is a sequence flag the host toggles after every
//! completed exchange; `SYNC` resets it to 1. Any `0x7F` after the leading
//! STX is sent twice. The first data byte of a response is the status.
//!
//! Only plain (unencrypted) packets are supported.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::crc::crc16_ssp;
use log::{debug, trace, warn};
use std::fmt;
use std::time::{Duration, Instant};

/// Start of packet.
pub const STX: u8 = 0x7F;

/// Sequence flag in the SEQ|ADDR byte.
pub const SEQ_FLAG: u8 = 0x80;

/// Address bits in the SEQ|ADDR byte.
pub const ADDRESS_MASK: u8 = 0x7F;

/// `SYNC` command code.
pub const CMD_SYNC: u8 = 0x11;

/// Default per-attempt response timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of attempts per command.
pub const DEFAULT_RETRY_LEVEL: u8 = 3;

/// Session descriptor for one device: addressing, timing and the in-place
/// command/response buffers.
#[derive(Debug, Clone)]
pub struct SspCommand {
    /// Device address (0..=0x7D).
    pub address: u8,
    /// Time to wait for a response on each attempt.
    pub timeout: Duration,
    /// Number of attempts before giving up.
    pub retry_level: u8,
    /// Whether packets are encrypted.
    pub encryption: bool,
    /// Outbound command bytes.
    pub command_data: Vec<u8>,
    /// Response bytes of the last exchange. Byte 0 is the status.
    pub response_data: Vec<u8>,
}

impl SspCommand {
    /// Create a descriptor with default timing for `address`.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retry_level: DEFAULT_RETRY_LEVEL,
            encryption: false,
            command_data: Vec::new(),
            response_data: Vec::new(),
        }
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of attempts.
    #[must_use]
    pub fn with_retry_level(mut self, retry_level: u8) -> Self {
        self.retry_level = retry_level;
        self
    }

    /// Replace the outbound command bytes.
    pub fn set_command(&mut self, data: &[u8]) {
        self.command_data.clear();
        self.command_data.extend_from_slice(data);
    }

    /// Status of the last response, if any.
    pub fn status(&self) -> Option<SspStatus> {
        self.response_data.first().copied().map(SspStatus::from)
    }
}

/// Parse a device address given as decimal (`"0"`, `"16"`) or hex (`"0x10"`).
///
/// Unparseable or out-of-range input falls back to address 0.
pub fn parse_address(text: &str) -> u8 {
    let text = text.trim();
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    };

    parsed.unwrap_or_else(|_| {
        warn!("Invalid SSP address {text:?}, using 0");
        0
    })
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SspStatus {
    /// Command accepted (`0xF0`).
    Ok,
    /// Command not known (`0xF2`).
    UnknownCommand,
    /// Wrong number of parameters (`0xF3`).
    WrongParameters,
    /// Parameter out of range (`0xF4`).
    ParameterOutOfRange,
    /// Command cannot be processed now (`0xF5`).
    CannotProcess,
    /// Device software error (`0xF6`).
    SoftwareError,
    /// Command failed (`0xF8`).
    Fail,
    /// Encryption key not negotiated (`0xFA`).
    KeyNotSet,
    /// Any other status byte.
    Other(u8),
}

impl SspStatus {
    /// Whether the device accepted the command.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Raw status byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0xF0,
            Self::UnknownCommand => 0xF2,
            Self::WrongParameters => 0xF3,
            Self::ParameterOutOfRange => 0xF4,
            Self::CannotProcess => 0xF5,
            Self::SoftwareError => 0xF6,
            Self::Fail => 0xF8,
            Self::KeyNotSet => 0xFA,
            Self::Other(b) => b,
        }
    }
}

impl From<u8> for SspStatus {
    fn from(byte: u8) -> Self {
        match byte {
            0xF0 => Self::Ok,
            0xF2 => Self::UnknownCommand,
            0xF3 => Self::WrongParameters,
            0xF4 => Self::ParameterOutOfRange,
            0xF5 => Self::CannotProcess,
            0xF6 => Self::SoftwareError,
            0xF8 => Self::Fail,
            0xFA => Self::KeyNotSet,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for SspStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::WrongParameters => write!(f, "wrong number of parameters"),
            Self::ParameterOutOfRange => write!(f, "parameter out of range"),
            Self::CannotProcess => write!(f, "cannot process command"),
            Self::SoftwareError => write!(f, "software error"),
            Self::Fail => write!(f, "command failed"),
            Self::KeyNotSet => write!(f, "encryption key not set"),
            Self::Other(b) => write!(f, "status {b:#04x}"),
        }
    }
}

/// "Send command, get response" primitive used by the updater.
///
/// Implementations write `command.command_data` to the device at
/// `command.address` and store the reply in `command.response_data`.
pub trait CommandChannel {
    /// Synchronise the link with the device.
    fn sync<P: Port>(&mut self, port: &mut P, command: &mut SspCommand) -> Result<SspStatus>;

    /// Send `command.command_data` and wait for the response.
    fn send_command<P: Port>(
        &mut self,
        port: &mut P,
        command: &mut SspCommand,
    ) -> Result<SspStatus>;
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// SEQ|ADDR byte.
    pub seq_addr: u8,
    /// Payload.
    pub data: Vec<u8>,
}

impl Packet {
    /// Device address.
    pub fn address(&self) -> u8 {
        self.seq_addr & ADDRESS_MASK
    }

    /// Sequence flag.
    pub fn sequence(&self) -> bool {
        self.seq_addr & SEQ_FLAG != 0
    }
}

/// Build a stuffed packet.
pub fn encode_packet(seq_addr: u8, data: &[u8]) -> Result<Vec<u8>> {
    let len = u8::try_from(data.len())
        .map_err(|_| Error::Protocol(format!("packet data too long: {} bytes", data.len())))?;

    let mut body = Vec::with_capacity(data.len() + 4);
    body.push(seq_addr);
    body.push(len);
    body.extend_from_slice(data);
    let crc = crc16_ssp(&body);
    body.extend_from_slice(&crc.to_le_bytes());

    let mut packet = Vec::with_capacity(body.len() * 2 + 1);
    packet.push(STX);
    for &byte in &body {
        packet.push(byte);
        if byte == STX {
            packet.push(STX);
        }
    }
    Ok(packet)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Hunting for STX.
    Idle,
    /// Collecting SEQ|ADDR, LEN, DATA and CRC.
    Body,
}

/// Incremental packet decoder.
///
/// Feed bytes one at a time; a complete, CRC-checked packet is returned when
/// its last byte arrives. A single `0x7F` followed by anything other than a
/// second `0x7F` starts a new packet.
#[derive(Debug)]
pub struct PacketDecoder {
    state: DecodeState,
    body: Vec<u8>,
    escape: bool,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    /// Create an idle decoder.
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            body: Vec::new(),
            escape: false,
        }
    }

    /// Drop any partial packet.
    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.body.clear();
        self.escape = false;
    }

    /// Feed one byte.
    pub fn push(&mut self, byte: u8) -> Result<Option<Packet>> {
        match self.state {
            DecodeState::Idle => {
                if byte == STX {
                    self.start();
                }
                Ok(None)
            },
            DecodeState::Body if self.escape => {
                self.escape = false;
                if byte != STX {
                    trace!("Unstuffed STX, restarting packet");
                    self.start();
                }
                self.accept(byte)
            },
            DecodeState::Body if byte == STX => {
                self.escape = true;
                Ok(None)
            },
            DecodeState::Body => self.accept(byte),
        }
    }

    fn start(&mut self) {
        self.state = DecodeState::Body;
        self.body.clear();
        self.escape = false;
    }

    fn accept(&mut self, byte: u8) -> Result<Option<Packet>> {
        self.body.push(byte);

        // SEQ|ADDR + LEN + DATA + CRC16
        let expected = match self.body.get(1) {
            Some(&len) => usize::from(len) + 4,
            None => return Ok(None),
        };
        if self.body.len() < expected {
            return Ok(None);
        }

        let body = std::mem::take(&mut self.body);
        self.reset();

        let (content, crc_bytes) = body.split_at(expected - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = crc16_ssp(content);
        if received != computed {
            return Err(Error::Protocol(format!(
                "CRC mismatch: expected {computed:#06x}, got {received:#06x}"
            )));
        }

        Ok(Some(Packet {
            seq_addr: content[0],
            data: content[2..].to_vec(),
        }))
    }
}

/// Plain SSP channel with sequence tracking and retry on silence.
#[derive(Debug, Clone)]
pub struct SspChannel {
    sequence: u8,
}

impl Default for SspChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SspChannel {
    /// Create a channel. The first `sync` resets the sequence flag.
    pub fn new() -> Self {
        Self { sequence: SEQ_FLAG }
    }

    fn transact<P: Port>(&mut self, port: &mut P, command: &mut SspCommand) -> Result<SspStatus> {
        if command.encryption {
            return Err(Error::Protocol(
                "encrypted packets are not supported".into(),
            ));
        }

        let packet = encode_packet(
            self.sequence | (command.address & ADDRESS_MASK),
            &command.command_data,
        )?;
        let attempts = command.retry_level.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            trace!("SSP tx ({attempt}/{attempts}): {packet:02X?}");
            port.write_all_bytes(&packet)?;

            match read_packet(port, command.address, command.timeout) {
                Ok(Some(reply)) => {
                    trace!("SSP rx: {:02X?}", reply.data);
                    let status = reply
                        .data
                        .first()
                        .copied()
                        .map(SspStatus::from)
                        .ok_or_else(|| Error::Protocol("empty response".into()))?;
                    self.sequence ^= SEQ_FLAG;
                    command.response_data = reply.data;
                    return Ok(status);
                },
                Ok(None) => {
                    debug!(
                        "No response from address {} (attempt {attempt}/{attempts})",
                        command.address
                    );
                },
                Err(e @ Error::Protocol(_)) => {
                    debug!("Bad response (attempt {attempt}/{attempts}): {e}");
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Timeout(format!(
                "no response from address {} after {attempts} attempts",
                command.address
            ))
        }))
    }
}

impl CommandChannel for SspChannel {
    fn sync<P: Port>(&mut self, port: &mut P, command: &mut SspCommand) -> Result<SspStatus> {
        self.sequence = SEQ_FLAG;
        command.set_command(&[CMD_SYNC]);
        self.transact(port, command)
    }

    fn send_command<P: Port>(
        &mut self,
        port: &mut P,
        command: &mut SspCommand,
    ) -> Result<SspStatus> {
        self.transact(port, command)
    }
}

/// Read one packet from `address` within `timeout`.
fn read_packet<P: Port>(port: &mut P, address: u8, timeout: Duration) -> Result<Option<Packet>> {
    let deadline = Instant::now() + timeout;
    let mut decoder = PacketDecoder::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(byte) = port.read_byte_within(remaining)? else {
            return Ok(None);
        };

        if let Some(packet) = decoder.push(byte)? {
            if packet.address() == address {
                return Ok(Some(packet));
            }
            // Another device on the bus; keep listening.
            trace!("Ignoring packet for address {}", packet.address());
        }
    }
}
