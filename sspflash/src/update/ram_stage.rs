//! RAM-stage upload.
//!
//! The device is asked to accept a RAM file, told the image header through a
//! normal SSP command, and then sent the bootstrap payload as raw bytes at
//! the transfer baud rate. A single XOR over the whole payload is checked at
//! the end.

use crate::error::{Error, Result};
use crate::image::itl::{FirmwareImage, HEADER_SIZE, ram_stage_size_from_header};
use crate::port::Port;
use crate::protocol::ssp::{CommandChannel, SspCommand};
use crate::protocol::transport::ChunkedTransport;
use crate::update::{CMD_PROGRAM_DEVICE, PROGRAM_RAM_FILE, RAM_BLOCK_SIZE, UpdateConfig};
use log::{debug, info};

/// Values the RAM stage hands to the main stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamStage {
    /// RAM payload length as declared by the header.
    pub ram_stage_size: usize,
    /// Main-stage block size reported by the device.
    pub block_size: usize,
}

/// Run the RAM stage on an already synced port.
pub fn upload_ram_stage<C, P>(
    channel: &mut C,
    port: &mut P,
    command: &mut SspCommand,
    image: &FirmwareImage,
    baud_rate: u32,
    config: &UpdateConfig,
    progress: &mut dyn FnMut(&str, usize, usize),
) -> Result<RamStage>
where
    C: CommandChannel,
    P: Port,
{
    let block_size = request_program_device(channel, port, command)?;
    debug!("Device block size: {block_size}");

    command.set_command(image.header());
    match channel.send_command(port, command) {
        Ok(status) if status.is_ok() => {},
        Ok(status) => {
            return Err(Error::InvalidFileType(format!(
                "device rejected image header: {status}"
            )));
        },
        Err(e) => {
            return Err(Error::InvalidFileType(format!(
                "failed to send image header: {e}"
            )));
        },
    }

    port.set_baud_rate(baud_rate)?;

    let ram_stage_size = ram_stage_size_from_header(image.header())
        .and_then(|size| usize::try_from(size).ok())
        .ok_or_else(|| Error::InvalidFileType("header too short for RAM size".into()))?;
    let payload = image.span(HEADER_SIZE, ram_stage_size)?;

    info!(
        "Sending RAM stage ({ram_stage_size} bytes) at {baud_rate} baud"
    );

    let mut transport = ChunkedTransport::new(port);
    let mut checksum = 0u8;
    let mut sent = 0;

    // Full blocks, then the remainder.
    for block in payload.chunks(RAM_BLOCK_SIZE) {
        checksum ^= transport.send_block(block)?;
        sent += block.len();
        progress("ram", sent, ram_stage_size);
    }

    transport.verify_checksum(checksum, config.checksum_timeout)?;
    debug!("RAM stage checksum {checksum:#04x} verified");

    Ok(RamStage {
        ram_stage_size,
        block_size,
    })
}

/// Send PROGRAM DEVICE / RAM FILE and return the block size the device
/// wants for the main stage.
fn request_program_device<C, P>(
    channel: &mut C,
    port: &mut P,
    command: &mut SspCommand,
) -> Result<usize>
where
    C: CommandChannel,
    P: Port,
{
    command.set_command(&[CMD_PROGRAM_DEVICE, PROGRAM_RAM_FILE]);
    let status = channel
        .send_command(port, command)
        .map_err(|e| Error::SendProgramCmd(e.to_string()))?;
    if !status.is_ok() {
        return Err(Error::SendProgramCmd(format!(
            "program device command rejected: {status}"
        )));
    }

    match command.response_data.get(1..3) {
        Some(&[lo, hi]) if u16::from_le_bytes([lo, hi]) > 0 => {
            Ok(usize::from(u16::from_le_bytes([lo, hi])))
        },
        _ => Err(Error::SendProgramCmd(format!(
            "no usable block size in response {:02X?}",
            command.response_data
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::itl::test_image;
    use crate::port::mock::{MockPort, Wire};
    use crate::protocol::ssp::SspStatus;
    use crate::protocol::transport::xor_checksum;
    use crate::update::tests::ScriptedChannel;
    use std::time::Duration;

    fn quick_config() -> UpdateConfig {
        UpdateConfig::default().with_checksum_timeout(Duration::from_millis(20))
    }

    fn run(
        image: &FirmwareImage,
        channel: &mut ScriptedChannel,
        wire_rx: &[u8],
    ) -> (Result<RamStage>, Vec<u8>, Vec<(usize, usize)>) {
        let wire = Wire::shared();
        wire.lock().unwrap().rx.extend(wire_rx.iter().copied());
        let mut port = MockPort::new(wire.clone());
        let mut command = SspCommand::new(0);
        let mut calls = Vec::new();

        let result = upload_ram_stage(
            channel,
            &mut port,
            &mut command,
            image,
            38400,
            &quick_config(),
            &mut |stage, sent, total| {
                assert_eq!(stage, "ram");
                calls.push((sent, total));
            },
        );

        let tx = wire.lock().unwrap().tx.clone();
        (result, tx, calls)
    }

    #[test]
    fn test_ram_blocks_and_remainder() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 300, 10, 0)).unwrap();
        let checksum = xor_checksum(image.ram_stage());
        let mut channel = ScriptedChannel::accepting(256);

        let (result, tx, calls) = run(&image, &mut channel, &[checksum]);

        assert_eq!(
            result.unwrap(),
            RamStage {
                ram_stage_size: 300,
                block_size: 256
            }
        );
        // 300 = 2 * 128 + 44
        assert_eq!(calls, vec![(128, 300), (256, 300), (300, 300)]);
        assert_eq!(tx, image.ram_stage());

        // Program command, then the header as command data.
        assert_eq!(channel.sent[0], vec![CMD_PROGRAM_DEVICE, PROGRAM_RAM_FILE]);
        assert_eq!(channel.sent[1], image.header());
    }

    #[test]
    fn test_ram_exact_multiple_has_no_remainder() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 256, 10, 0)).unwrap();
        let checksum = xor_checksum(image.ram_stage());
        let mut channel = ScriptedChannel::accepting(128);

        let (result, tx, calls) = run(&image, &mut channel, &[checksum]);

        assert!(result.is_ok());
        assert_eq!(calls.len(), 2);
        assert_eq!(tx.len(), 256);
    }

    #[test]
    fn test_program_command_rejected() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 128, 10, 0)).unwrap();
        let mut channel = ScriptedChannel::new(vec![(SspStatus::Fail, vec![0xF8])]);

        let (result, tx, _) = run(&image, &mut channel, &[]);

        assert!(matches!(result, Err(Error::SendProgramCmd(_))));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 128, 10, 0)).unwrap();
        let mut channel = ScriptedChannel::new(vec![(SspStatus::Ok, vec![0xF0, 0x00, 0x00])]);

        let (result, _, _) = run(&image, &mut channel, &[]);
        assert!(matches!(result, Err(Error::SendProgramCmd(_))));

        let mut channel = ScriptedChannel::new(vec![(SspStatus::Ok, vec![0xF0])]);
        let (result, _, _) = run(&image, &mut channel, &[]);
        assert!(matches!(result, Err(Error::SendProgramCmd(_))));
    }

    #[test]
    fn test_header_rejected_is_invalid_file_type() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 128, 10, 0)).unwrap();
        let mut channel = ScriptedChannel::new(vec![
            (SspStatus::Ok, vec![0xF0, 0x00, 0x01]),
            (SspStatus::WrongParameters, vec![0xF3]),
        ]);

        let (result, tx, _) = run(&image, &mut channel, &[]);

        assert!(matches!(result, Err(Error::InvalidFileType(_))));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_ram_checksum_mismatch() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 128, 10, 0)).unwrap();
        let wrong = xor_checksum(image.ram_stage()) ^ 0xFF;
        let mut channel = ScriptedChannel::accepting(128);

        let (result, _, _) = run(&image, &mut channel, &[wrong]);
        assert!(matches!(result, Err(Error::BadChecksum { .. })));
    }

    #[test]
    fn test_ram_checksum_timeout() {
        let image = FirmwareImage::from_bytes(test_image(0x09, 128, 10, 0)).unwrap();
        let mut channel = ScriptedChannel::accepting(128);

        let (result, _, _) = run(&image, &mut channel, &[]);
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
