//! Main-stage upload.
//!
//! Runs against the bootstrap the RAM stage left executing on the device:
//!
//! ```text
//! ReopenPort -> Handshake -> HeaderSent -> StreamingBlocks -> [Remainder] -> Done
//! ```
//!
//! Each full block is followed by its XOR byte and the device echoes the
//! checksum it computed. The trailing partial block goes out in 128-byte
//! sections with no checksum byte; the device still echoes one.

use crate::error::{Error, Result};
use crate::image::itl::{FirmwareImage, HEADER_SIZE};
use crate::port::{Port, PortOpener, SSP_BAUD};
use crate::protocol::transport::ChunkedTransport;
use crate::update::ram_stage::RamStage;
use crate::update::session::Session;
use crate::update::{ACK, SECTION_SIZE, UpdateConfig};
use log::{debug, info, trace};

/// Block layout of the main-stage payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainStagePlan {
    /// Offset of the first main-stage byte.
    pub start: usize,
    /// Main-stage length.
    pub size: usize,
    /// Device block size.
    pub block_size: usize,
    /// Number of full blocks.
    pub blocks: usize,
    /// Bytes left after the full blocks.
    pub remainder: usize,
}

impl MainStagePlan {
    /// Lay out the main stage of `image` for `block_size`-byte blocks.
    pub fn new(image: &FirmwareImage, ram_stage: &RamStage) -> Result<Self> {
        if ram_stage.block_size == 0 {
            return Err(Error::SendProgramCmd("device reported block size 0".into()));
        }

        let start = HEADER_SIZE + ram_stage.ram_stage_size;
        let size = image
            .len()
            .checked_sub(start)
            .ok_or_else(|| Error::InvalidFileType("RAM stage overruns image".into()))?;

        Ok(Self {
            start,
            size,
            block_size: ram_stage.block_size,
            blocks: size / ram_stage.block_size,
            remainder: size % ram_stage.block_size,
        })
    }

    /// Number of sections the remainder is sent in.
    pub fn remainder_sections(&self) -> usize {
        self.remainder.div_ceil(SECTION_SIZE)
    }
}

/// Run the main stage. The session's port is reopened first.
pub fn upload_main_stage<O: PortOpener>(
    session: &mut Session<'_, O>,
    image: &FirmwareImage,
    ram_stage: &RamStage,
    baud_rate: u32,
    config: &UpdateConfig,
    progress: &mut dyn FnMut(&str, usize, usize),
) -> Result<()> {
    let plan = MainStagePlan::new(image, ram_stage)?;

    session.reopen(SSP_BAUD, config.reopen_delay)?;
    session.set_baud_rate(baud_rate)?;

    let port = session.port_mut()?;
    let mut transport = ChunkedTransport::new(port);

    transport.send_byte(image.handshake_byte())?;
    expect_ack(&mut transport, "handshake", config)?;

    transport.send_block(image.header())?;
    expect_ack(&mut transport, "header", config)?;

    info!(
        "Sending main stage ({} bytes, {} blocks of {}, {} byte remainder) at {baud_rate} baud",
        plan.size, plan.blocks, plan.block_size, plan.remainder
    );

    let mut sent = 0;
    for index in 0..plan.blocks {
        let block = image.span(plan.start + index * plan.block_size, plan.block_size)?;
        let checksum = transport.send_block(block)?;
        transport.send_byte(checksum)?;
        transport.verify_checksum(checksum, config.checksum_timeout)?;

        sent += block.len();
        trace!("Block {}/{} verified", index + 1, plan.blocks);
        progress("main", sent, plan.size);
    }

    if plan.remainder > 0 {
        let tail = image.span(plan.start + plan.blocks * plan.block_size, plan.remainder)?;
        let mut checksum = 0u8;
        for section in tail.chunks(SECTION_SIZE) {
            checksum ^= transport.send_block(section)?;
            sent += section.len();
            progress("main", sent, plan.size);
        }
        transport.verify_checksum(checksum, config.checksum_timeout)?;
        debug!(
            "Remainder ({} sections) verified",
            plan.remainder_sections()
        );
    }

    Ok(())
}

fn expect_ack<P: Port>(
    transport: &mut ChunkedTransport<'_, P>,
    step: &'static str,
    config: &UpdateConfig,
) -> Result<()> {
    let received = transport.read_byte(config.ack_timeout)?;
    if received != ACK {
        return Err(Error::DeviceDidNotAck { step, received });
    }
    debug!("Device acknowledged {step}");
    Ok(())
}
