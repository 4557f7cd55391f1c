//! Firmware update over SSP.
//!
//! An update runs in five steps on one serial port:
//!
//! 1. Open at 9600 baud and `SYNC` with the device.
//! 2. Pick the transfer baud rate from the image header.
//! 3. RAM stage: upload the bootstrap ([`ram_stage`]).
//! 4. Main stage: reconnect and stream the firmware ([`main_stage`]).
//! 5. Reconnect at 9600 and `SYNC` until the device comes back.
//!
//! Every failure surfaces as an [`Error`] that maps to one [`Outcome`] code.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "native")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use sspflash::image::FirmwareImage;
//! use sspflash::port::NativePortOpener;
//! use sspflash::protocol::SspChannel;
//! use sspflash::update::Updater;
//!
//! let image = FirmwareImage::from_file("NV0200.bv1")?;
//! let mut updater = Updater::new(NativePortOpener::default(), SspChannel::new());
//!
//! updater.update(&image, "/dev/ttyACM0", "0", &mut |stage, sent, total| {
//!     println!("{stage}: {sent}/{total}");
//! })?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "native"))]
//! # fn main() {}
//! ```

pub mod main_stage;
pub mod ram_stage;
pub mod session;

#[cfg(feature = "native")]
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Outcome, Result};
use crate::image::itl::FirmwareImage;
use crate::port::{PortOpener, SSP_BAUD};
use crate::protocol::ssp::{
    CommandChannel, DEFAULT_COMMAND_TIMEOUT, DEFAULT_RETRY_LEVEL, SspCommand, parse_address,
};
use crate::is_interrupted_requested;

pub use main_stage::{MainStagePlan, upload_main_stage};
pub use ram_stage::{RamStage, upload_ram_stage};
pub use session::Session;

/// Byte the bootloader sends to acknowledge a handshake step.
pub const ACK: u8 = 0x32;

/// RAM-stage payload block size.
pub const RAM_BLOCK_SIZE: usize = 128;

/// Section size for the trailing partial main-stage block.
pub const SECTION_SIZE: usize = 128;

/// `PROGRAM DEVICE` command code.
pub const CMD_PROGRAM_DEVICE: u8 = 0x0B;

/// `PROGRAM DEVICE` argument selecting a RAM file.
pub const PROGRAM_RAM_FILE: u8 = 0x03;

/// Update timing.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Wait for each handshake ACK.
    pub ack_timeout: Duration,
    /// Wait for each checksum echo.
    pub checksum_timeout: Duration,
    /// Pause between closing and reopening the port before the main stage.
    pub reopen_delay: Duration,
    /// Ceiling on the final resync. `None` waits until interrupted.
    pub resync_timeout: Option<Duration>,
    /// Pause between resync attempts.
    pub resync_interval: Duration,
    /// Per-attempt SSP command timeout.
    pub command_timeout: Duration,
    /// SSP command attempts.
    pub command_retries: u8,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1000),
            checksum_timeout: Duration::from_millis(1000),
            reopen_delay: Duration::from_secs(3),
            resync_timeout: Some(Duration::from_secs(120)),
            resync_interval: Duration::from_millis(200),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            command_retries: DEFAULT_RETRY_LEVEL,
        }
    }
}

impl UpdateConfig {
    /// Set the handshake ACK timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the checksum echo timeout.
    #[must_use]
    pub fn with_checksum_timeout(mut self, timeout: Duration) -> Self {
        self.checksum_timeout = timeout;
        self
    }

    /// Set the settle delay before the main stage.
    #[must_use]
    pub fn with_reopen_delay(mut self, delay: Duration) -> Self {
        self.reopen_delay = delay;
        self
    }

    /// Set the resync ceiling (`None` for no limit).
    #[must_use]
    pub fn with_resync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resync_timeout = timeout;
        self
    }

    /// Set the pause between resync attempts.
    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the SSP command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the number of SSP command attempts.
    #[must_use]
    pub fn with_command_retries(mut self, retries: u8) -> Self {
        self.command_retries = retries;
        self
    }
}

/// Drives a complete firmware update.
///
/// Generic over how ports are opened and how SSP commands are exchanged, so
/// the same state machine runs against real hardware and in-memory mocks.
pub struct Updater<O: PortOpener, C: CommandChannel> {
    opener: O,
    channel: C,
    config: UpdateConfig,
}

impl<O: PortOpener, C: CommandChannel> Updater<O, C> {
    /// Create an updater with default timing.
    pub fn new(opener: O, channel: C) -> Self {
        Self::with_config(opener, channel, UpdateConfig::default())
    }

    /// Create an updater with custom timing.
    pub fn with_config(opener: O, channel: C, config: UpdateConfig) -> Self {
        Self {
            opener,
            channel,
            config,
        }
    }

    /// Current timing.
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// The command channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Flash `image` to the device at `address` on `port_name`.
    ///
    /// `address` is decimal or `0x`-prefixed hex. The progress callback
    /// receives the stage name (`"ram"` or `"main"`), bytes sent and stage
    /// total.
    pub fn update(
        &mut self,
        image: &FirmwareImage,
        port_name: &str,
        address: &str,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let config = &self.config;
        let channel = &mut self.channel;

        let mut command = SspCommand::new(parse_address(address))
            .with_timeout(config.command_timeout)
            .with_retry_level(config.command_retries);

        info!(
            "Updating device at address {} on {port_name}",
            command.address
        );
        let mut session = Session::open(&mut self.opener, port_name, SSP_BAUD)?;

        match channel.sync(session.port_mut()?, &mut command) {
            Ok(status) if status.is_ok() => {},
            Ok(status) => {
                return Err(Error::NoValidator(format!("sync answered {status}")));
            },
            Err(e) => return Err(Error::NoValidator(e.to_string())),
        }
        info!("Validator found");

        let baud_rate = image.info().resolve_baud();
        info!(
            "Image variant {:#04x}, transfer baud {baud_rate}",
            image.info().variant.as_u8()
        );

        let ram_stage = upload_ram_stage(
            channel,
            session.port_mut()?,
            &mut command,
            image,
            baud_rate,
            config,
            progress,
        )?;
        info!("RAM stage accepted");

        upload_main_stage(
            &mut session,
            image,
            &ram_stage,
            baud_rate,
            config,
            progress,
        )?;
        info!("Main stage accepted, waiting for device to restart");

        resync(channel, &mut session, &mut command, config)?;
        info!("Update complete");
        Ok(())
    }
}

/// Reconnect at the command baud rate and sync until the device answers.
fn resync<O, C>(
    channel: &mut C,
    session: &mut Session<'_, O>,
    command: &mut SspCommand,
    config: &UpdateConfig,
) -> Result<()>
where
    O: PortOpener,
    C: CommandChannel,
{
    session.close()?;
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if !session.is_open() {
            if let Err(e) = session.reopen(SSP_BAUD, Duration::ZERO) {
                debug!("Resync: {e}");
            }
        }

        if session.is_open() {
            match channel.sync(session.port_mut()?, command) {
                Ok(status) if status.is_ok() => {
                    debug!("Resynced after {attempts} attempts");
                    return Ok(());
                },
                Ok(status) => debug!("Resync: sync answered {status}"),
                Err(e) => {
                    debug!("Resync: {e}");
                    if e.outcome() == Outcome::PortError {
                        session.close()?;
                    }
                },
            }
        }

        if is_interrupted_requested() {
            return Err(Error::Timeout("resync interrupted".into()));
        }
        if let Some(limit) = config.resync_timeout {
            if start.elapsed() >= limit {
                return Err(Error::Timeout(format!(
                    "device did not resync within {}s",
                    limit.as_secs()
                )));
            }
        }

        thread::sleep(config.resync_interval);
    }
}

/// Load `path` and flash it through a native serial port.
///
/// Returns the outcome code instead of an error.
#[cfg(feature = "native")]
pub fn update_device<P: AsRef<Path>>(path: P, port_name: &str, address: &str) -> Outcome {
    use crate::port::NativePortOpener;
    use crate::protocol::ssp::SspChannel;

    let result = FirmwareImage::from_file(path).and_then(|image| {
        let mut updater = Updater::new(NativePortOpener::default(), SspChannel::new());
        updater.update(&image, port_name, address, &mut |_, _, _| {})
    });

    if let Err(e) = &result {
        warn!("Update failed: {e}");
    }
    Outcome::from(&result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image::itl::{HEADER_SIZE, test_image};
    use crate::port::Port;
    use crate::port::mock::{MockOpener, Wire};
    use crate::protocol::ssp::SspStatus;
    use crate::protocol::transport::xor_checksum;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Command channel that answers from a script.
    pub struct ScriptedChannel {
        /// Results of successive syncs.
        pub syncs: VecDeque<bool>,
        /// Result once `syncs` runs out.
        pub sync_fallback: bool,
        /// Replies to successive commands.
        pub replies: VecDeque<(SspStatus, Vec<u8>)>,
        /// Command data of every command sent.
        pub sent: Vec<Vec<u8>>,
        /// Number of syncs attempted.
        pub sync_count: usize,
    }

    impl ScriptedChannel {
        pub fn new(replies: Vec<(SspStatus, Vec<u8>)>) -> Self {
            Self {
                syncs: VecDeque::new(),
                sync_fallback: true,
                replies: replies.into(),
                sent: Vec::new(),
                sync_count: 0,
            }
        }

        /// Accepts the program command with `block_size` and the header.
        pub fn accepting(block_size: u16) -> Self {
            let [lo, hi] = block_size.to_le_bytes();
            Self::new(vec![
                (SspStatus::Ok, vec![0xF0, lo, hi]),
                (SspStatus::Ok, vec![0xF0]),
            ])
        }
    }

    impl CommandChannel for ScriptedChannel {
        fn sync<P: Port>(&mut self, _port: &mut P, command: &mut SspCommand) -> Result<SspStatus> {
            self.sync_count += 1;
            if self.syncs.pop_front().unwrap_or(self.sync_fallback) {
                command.response_data = vec![0xF0];
                Ok(SspStatus::Ok)
            } else {
                Err(Error::Timeout("no reply to sync".into()))
            }
        }

        fn send_command<P: Port>(
            &mut self,
            _port: &mut P,
            command: &mut SspCommand,
        ) -> Result<SspStatus> {
            self.sent.push(command.command_data.clone());
            let (status, data) = self
                .replies
                .pop_front()
                .ok_or_else(|| Error::Timeout("no scripted reply".into()))?;
            command.response_data = data;
            Ok(status)
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn quick_config() -> UpdateConfig {
        UpdateConfig::default()
            .with_ack_timeout(Duration::from_millis(20))
            .with_checksum_timeout(Duration::from_millis(20))
            .with_reopen_delay(Duration::ZERO)
            .with_resync_timeout(Some(Duration::from_millis(100)))
            .with_resync_interval(Duration::from_millis(1))
    }

    /// Everything a well-behaved device sends on the raw link.
    fn device_replies(image: &FirmwareImage, block_size: usize) -> Vec<u8> {
        let mut replies = vec![xor_checksum(image.ram_stage()), ACK, ACK];
        let main = image.main_stage();
        let full = main.len() / block_size * block_size;
        replies.extend(main[..full].chunks(block_size).map(xor_checksum));
        if full < main.len() {
            replies.push(xor_checksum(&main[full..]));
        }
        replies
    }

    struct Run {
        result: Result<()>,
        wire: Arc<Mutex<Wire>>,
        sent: Vec<Vec<u8>>,
        sync_count: usize,
        progress: Vec<(String, usize, usize)>,
    }

    fn run_update(
        image: &FirmwareImage,
        channel: ScriptedChannel,
        replies: &[u8],
        config: UpdateConfig,
    ) -> Run {
        init_logger();
        let wire = Wire::shared();
        wire.lock().unwrap().rx.extend(replies.iter().copied());
        let opener = MockOpener { wire: wire.clone() };
        let mut updater = Updater::with_config(opener, channel, config);
        let mut progress = Vec::new();

        let result = updater.update(image, "mock", "0", &mut |stage, sent, total| {
            progress.push((stage.to_string(), sent, total));
        });

        Run {
            result,
            wire,
            sent: updater.channel().sent.clone(),
            sync_count: updater.channel().sync_count,
            progress,
        }
    }

    #[test]
    fn test_nv9_uses_fixed_baud() {
        // Override of 9600 is ignored for NV9.
        let image = FirmwareImage::from_bytes(test_image(0x09, 256, 600, 9600)).unwrap();
        let replies = device_replies(&image, 256);

        let run = run_update(
            &image,
            ScriptedChannel::accepting(256),
            &replies,
            quick_config(),
        );

        run.result.unwrap();
        let w = run.wire.lock().unwrap();
        // open, RAM switch, main reopen + switch, resync reopen
        assert_eq!(w.bauds, vec![9600, 38400, 9600, 38400, 9600]);
        assert!(w.rx.is_empty());
    }

    #[test]
    fn test_zero_override_uses_default_baud() {
        let image = FirmwareImage::from_bytes(test_image(0x0C, 256, 600, 0)).unwrap();
        let replies = device_replies(&image, 256);

        let run = run_update(
            &image,
            ScriptedChannel::accepting(256),
            &replies,
            quick_config(),
        );

        run.result.unwrap();
        assert_eq!(
            run.wire.lock().unwrap().bauds,
            vec![9600, 38400, 9600, 38400, 9600]
        );
    }

    #[test]
    fn test_override_baud_is_used() {
        let image = FirmwareImage::from_bytes(test_image(0x0C, 256, 600, 9600)).unwrap();
        let replies = device_replies(&image, 256);

        let run = run_update(
            &image,
            ScriptedChannel::accepting(256),
            &replies,
            quick_config(),
        );

        run.result.unwrap();
        assert_eq!(
            run.wire.lock().unwrap().bauds,
            vec![9600, 9600, 9600, 9600, 9600]
        );
    }

    #[test]
    fn test_missing_ack_stops_before_payload() {
        let image = FirmwareImage::from_bytes(test_image(0x0C, 256, 600, 0)).unwrap();
        let replies = [xor_checksum(image.ram_stage()), 0x00];

        let run = run_update(
            &image,
            ScriptedChannel::accepting(256),
            &replies,
            quick_config(),
        );

        assert!(matches!(
            run.result,
            Err(Error::DeviceDidNotAck {
                step: "handshake",
                ..
            })
        ));
        assert_eq!(Outcome::from(&run.result), Outcome::DeviceDidNotAck);

        // RAM payload, then only the handshake byte.
        let mut expected = image.ram_stage().to_vec();
        expected.push(image.handshake_byte());
        assert_eq!(run.wire.lock().unwrap().tx, expected);
    }

    #[test]
    fn test_bad_block_checksum_stops_stream() {
        let image = FirmwareImage::from_bytes(test_image(0x0C, 128, 1000, 0)).unwrap();
        let mut replies = device_replies(&image, 256);
        // ram checksum, ACK, ACK, block 1, block 2
        replies[4] ^= 0xFF;

        let run = run_update(
            &image,
            ScriptedChannel::accepting(256),
            &replies,
            quick_config(),
        );

        assert!(matches!(run.result, Err(Error::BadChecksum { .. })));

        let main = image.main_stage();
        let mut expected = image.ram_stage().to_vec();
        expected.push(image.handshake_byte());
        expected.extend_from_slice(image.header());
        for block in main[..512].chunks(256) {
            expected.extend_from_slice(block);
            expected.push(xor_checksum(block));
        }
        assert_eq!(run.wire.lock().unwrap().tx, expected);
        assert_eq!(run.progress.last().unwrap(), &("main".to_string(), 256, 1000));
    }

    #[test]
    fn test_full_update_byte_totals() {
        let image = FirmwareImage::from_bytes(test_image(0x0C, 300, 1000, 0)).unwrap();
        let replies = device_replies(&image, 256);

        let run = run_update(
            &image,
            ScriptedChannel::accepting(256),
            &replies,
            quick_config(),
        );
        run.result.unwrap();

        // RAM + handshake + header + main + one checksum per full block.
        let tx_len = run.wire.lock().unwrap().tx.len();
        assert_eq!(tx_len, 300 + 1 + HEADER_SIZE + 1000 + 3);

        assert_eq!(run.sent[0], vec![CMD_PROGRAM_DEVICE, PROGRAM_RAM_FILE]);
        assert_eq!(run.sent[1], image.header());
        assert_eq!(run.sync_count, 2);

        let ram: Vec<_> = run.progress.iter().filter(|p| p.0 == "ram").collect();
        let main: Vec<_> = run.progress.iter().filter(|p| p.0 == "main").collect();
        assert_eq!(ram.len(), 3);
        assert_eq!(main.len(), 5);
        assert_eq!(ram.last().unwrap().1, 300);
        assert_eq!(main.last().unwrap().1, 1000);
    }

    #[test]
    fn test_no_validator() {
        let image = FirmwareImage::from_bytes(test_image(0x0C, 128, 100, 0)).unwrap();
        let mut channel = ScriptedChannel::accepting(256);
        channel.syncs = VecDeque::from([false]);

        let run = run_update(&image, channel, &[], quick_config());

        assert!(matches!(run.result, Err(Error::NoValidator(_))));
        assert!(run.sent.is_empty());
        assert!(run.wire.lock().unwrap().tx.is_empty());
    }

    #[test]
    fn test_port_open_failure() {
        init_logger();
        let image = FirmwareImage::from_bytes(test_image(0x0C, 128, 100, 0)).unwrap();
        let wire = Wire::shared();
        wire.lock().unwrap().fail_open_after = Some(0);
        let mut updater = Updater::with_config(
            MockOpener { wire },
            ScriptedChannel::accepting(256),
            quick_config(),
        );

        let result = updater.update(&image, "mock", "0", &mut |_, _, _| {});
        assert_eq!(Outcome::from(&result), Outcome::PortError);
        assert_eq!(updater.channel().sync_count, 0);
    }

    #[test]
    fn test_resync_times_out() {
        let _guard = crate::interrupt_test_guard();
        let image = FirmwareImage::from_bytes(test_image(0x0C, 128, 100, 0)).unwrap();
        let replies = device_replies(&image, 256);
        let mut channel = ScriptedChannel::accepting(256);
        channel.syncs = VecDeque::from([true]);
        channel.sync_fallback = false;

        let start = Instant::now();
        let run = run_update(&image, channel, &replies, quick_config());

        assert!(matches!(run.result, Err(Error::Timeout(_))));
        assert!(run.sync_count > 2);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_resync_retries_until_device_returns() {
        let _guard = crate::interrupt_test_guard();
        let image = FirmwareImage::from_bytes(test_image(0x0C, 128, 100, 0)).unwrap();
        let replies = device_replies(&image, 256);
        let mut channel = ScriptedChannel::accepting(256);
        channel.syncs = VecDeque::from([true, false, false, false]);

        let run = run_update(&image, channel, &replies, quick_config());

        run.result.unwrap();
        assert_eq!(run.sync_count, 5);
    }

    #[test]
    fn test_resync_interrupted() {
        let _guard = crate::interrupt_test_guard();
        let image = FirmwareImage::from_bytes(test_image(0x0C, 128, 100, 0)).unwrap();
        let replies = device_replies(&image, 256);
        let mut channel = ScriptedChannel::accepting(256);
        channel.syncs = VecDeque::from([true]);
        channel.sync_fallback = false;

        crate::test_set_interrupted(true);
        let run = run_update(
            &image,
            channel,
            &replies,
            quick_config().with_resync_timeout(None),
        );
        crate::test_set_interrupted(false);

        assert!(matches!(run.result, Err(Error::Timeout(_))));
        assert_eq!(run.sync_count, 2);
    }

    #[test]
    fn test_config_defaults() {
        let config = UpdateConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_millis(1000));
        assert_eq!(config.checksum_timeout, Duration::from_millis(1000));
        assert_eq!(config.reopen_delay, Duration::from_secs(3));
        assert_eq!(config.resync_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.command_timeout, Duration::from_millis(1000));
        assert_eq!(config.command_retries, 3);
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_update_device_missing_file() {
        let outcome = update_device("/nonexistent/sspflash/firmware.bv1", "/dev/null", "0");
        assert_eq!(outcome, Outcome::FileNotFound);
    }
}
