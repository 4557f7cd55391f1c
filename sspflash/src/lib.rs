//! # sspflash
//!
//! A library for updating the firmware of ITL payment validators (NV9, NV10,
//! NV200 and friends) over the SSP serial protocol.
//!
//! This crate provides:
//!
//! - ITL firmware image parsing
//! - The two-stage update protocol (RAM bootstrap, then main firmware)
//! - A plain SSP command channel (framing, CRC-16, sequence handling)
//! - Serial port discovery
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! Without the `native` feature the update state machine is still usable
//! through the [`port::Port`] and [`port::PortOpener`] traits.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "native")]
//! # {
//! use sspflash::{Outcome, update_device};
//!
//! let outcome = update_device("NV0200.bv1", "/dev/ttyACM0", "0");
//! if outcome != Outcome::Ok {
//!     eprintln!("update failed: {outcome}");
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod update;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

/// Serialises tests that touch the global interruption flag.
#[cfg(test)]
pub(crate) fn interrupt_test_guard() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, PoisonError};

    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {
    port::{NativePort, NativePortOpener},
    update::update_device,
};
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, format_port_list},
    error::{Error, Outcome, Result},
    image::{FirmwareImage, ImageInfo, Variant},
    port::{Port, PortOpener, SerialConfig},
    protocol::{CommandChannel, SspChannel, SspCommand, SspStatus},
    update::{UpdateConfig, Updater},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        let _guard = interrupt_test_guard();
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        let _guard = interrupt_test_guard();
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
