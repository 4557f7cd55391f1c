//! Interactive serial port selection.
//!
//! Ports are resolved in this order:
//! - an explicit `--port` / `SSPFLASH_PORT`
//! - the `[port.connection] serial` config entry
//! - auto-detection, preferring ITL USB and known bridges
//! - an interactive picker when more than one candidate remains
//!
//! Non-interactive mode never prompts; ambiguity is a usage error.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    sspflash::{DetectedPort, DeviceKind, detect_ports},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are setup problems, exit code 2.
    CliError::Usage(message.to_string()).into()
}

fn cancelled_err() -> anyhow::Error {
    CliError::Cancelled("port selection cancelled".to_string()).into()
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    let mut ports = selection_ports.into_iter();
    match (ports.next(), ports.next()) {
        (Some(port), None) => Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        }),
        (Some(_), Some(_)) => Err(usage_err(
            "multiple serial ports found; pass --port to choose one",
        )),
        (None, _) => Err(usage_err("no serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    // If port explicitly specified, use it
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    // If port in config, use it
    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = detect_ports();

    if ports.is_empty() {
        return Err(usage_err(
            "no serial ports found; connect the validator or pass --port",
        ));
    }

    // Filter to known devices (built-in + config)
    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    let selection_ports: Vec<DetectedPort> = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports, config)
        },
        Ordering::Equal => {
            let Some(port) = selection_ports.into_iter().next() else {
                return Err(usage_err("no serial ports available"));
            };
            let is_known = is_known_device(&port, config);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled_err()
            } else {
                usage_err(&format!("prompt failed: {io_err}"))
            }
        },
    }
}

/// Find a port by name, falling back to a bare entry for ports
/// enumeration does not report.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = detect_ports();

    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(port) => SelectedPort {
            port: port.clone(),
            is_known: port.device.is_known(),
        },
        None => SelectedPort {
            port: DetectedPort::unknown(name),
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (from config or built-in list).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Recognised validators and USB bridges are listed first").dim()
    );

    // ITL first, then other known devices
    ports.sort_by_key(|p| {
        (
            p.device != DeviceKind::ItlUsb,
            !is_known_device(p, config),
        )
    });

    // Keep labels on one line in narrow terminals
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the validator's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(cancelled_err()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled_err())
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };

    if config
        .port
        .usb_device
        .iter()
        .any(|device| device.matches(vid, pid))
    {
        return Ok(());
    }

    if ensure_interactive_terminal().is_err() {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember USB device {vid:04X}:{pid:04X} for auto-detection?"
        ))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
    };

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            vid: Some(vid),
            pid: Some(pid),
            device: DeviceKind::from_vid_pid(vid, pid),
            ..DetectedPort::unknown(name)
        }
    }

    fn expect_usage(result: Result<SelectedPort>) {
        let err = result.err().expect("expected error");
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_port_label_fits_after_truncation() {
        let mut port = usb("/dev/serial/by-id/usb-Innovative_Technology_NV200", 0x191C, 0x4104);
        port.product = Some("NV200 Spectral with a very long description".to_string());

        let label = port_label(&port, &Config::default());
        let truncated = truncate_str(&label, 26, "…").into_owned();
        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= 26);
    }

    #[test]
    fn test_is_known_device_builtin() {
        let config = Config::default();
        assert!(is_known_device(&usb("/dev/ttyACM0", 0x191C, 0x4104), &config));
        assert!(is_known_device(&usb("/dev/ttyUSB0", 0x1A86, 0x7523), &config));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let config = Config::default();
        assert!(!is_known_device(&usb("/dev/ttyUSB0", 0x9999, 0x9999), &config));
        assert!(!is_known_device(&DetectedPort::unknown("/dev/ttyS0"), &config));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let mut config = Config::default();
        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&usb("/dev/ttyUSB0", 0xABCD, 0x1234), &config));
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![
            DetectedPort::unknown("/dev/ttyUSB0"),
            DetectedPort::unknown("/dev/ttyUSB1"),
        ];
        expect_usage(select_non_interactive_port(ports, &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_usage_error() {
        expect_usage(select_non_interactive_port(vec![], &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_single_port() {
        let ports = vec![usb("/dev/ttyACM0", 0x191C, 0x4104)];

        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyACM0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_explicit_port_is_used_verbatim() {
        let options = SerialOptions {
            port: Some("/dev/does-not-exist-sspflash".to_string()),
            non_interactive: true,
            ..Default::default()
        };
        let selected = select_serial_port(&options, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/does-not-exist-sspflash");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_config_port_is_used() {
        let mut config = Config::default();
        config.port.connection.serial = Some("/dev/ttyFromConfig".to_string());

        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyFromConfig");
    }
}
