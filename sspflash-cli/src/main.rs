//! sspflash CLI - Command-line tool for updating ITL validator firmware.
//!
//! ## Features
//!
//! - Two-stage firmware update over SSP
//! - Firmware image inspection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Name of the installed binary.
pub(crate) const BIN_NAME: &str = "sspflash";

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// CLI-level failures that are not library errors.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup. Exit code 2.
    #[error("{0}")]
    Usage(String),
    /// The user backed out. Exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Shown under `--help`. Outcome codes share the low range with the generic
/// and usage codes, so 1 and 2 are ambiguous without the error message.
const EXIT_CODES_HELP: &str = "\
Exit codes:
  0    success
  1    file not found, or any other failure
  2    firmware file unreadable, or usage error
  3-9  update outcome (3 invalid file type, 4 port error, 5 no validator,
       6 program command rejected, 7 timeout, 8 bad checksum,
       9 device did not acknowledge)
  130  cancelled";

/// sspflash - update ITL payment validator firmware over SSP.
///
/// Environment variables:
///   SSPFLASH_PORT              - Default serial port
///   SSPFLASH_ADDRESS           - Default SSP address (decimal or 0x hex)
///   SSPFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
///
/// Exit codes are listed in [`EXIT_CODES_HELP`].
#[derive(Parser)]
#[command(name = "sspflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = EXIT_CODES_HELP)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "SSPFLASH_PORT")]
    port: Option<String>,

    /// SSP address of the validator, decimal or 0x-prefixed hex [default: 0].
    #[arg(short, long, global = true, env = "SSPFLASH_ADDRESS")]
    address: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "SSPFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Update a validator with an ITL firmware image.
    Update {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Seconds to wait for the validator to restart (0 = no limit).
        #[arg(long, value_name = "SECS")]
        resync_timeout: Option<u64>,

        /// Wait for the validator to restart without a time limit.
        #[arg(long, conflicts_with = "resync_timeout")]
        no_resync_limit: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

/// Setup logging based on verbosity.
fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "sspflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

/// First Ctrl-C asks running loops to stop, a second one exits.
fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
    });
    if let Err(e) = installed {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    sspflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Update {
            firmware,
            resync_timeout,
            no_resync_limit,
        } => commands::update::cmd_update(
            cli,
            &mut config,
            firmware,
            *resync_timeout,
            *no_resync_limit,
        ),
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else if let Some(shell) = shell {
                commands::completions::cmd_completions(*shell);
                Ok(())
            } else {
                Err(CliError::Usage(format!(
                    "specify a shell type, e.g. `{BIN_NAME} completions bash`, \
                     or use `{BIN_NAME} completions --install`"
                ))
                .into())
            }
        },
    }
}

/// Map an error onto the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(lib_err) = cause.downcast_ref::<sspflash::Error>() {
            return lib_err.outcome().code();
        }
    }
    1
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
