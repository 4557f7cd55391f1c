//! Firmware update command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use sspflash::{FirmwareImage, NativePortOpener, SspChannel, UpdateConfig, Updater};
use std::path::Path;

use crate::commands::info::variant_name;
use crate::config::{Config, resync_limit};
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Address used when neither the CLI nor the config names one.
const DEFAULT_ADDRESS: &str = "0";

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// CLI/env address first, then config, then the default.
fn resolve_address(cli: &Cli, config: &Config) -> String {
    cli.address
        .clone()
        .or_else(|| config.port.connection.address.clone())
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string())
}

/// Config file timing with command-line overrides on top.
fn build_update_config(
    config: &Config,
    resync_timeout: Option<u64>,
    no_resync_limit: bool,
) -> UpdateConfig {
    let mut update = config.update.to_update_config();
    if no_resync_limit {
        update = update.with_resync_timeout(None);
    } else if let Some(secs) = resync_timeout {
        update = update.with_resync_timeout(resync_limit(secs));
    }
    update
}

fn stage_label(stage: &str) -> &'static str {
    match stage {
        "ram" => "RAM stage",
        "main" => "main firmware",
        _ => "transfer",
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Update command implementation.
pub(crate) fn cmd_update(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    resync_timeout: Option<u64>,
    no_resync_limit: bool,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let info = *image.info();

    if !cli.quiet {
        eprintln!(
            "{} {} image: RAM stage {} bytes, main stage {} bytes",
            style("ℹ").blue(),
            variant_name(info.variant),
            info.ram_stage_size,
            image.main_stage().len()
        );
    }

    let port = get_port(cli, config)?;
    let address = resolve_address(cli, config);
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Using port {} (address {}, transfer baud {})",
            style("🔌").cyan(),
            port,
            address,
            info.resolve_baud()
        );
        eprintln!("{} Waiting for validator...", style("⏳").yellow());
    }

    let update_config = build_update_config(config, resync_timeout, no_resync_limit);
    let mut updater = Updater::with_config(
        NativePortOpener::default(),
        SspChannel::new(),
        update_config,
    );

    let pb = progress_bar(cli.quiet);
    let mut current_stage = String::new();

    let result = updater.update(
        &image,
        &port,
        &address,
        &mut |stage: &str, sent: usize, total: usize| {
            if stage != current_stage {
                current_stage = stage.to_string();
                pb.set_position(0);
                pb.set_message(format!("Sending {}", stage_label(stage)));
            }
            if total > 0 {
                pb.set_position((sent * 100 / total) as u64);
            }
            if stage == "main" && sent == total {
                pb.set_message("Waiting for restart");
            }
        },
    );

    if let Err(err) = result {
        pb.abandon();
        ensure_not_interrupted()?;
        let outcome = err.outcome();
        return Err(anyhow::Error::new(err).context(format!("Update failed [{outcome}]")));
    }

    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!(
            "\n{} Firmware updated, validator is back online",
            style("🎉").green().bold()
        );
    }

    Ok(())
}
