//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::{BIN_NAME, Cli};

/// Write the completion script for `shell` to `out`.
fn write_completions(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    write_completions(shell, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// File name each shell expects for a completion script.
fn completion_file_name(shell: Shell) -> Option<String> {
    match shell {
        Shell::Bash => Some(BIN_NAME.to_string()),
        Shell::Zsh => Some(format!("_{BIN_NAME}")),
        Shell::Fish => Some(format!("{BIN_NAME}.fish")),
        Shell::PowerShell => Some(format!("{BIN_NAME}.ps1")),
        Shell::Elvish => Some(format!("{BIN_NAME}.elv")),
        _ => None,
    }
}

/// Get the completion script installation path for a given shell.
fn get_completion_install_path(shell: Shell) -> Result<PathBuf> {
    let file_name = completion_file_name(shell).context("Unsupported shell for auto-install")?;
    let dirs = BaseDirs::new().context("Could not determine home directory")?;

    let dir = match shell {
        Shell::Bash => dirs.data_dir().join("bash-completion").join("completions"),
        Shell::Zsh => dirs.home_dir().join(".zfunc"),
        Shell::Fish => dirs.config_dir().join("fish").join("completions"),
        Shell::Elvish => dirs.config_dir().join("elvish").join("lib"),
        _ => match env::var("PROFILE") {
            Ok(profile) => PathBuf::from(profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
            Err(_) => dirs.config_dir().join("powershell").join("completions"),
        },
    };

    Ok(dir.join(file_name))
}

/// Make sure `~/.zshrc` puts `~/.zfunc` on the function path.
fn ensure_zsh_fpath() -> Result<()> {
    let Some(dirs) = BaseDirs::new() else {
        return Ok(());
    };
    let zshrc = dirs.home_dir().join(".zshrc");
    let fpath_line = "fpath=(~/.zfunc $fpath)";

    let present = fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(fpath_line));
    if present {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN_NAME} completions")?;
    writeln!(file, "{fpath_line}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().with_context(|| {
            format!(
                "Could not detect your shell. Please specify it explicitly:\n  \
                 {BIN_NAME} completions --install bash"
            )
        })?,
    };

    let path = get_completion_install_path(shell)?;

    let mut buf = Vec::new();
    write_completions(shell, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    eprintln!();
    match shell {
        Shell::Bash => {
            eprintln!(
                "To activate now: {}",
                style(format!("source {}", path.display())).cyan()
            );
        },
        Shell::Zsh => {
            ensure_zsh_fpath()?;
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => {
            eprintln!("Add this to your PowerShell profile to load on startup:");
            eprintln!(
                "  {}",
                style(format!("Import-Module {}", path.display())).cyan()
            );
        },
        _ => eprintln!("Completions will be loaded automatically in new sessions."),
    }

    Ok(())
}
