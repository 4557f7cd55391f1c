//! Firmware info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    sspflash::{FirmwareImage, Variant, auto_detect_port, detect_ports, format_port_list},
    std::path::Path,
};

/// Display name for a device variant.
pub(crate) fn variant_name(variant: Variant) -> String {
    match variant {
        Variant::Nv9 => "NV9".to_string(),
        Variant::Nv10 => "NV10".to_string(),
        Variant::Other(tag) => format!("{tag:#04x}"),
    }
}

fn load_image(firmware: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))
}

/// Summary of an image as JSON.
fn image_json(firmware: &Path, image: &FirmwareImage) -> serde_json::Value {
    let info = image.info();
    serde_json::json!({
        "file": firmware.display().to_string(),
        "size": image.len(),
        "variant": variant_name(info.variant),
        "variant_tag": format!("0x{:02X}", info.variant.as_u8()),
        "ram_stage_size": info.ram_stage_size,
        "main_stage_offset": image.main_stage_offset(),
        "main_stage_size": image.main_stage().len(),
        "handshake_byte": format!("0x{:02X}", image.handshake_byte()),
        "override_baud": info.override_baud,
        "transfer_baud": info.resolve_baud(),
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = load_image(firmware)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&image_json(firmware, &image))?
        );
        return Ok(());
    }

    let info = image.info();
    println!("{}", style("Firmware image").bold().underlined());
    println!("  File:            {}", firmware.display());
    println!("  Size:            {} bytes", image.len());
    println!(
        "  Variant:         {} (tag 0x{:02X})",
        variant_name(info.variant),
        info.variant.as_u8()
    );
    println!("  RAM stage:       {} bytes", info.ram_stage_size);
    println!(
        "  Main stage:      {} bytes at offset {}",
        image.main_stage().len(),
        image.main_stage_offset()
    );
    println!("  Handshake byte:  0x{:02X}", image.handshake_byte());
    if info.variant.uses_fixed_baud() || info.override_baud == 0 {
        println!("  Transfer baud:   {}", info.resolve_baud());
    } else {
        println!(
            "  Transfer baud:   {} {}",
            info.resolve_baud(),
            style("(from header)").dim()
        );
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": detected,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for line in format_port_list(&detected) {
        eprintln!("  {} {}", style("•").green(), line);
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}
