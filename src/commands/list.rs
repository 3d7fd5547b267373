//! Device listing

use super::{with_permission_hint, CommandResult, Context};
use seedkey::is_eligible;
use seedkey_transport::{DeviceDiscovery, HidDiscovery, TransportDeviceInfo};

/// List attached keys (every HID interface with `all`)
pub async fn run(ctx: &Context, all: bool) -> CommandResult {
    let discovery = if all {
        HidDiscovery::all_interfaces()
    } else {
        ctx.discovery()
    };
    let mut devices = discovery.list_devices().await.map_err(with_permission_hint)?;
    if !all {
        devices.retain(is_eligible);
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No seedable keys found");
        return Ok(());
    }
    for device in &devices {
        println!("{}", format_device(device, all));
    }
    Ok(())
}

/// One listing line
pub fn format_device(device: &TransportDeviceInfo, mark_seedable: bool) -> String {
    let marker = if mark_seedable && is_eligible(device) {
        " [seedable]"
    } else {
        ""
    };
    format!(
        "  VID={:04x} PID={:04x} page={:04x} {}  {}{}",
        device.vid,
        device.pid,
        device.usage_page,
        device.device_path,
        device.display_name(),
        marker
    )
}
