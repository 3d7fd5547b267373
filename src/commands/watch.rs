//! Live device set

use std::sync::Arc;

use super::{CommandResult, Context};
use crate::commands::list::format_device;
use seedkey::DeviceMonitor;
use tokio::sync::mpsc;
use tracing::debug;

/// Print the eligible set on every change until Ctrl-C
pub async fn run(ctx: &Context) -> CommandResult {
    let monitor = DeviceMonitor::with_key_kind(
        Arc::new(ctx.discovery()),
        ctx.config.monitor.identity_key,
    );

    let (error_tx, mut errors) = mpsc::unbounded_channel();
    let json = ctx.json;
    let subscription = monitor.start_monitoring(
        move |devices| {
            if json {
                match serde_json::to_string(devices) {
                    Ok(line) => println!("{line}"),
                    Err(e) => debug!("Failed to serialize device set: {}", e),
                }
                return;
            }
            println!("{} seedable key(s) attached", devices.len());
            for device in devices {
                println!("{}", format_device(device, false));
            }
        },
        move |e| {
            let _ = error_tx.send(e.to_string());
        },
    );

    if !json {
        eprintln!("Watching for keys (Ctrl-C to stop)...");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        Some(message) = errors.recv() => {
            eprintln!("Initial enumeration failed: {message}");
            if monitor.requires_permission() {
                eprintln!("Waiting for hot-plug events; a fix to hidraw permissions takes effect on re-plug");
            }
            tokio::signal::ctrl_c().await?;
        }
    }

    subscription.stop();
    Ok(())
}

