//! Commands against a single key

use super::{seeding_failure, CommandResult, Context};
use fido_seeder::seed_input::{parse_ext_state, parse_seed};
use seedkey::{InitResponse, KeySeeder};
use tokio::io::AsyncReadExt;
use tracing::info;

fn seeder(ctx: &Context) -> KeySeeder {
    KeySeeder::new(ctx.config.timeouts.seeding_timeouts())
}

/// Run the INIT handshake and print what the key reports
pub async fn info(ctx: &Context, selector: Option<&str>) -> CommandResult {
    let device = ctx.open_selected(selector).await?;
    let init = seeder(ctx).probe(device.as_ref()).await.map_err(seeding_failure)?;
    let target = device.device_info();

    if ctx.json {
        let value = serde_json::json!({
            "device": target,
            "channel": format!("{:08x}", init.channel.0),
            "protocol_version": init.protocol_version,
            "device_version": init.device_version(),
            "capabilities": init.capabilities,
            "wink": init.supports_wink(),
            "cbor": init.supports_cbor(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Device: {} at {}", target.display_name(), target.device_path);
    for line in describe(&init) {
        println!("  {line}");
    }
    Ok(())
}

/// Human readable INIT response fields
pub fn describe(init: &InitResponse) -> Vec<String> {
    let mut features = Vec::new();
    if init.supports_wink() {
        features.push("wink");
    }
    if init.supports_cbor() {
        features.push("cbor");
    }
    vec![
        format!("Channel:          {:08x}", init.channel.0),
        format!("CTAPHID protocol: {}", init.protocol_version),
        format!("Firmware:         {}", init.device_version()),
        format!(
            "Capabilities:     0x{:02x} ({})",
            init.capabilities,
            if features.is_empty() {
                "none".to_string()
            } else {
                features.join(", ")
            }
        ),
    ]
}

/// Blink the key
pub async fn wink(ctx: &Context, selector: Option<&str>) -> CommandResult {
    let device = ctx.open_selected(selector).await?;
    seeder(ctx).wink(device.as_ref()).await.map_err(seeding_failure)?;
    println!("Winked {}", device.device_info().display_name());
    Ok(())
}

/// Program a seed onto the key
pub async fn seed(
    ctx: &Context,
    seed_hex: &str,
    ext_state_hex: Option<&str>,
    selector: Option<&str>,
) -> CommandResult {
    let seed_hex = if seed_hex == "-" {
        let mut input = String::new();
        tokio::io::stdin().read_to_string(&mut input).await?;
        input
    } else {
        seed_hex.to_string()
    };
    let seed = parse_seed(&seed_hex)?;
    let ext_state = parse_ext_state(ext_state_hex)?;

    let device = ctx.open_selected(selector).await?;
    let target = device.device_info().display_name();
    eprintln!("Touch {target} to confirm seeding...");

    seeder(ctx)
        .write_seed(device.as_ref(), &seed, &ext_state)
        .await
        .map_err(seeding_failure)?;

    info!("Seed written to {}", target);
    println!("Seeded {target}");
    Ok(())
}
