//! Command handlers for the CLI application.
//!
//! - `list`: one-shot enumeration
//! - `watch`: live device set via the monitor
//! - `device`: commands against one key (info, wink, seed)
//! - `config`: show or initialize the config file

pub mod config;
pub mod device;
pub mod list;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use fido_seeder::seed_input::select_device;
use fido_seeder::SeederConfig;
use seedkey::{is_eligible, SeedingError};
use seedkey_transport::{
    DeviceDiscovery, HidDiscovery, PacketFilter, PrinterConfig, Transport, TransportError,
};

/// Result type for command handlers
pub type CommandResult = anyhow::Result<()>;

/// Settings shared by every command
pub struct Context {
    pub config: SeederConfig,
    pub config_path: PathBuf,
    pub printer_config: Option<PrinterConfig>,
    pub json: bool,
}

impl Context {
    /// Discovery for FIDO interfaces, wrapping opened transports for monitoring
    pub fn discovery(&self) -> HidDiscovery {
        let discovery =
            HidDiscovery::new().with_poll_interval(self.config.monitor.poll_interval());
        match &self.printer_config {
            Some(config) => discovery.with_printer_config(config.clone()),
            None => discovery,
        }
    }

    /// Transport (still closed) for the selected seedable key
    pub async fn open_selected(&self, selector: Option<&str>) -> anyhow::Result<Arc<dyn Transport>> {
        let discovery = self.discovery();
        let devices: Vec<_> = discovery
            .list_devices()
            .await
            .map_err(with_permission_hint)?
            .into_iter()
            .filter(is_eligible)
            .collect();

        let Some(device) = select_device(&devices, selector) else {
            match selector {
                Some(selector) => bail!("No seedable key matches \"{selector}\""),
                None => bail!("No seedable key found"),
            }
        };
        discovery
            .open_device(device)
            .with_context(|| format!("Failed to open {}", device.device_path))
    }
}

/// Create printer config from CLI flags
pub fn create_printer_config(
    monitor: bool,
    hex: bool,
    filter: Option<&str>,
) -> anyhow::Result<Option<PrinterConfig>> {
    if !monitor {
        return Ok(None);
    }

    let filter = match filter {
        Some(f) => f.parse::<PacketFilter>().map_err(|e| anyhow!(e))?,
        None => PacketFilter::All,
    };

    Ok(Some(
        PrinterConfig::default().with_hex(hex).with_filter(filter),
    ))
}

const PERMISSION_HINT: &str =
    "hidraw access denied; install a udev rule granting your user access to the key";

/// Attach the udev hint to permission failures
pub fn with_permission_hint(err: TransportError) -> anyhow::Error {
    if err.is_permission_denied() {
        anyhow::Error::new(err).context(PERMISSION_HINT)
    } else {
        err.into()
    }
}

/// Convert a seeding failure, adding the udev hint where it applies
pub fn seeding_failure(err: SeedingError) -> anyhow::Error {
    match err {
        SeedingError::Transport(e) => with_permission_hint(e),
        other => other.into(),
    }
}
