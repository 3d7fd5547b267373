//! Config file commands

use anyhow::{bail, Context as _};

use super::{CommandResult, Context};
use fido_seeder::SeederConfig;

/// Print the effective configuration, or write defaults with `init`
pub fn run(ctx: &Context, init: bool) -> CommandResult {
    let path = &ctx.config_path;
    if init {
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        SeederConfig::default()
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&ctx.config)?);
    } else {
        println!("# {}", path.display());
        print!("{}", toml::to_string_pretty(&ctx.config)?);
    }
    Ok(())
}
