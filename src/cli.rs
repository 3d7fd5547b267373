// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fido-seeder")]
#[command(author, version, about = "Program seeds onto FIDO security keys")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: <config dir>/fido-seeder/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging for the seeder and its protocol layers
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable transport monitoring (prints every CTAPHID frame)
    #[arg(long, global = true)]
    pub monitor: bool,

    /// Show raw hex dump alongside decoded frames
    #[arg(long, global = true)]
    pub hex: bool,

    /// Filter monitored frames (all, sent, received, cmd=0xNN)
    #[arg(long, global = true)]
    pub filter: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached seedable keys
    #[command(visible_aliases = ["ls", "l"])]
    List {
        /// Show every HID interface, not only seedable keys
        #[arg(short, long)]
        all: bool,
    },

    /// Print the set of attached keys whenever it changes (Ctrl-C to stop)
    #[command(visible_alias = "w")]
    Watch,

    /// Show CTAPHID protocol version, firmware version and capabilities
    #[command(visible_aliases = ["probe", "i"])]
    Info {
        /// Product name, serial number or device path (default: first key)
        #[arg(short, long, value_name = "SELECTOR")]
        device: Option<String>,
    },

    /// Blink a key so it can be told apart from others
    Wink {
        /// Product name, serial number or device path (default: first key)
        #[arg(short, long, value_name = "SELECTOR")]
        device: Option<String>,
    },

    /// Program a seed onto a key
    ///
    /// The key asks for a touch to confirm; seeding fails if nobody
    /// confirms before the response timeout.
    Seed {
        /// 32-byte seed as 64 hex digits, or "-" to read it from stdin
        #[arg(long, value_name = "HEX")]
        seed: String,

        /// Opaque extension state stored with the seed (up to 256 bytes)
        #[arg(long, value_name = "HEX")]
        ext_state: Option<String>,

        /// Product name, serial number or device path (default: first key)
        #[arg(short, long, value_name = "SELECTOR")]
        device: Option<String>,
    },

    /// Print the effective configuration
    Config {
        /// Write the default configuration to the config file
        #[arg(long)]
        init: bool,
    },
}
