//! Seed programming for FIDO security keys
//!
//! Builds on `seedkey-transport` to provide:
//!
//! - Channel negotiation (CTAPHID INIT with nonce matching)
//! - The seed write transaction (vendor LOADKEY command) with typed errors
//! - Wink and probe helpers
//! - A device monitor tracking which seedable keys are attached
//!
//! # Example
//!
//! ```ignore
//! use seedkey::{KeySeeder, SeedingTimeouts};
//! use seedkey_transport::{DeviceDiscovery, HidDiscovery};
//!
//! let discovery = HidDiscovery::new();
//! let device = discovery.list_devices().await?.into_iter().find(seedkey::is_eligible)?;
//! let transport = discovery.open_device(&device)?;
//!
//! let seeder = KeySeeder::new(SeedingTimeouts::default());
//! seeder.write_seed(transport.as_ref(), &seed, &[]).await?;
//! ```

pub mod channel;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod ops;
pub mod seed;
pub mod seeder;
pub mod session;

pub use channel::{negotiate, ChannelGrant};
pub use error::{SeedingError, Stage};
pub use lock::DeviceLocks;
pub use monitor::{DeviceMonitor, MonitorSubscription};
pub use ops::{probe, wink};
pub use seed::{
    write_seed, SeedCommand, SeedWriteState, MAX_EXT_STATE_SIZE, SEED_PROTOCOL_VERSION, SEED_SIZE,
};
pub use seeder::KeySeeder;
pub use session::{SeedingTimeouts, DEFAULT_NEGOTIATE_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT};

// Re-export transport types callers need alongside these operations
pub use seedkey_transport::{is_eligible, DeviceKeyKind, InitResponse, TransportDeviceInfo};
