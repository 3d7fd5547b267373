//! Seed programming (vendor LOADKEY command)
//!
//! One seeding transaction walks a fixed sequence of states:
//!
//! ```text
//! Idle -> ChannelNegotiating -> PayloadSending -> AwaitingResponse -> Succeeded | Failed
//! ```
//!
//! The device is opened at the start and closed on every exit path once
//! opened. Nothing is reused between transactions: each one gets a fresh
//! nonce and channel.

use std::fmt;

use seedkey_transport::protocol::cmd;
use seedkey_transport::{send_message, Transport};
use tracing::{debug, info, warn};

use crate::channel::negotiate;
use crate::error::SeedingError;
use crate::session::{await_reply, close_after, expect_echo, SeedingTimeouts};

/// Seed length accepted by the key
pub const SEED_SIZE: usize = 32;

/// Upper bound on the opaque extension state
pub const MAX_EXT_STATE_SIZE: usize = 256;

/// LOADKEY payload format version
pub const SEED_PROTOCOL_VERSION: u8 = 1;

/// Validated LOADKEY request
#[derive(Clone, PartialEq, Eq)]
pub struct SeedCommand {
    seed: [u8; SEED_SIZE],
    ext_state: Vec<u8>,
}

impl SeedCommand {
    pub fn new(seed: &[u8], ext_state: &[u8]) -> Result<Self, SeedingError> {
        let seed: [u8; SEED_SIZE] = seed
            .try_into()
            .map_err(|_| SeedingError::InvalidSeedLength(seed.len()))?;
        if ext_state.len() > MAX_EXT_STATE_SIZE {
            return Err(SeedingError::ExtStateTooLong(ext_state.len()));
        }
        Ok(Self {
            seed,
            ext_state: ext_state.to_vec(),
        })
    }

    /// `[version] ++ seed ++ ext_state`
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + SEED_SIZE + self.ext_state.len());
        payload.push(SEED_PROTOCOL_VERSION);
        payload.extend_from_slice(&self.seed);
        payload.extend_from_slice(&self.ext_state);
        payload
    }
}

// Never print seed material
impl fmt::Debug for SeedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedCommand")
            .field("ext_state_len", &self.ext_state.len())
            .finish_non_exhaustive()
    }
}

/// Progress of one seeding transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedWriteState {
    Idle,
    ChannelNegotiating,
    PayloadSending,
    AwaitingResponse,
    Succeeded,
    Failed,
}

struct StateTrace<'a> {
    device: &'a str,
    state: SeedWriteState,
}

impl<'a> StateTrace<'a> {
    fn new(device: &'a str) -> Self {
        Self {
            device,
            state: SeedWriteState::Idle,
        }
    }

    fn advance(&mut self, next: SeedWriteState) {
        debug!("Seeding {}: {:?} -> {:?}", self.device, self.state, next);
        self.state = next;
    }
}

/// Program `seed` (and optional extension state) onto a key.
///
/// Validation happens before the device is touched. Every wait is bounded by
/// `timeouts`.
pub async fn write_seed(
    device: &dyn Transport,
    seed: &[u8],
    ext_state: &[u8],
    timeouts: &SeedingTimeouts,
) -> Result<(), SeedingError> {
    let command = SeedCommand::new(seed, ext_state)?;
    let path = device.device_info().device_path.clone();
    let mut trace = StateTrace::new(&path);

    device.open().await?;
    let result = run_seed_session(device, &command, timeouts, &mut trace).await;
    let result = close_after(device, result).await;

    match &result {
        Ok(()) => {
            trace.advance(SeedWriteState::Succeeded);
            info!("Seeded {}", device.device_info().display_name());
        }
        Err(e) => {
            trace.advance(SeedWriteState::Failed);
            warn!("Seeding {} failed: {}", path, e);
        }
    }
    result
}

async fn run_seed_session(
    device: &dyn Transport,
    command: &SeedCommand,
    timeouts: &SeedingTimeouts,
    trace: &mut StateTrace<'_>,
) -> Result<(), SeedingError> {
    trace.advance(SeedWriteState::ChannelNegotiating);
    let grant = negotiate(device, timeouts.negotiate).await?;

    trace.advance(SeedWriteState::PayloadSending);
    let mut reports = device.subscribe_reports()?;
    let frames = send_message(device, grant.channel, cmd::LOADKEY, &command.to_payload()).await?;
    debug!("Sent LOADKEY in {} frames on channel {}", frames, grant.channel);

    trace.advance(SeedWriteState::AwaitingResponse);
    let reply = await_reply(&mut reports, grant.channel, timeouts.response).await?;
    expect_echo(reply, cmd::LOADKEY).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_command_payload_layout() {
        let seed = [0xABu8; SEED_SIZE];
        let command = SeedCommand::new(&seed, &[1, 2, 3]).unwrap();
        let payload = command.to_payload();
        assert_eq!(payload.len(), 1 + 32 + 3);
        assert_eq!(payload[0], SEED_PROTOCOL_VERSION);
        assert_eq!(&payload[1..33], &seed);
        assert_eq!(&payload[33..], &[1, 2, 3]);
    }

    #[test]
    fn test_seed_command_validation() {
        assert!(matches!(
            SeedCommand::new(&[0u8; 31], &[]),
            Err(SeedingError::InvalidSeedLength(31))
        ));
        assert!(matches!(
            SeedCommand::new(&[0u8; 33], &[]),
            Err(SeedingError::InvalidSeedLength(33))
        ));
        assert!(SeedCommand::new(&[0u8; 32], &[0u8; MAX_EXT_STATE_SIZE]).is_ok());
        assert!(matches!(
            SeedCommand::new(&[0u8; 32], &[0u8; MAX_EXT_STATE_SIZE + 1]),
            Err(SeedingError::ExtStateTooLong(257))
        ));
    }

    #[test]
    fn test_debug_hides_seed() {
        let command = SeedCommand::new(&[0x5Au8; SEED_SIZE], &[]).unwrap();
        let printed = format!("{:?}", command);
        assert!(!printed.contains("90"));
        assert!(printed.contains("ext_state_len"));
    }
}
