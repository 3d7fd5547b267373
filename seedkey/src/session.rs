//! Shared plumbing for one open/negotiate/command/close exchange

use std::time::Duration;

use seedkey_transport::protocol::{self, cmd};
use seedkey_transport::{Channel, Message, MessageAssembler, Report, Transport, TransportError};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::{SeedingError, Stage};

/// Default bound on the INIT handshake
pub const DEFAULT_NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on a command response (covers the user's touch)
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bounds on every wait for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedingTimeouts {
    pub negotiate: Duration,
    pub response: Duration,
}

impl Default for SeedingTimeouts {
    fn default() -> Self {
        Self {
            negotiate: DEFAULT_NEGOTIATE_TIMEOUT,
            response: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Wait for the complete reply on `channel`.
///
/// Frames on other channels belong to other sessions and are skipped.
/// KEEPALIVE messages mean the key is still busy (usually waiting for a
/// touch) and don't end the wait.
pub(crate) async fn await_reply(
    reports: &mut broadcast::Receiver<Report>,
    channel: Channel,
    timeout: Duration,
) -> Result<Message, SeedingError> {
    tokio::time::timeout(timeout, collect_reply(reports, channel))
        .await
        .map_err(|_| SeedingError::Timeout(Stage::AwaitingResponse))?
}

async fn collect_reply(
    reports: &mut broadcast::Receiver<Report>,
    channel: Channel,
) -> Result<Message, SeedingError> {
    let mut assembler = MessageAssembler::new();
    loop {
        let report = match reports.recv().await {
            Ok(report) => report,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Dropped {} reports while awaiting reply", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(TransportError::Disconnected.into())
            }
        };

        let frame = protocol::decode(&report);
        if frame.channel != channel {
            trace!("Ignoring frame for channel {}", frame.channel);
            continue;
        }

        match assembler.push(&frame)? {
            Some(message) if message.command == cmd::KEEPALIVE => {
                debug!("Keepalive, status {:?}", message.payload.first());
            }
            Some(message) => return Ok(message),
            None => {}
        }
    }
}

/// Interpret a reply to `command`: its echo is success, ERROR carries a
/// result code, anything else is unrecognized.
pub(crate) fn expect_echo(reply: Message, command: u8) -> Result<Message, SeedingError> {
    match reply.command {
        c if c == command => Ok(reply),
        cmd::ERROR => Err(SeedingError::from_ctap_result(reply.payload.first().copied())),
        other => {
            debug!("Unexpected {} reply to {}", cmd::name(other), cmd::name(command));
            Err(SeedingError::Unknown(None))
        }
    }
}

/// Close `device` and merge the outcome with the session result.
///
/// A session failure wins over a close failure, which is then only logged.
pub(crate) async fn close_after<T>(
    device: &dyn Transport,
    result: Result<T, SeedingError>,
) -> Result<T, SeedingError> {
    let closed = device.close().await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(
                "Closing {} after failure also failed: {}",
                device.device_info().device_path,
                close_err
            );
            Err(e)
        }
    }
}
