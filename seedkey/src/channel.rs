//! CTAPHID channel negotiation
//!
//! Before any command can be sent, the host asks the key for a private
//! channel by sending INIT with a random nonce on the broadcast channel.
//! Other hosts may be negotiating at the same time, so only the response
//! echoing our nonce counts.

use std::time::Duration;

use seedkey_transport::protocol::{self, cmd, INIT_NONCE_SIZE};
use seedkey_transport::{send_message, Channel, InitResponse, Report, Transport, TransportError};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::{SeedingError, Stage};

/// Outcome of a successful negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGrant {
    /// Private channel for the rest of this session
    pub channel: Channel,
    /// Full INIT response (versions, capabilities)
    pub init: InitResponse,
}

/// Decode `report` as an INIT response for `nonce`.
///
/// Returns `None` for anything else: other commands, continuation frames,
/// truncated bodies, or another requester's nonce.
pub fn match_init_response(report: &Report, nonce: &[u8; INIT_NONCE_SIZE]) -> Option<InitResponse> {
    let frame = protocol::decode(report);
    if !frame.is_initialization || frame.command != cmd::INIT {
        return None;
    }
    let init = InitResponse::parse(frame.payload())?;
    (init.nonce == *nonce).then_some(init)
}

/// Obtain a private channel from an open device.
///
/// The report subscription lives only for the duration of this call.
pub async fn negotiate(device: &dyn Transport, timeout: Duration) -> Result<ChannelGrant, SeedingError> {
    let nonce: [u8; INIT_NONCE_SIZE] = rand::random();

    // Subscribe before sending so the response can't slip past
    let mut reports = device.subscribe_reports()?;
    send_message(device, Channel::BROADCAST, cmd::INIT, &nonce).await?;
    debug!("Sent INIT with nonce {:02x?}", nonce);

    let init = tokio::time::timeout(timeout, wait_for_init(&mut reports, &nonce))
        .await
        .map_err(|_| SeedingError::Timeout(Stage::ChannelNegotiation))??;

    debug!(
        "Negotiated channel {} (CTAPHID v{}, firmware {}, caps 0x{:02x})",
        init.channel,
        init.protocol_version,
        init.device_version(),
        init.capabilities
    );
    Ok(ChannelGrant {
        channel: init.channel,
        init,
    })
}

async fn wait_for_init(
    reports: &mut broadcast::Receiver<Report>,
    nonce: &[u8; INIT_NONCE_SIZE],
) -> Result<InitResponse, TransportError> {
    loop {
        match reports.recv().await {
            Ok(report) => match match_init_response(&report, nonce) {
                Some(init) => return Ok(init),
                None => trace!("Ignoring report while negotiating"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Dropped {} reports while negotiating", n);
            }
            Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Disconnected),
        }
    }
}
