//! Auxiliary key operations: identify (wink) and probe

use seedkey_transport::protocol::cmd;
use seedkey_transport::{send_message, InitResponse, Transport};
use tracing::{debug, info};

use crate::channel::negotiate;
use crate::error::SeedingError;
use crate::session::{await_reply, close_after, expect_echo, SeedingTimeouts};

/// Make the key blink so the user can tell which one is selected.
///
/// Keys that don't advertise the WINK capability usually answer with an
/// ERROR, mapped like any other result code.
pub async fn wink(device: &dyn Transport, timeouts: &SeedingTimeouts) -> Result<(), SeedingError> {
    device.open().await?;
    let result = async {
        let grant = negotiate(device, timeouts.negotiate).await?;
        if !grant.init.supports_wink() {
            debug!("Key does not advertise WINK, sending anyway");
        }
        let mut reports = device.subscribe_reports()?;
        send_message(device, grant.channel, cmd::WINK, &[]).await?;
        let reply = await_reply(&mut reports, grant.channel, timeouts.response).await?;
        expect_echo(reply, cmd::WINK).map(|_| ())
    }
    .await;
    let result = close_after(device, result).await;

    if result.is_ok() {
        info!("Winked {}", device.device_info().display_name());
    }
    result
}

/// Negotiate a channel and report what the key says about itself
pub async fn probe(
    device: &dyn Transport,
    timeouts: &SeedingTimeouts,
) -> Result<InitResponse, SeedingError> {
    device.open().await?;
    let result = negotiate(device, timeouts.negotiate)
        .await
        .map(|grant| grant.init);
    close_after(device, result).await
}
