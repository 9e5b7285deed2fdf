//! The search task: one scan window feeding advertisements into the
//! device registry.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::SEARCH_DURATION;
use crate::core::bluetooth::transport::Transport;
use crate::registry::{DeviceRegistry, SharedRegistry};

/// Run one search until the scan window closes or `cancel` fires.
///
/// Returns the status for the SearchStopped signal: 0 on a clean stop,
/// a negative errno when the scan could not start.
pub async fn search_loop(
    registry: SharedRegistry,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) -> i32 {
    info!("starting device search");
    let stream = match transport.scan(SEARCH_DURATION).await {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("search failed to start: {e}");
            return e.rpc_status();
        }
    };
    tokio::pin!(stream);

    loop {
        tokio::select! {
            ad = stream.next() => {
                match ad {
                    Some(ad) => {
                        debug!(
                            "advertisement from {} ({:?}, rssi {:?}, pairing {})",
                            ad.address, ad.name, ad.rssi, ad.pairing
                        );
                        DeviceRegistry::on_advertisement(&registry, ad).await;
                    }
                    None => {
                        info!("search window closed");
                        return 0;
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("search cancelled");
                return 0;
            }
        }
    }
}
