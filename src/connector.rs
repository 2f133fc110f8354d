use super::Result;

use eyre::eyre;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Pause between connection attempts
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Connects to `address`, retrying every [`RETRY_INTERVAL`] until
/// `overall_timeout` has elapsed.
///
/// The target is usually a server we have just spawned, so refused
/// connections are expected for a short while and are not reported.
pub async fn connect(address: &str, overall_timeout: Duration) -> Result<TcpStream> {
    let started = Instant::now();

    let attempts = async {
        let mut attempt = 1u32;
        loop {
            match TcpStream::connect(address).await {
                Ok(stream) => return stream,
                Err(e) => {
                    debug!("Connection attempt {} to {} failed: {}", attempt, address, e);
                }
            }
            attempt += 1;
            sleep(RETRY_INTERVAL).await;
        }
    };

    match timeout(overall_timeout, attempts).await {
        Ok(stream) => {
            info!("Connected to {} after {:?}", address, started.elapsed());
            Ok(stream)
        }
        Err(_) => Err(eyre!(
            "Timed out connecting to {} after {:?}",
            address,
            overall_timeout
        )),
    }
}
