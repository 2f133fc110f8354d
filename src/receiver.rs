use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Capacity of the drain-mode accumulation buffer
pub const DRAIN_CAPACITY: usize = 4096;

/// How replies are read from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Exactly one read call, whatever it returns
    Single,
    /// Keep reading until a timeout, EOF or a full buffer
    Drain,
}

/// Reads from `conn`, giving every read attempt its own `deadline`.
///
/// A timed out read and end-of-stream are not errors: they end the call with
/// whatever has been accumulated. Any other I/O error is returned to the
/// caller, which is expected to log it and carry on.
pub async fn receive<R>(conn: &mut R, deadline: Duration, mode: ReadMode) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; DRAIN_CAPACITY];
    let mut filled = 0;

    loop {
        let n = match timeout(deadline, conn.read(&mut buf[filled..])).await {
            Err(_) => {
                debug!("Timed out");
                break;
            }
            Ok(Ok(0)) => {
                debug!("EOF");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
        };

        debug!("Read {} bytes", n);
        filled += n;

        if mode == ReadMode::Single || filled >= DRAIN_CAPACITY {
            break;
        }
    }

    buf.truncate(filled);
    Ok(buf)
}
