use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Loopback targets for msgbounds runs
pub struct SocketTestUtils;

impl SocketTestUtils {
    /// Accepts one connection and collects everything sent until EOF
    pub async fn sink() -> Result<(String, JoinHandle<Result<Vec<u8>>>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok::<_, anyhow::Error>(buf)
        });
        Ok((address, handle))
    }

    /// Accepts one connection, greets it with `banner` and echoes every chunk
    pub async fn echo(banner: &'static [u8]) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            stream.write_all(banner).await?;
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await?;
            }
            Ok::<_, std::io::Error>(())
        });
        Ok(address)
    }

    /// An address nothing is listening on
    pub async fn closed_address() -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        drop(listener);
        Ok(address)
    }
}
