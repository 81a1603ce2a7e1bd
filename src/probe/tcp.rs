use super::{Probe, ProbeOutcome};
use crate::address::AddressKey;
use async_trait::async_trait;
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
    time,
};

/// Times the TCP handshake with the target port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Performs the connection to the socket with timeout
    async fn connect(&self, socket: SocketAddr) -> io::Result<TcpStream> {
        time::timeout(self.timeout, async move { TcpStream::connect(socket).await }).await?
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, target: &AddressKey) -> ProbeOutcome {
        let socket = target.socket_addr();
        let start = Instant::now();

        match self.connect(socket).await {
            Ok(tcp_stream) => {
                let elapsed = start.elapsed();
                if let Err(e) = { tcp_stream }.shutdown().await {
                    debug!("Shutdown stream error {e}");
                }
                ProbeOutcome::reached(elapsed)
            }
            Err(e) => {
                if e.to_string().to_lowercase().contains("too many open files") {
                    warn!("Too many open files. Please reduce the concurrency or raise the ulimit.");
                }
                debug!("Handshake with {socket} failed: {e}");
                ProbeOutcome::failed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_with_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = AddressKey::from(listener.local_addr().unwrap());

        let outcome = TcpProbe::new(Duration::from_secs(1)).probe(&target).await;

        assert!(outcome.success);
        assert!(outcome.elapsed < Duration::from_secs(1));
        assert_eq!(outcome.location, None);
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = AddressKey::from(listener.local_addr().unwrap());
        drop(listener);

        let outcome = TcpProbe::new(Duration::from_secs(1)).probe(&target).await;

        assert_eq!(outcome, ProbeOutcome::failed());
    }
}
