//! Secondary UDP data channel
//!
//! A subscriber may ask for data packets to be published over UDP to a port on
//! its own address. Sends never wait: a datagram the socket cannot take right
//! now is dropped and counted, matching UDP's best-effort delivery.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::metrics::TransportMetrics;
use crate::error::{Result, TransportError};

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug)]
pub struct UdpDataChannel {
    socket: UdpSocket,
    target: SocketAddr,
    metrics: TransportMetrics,
}

impl UdpDataChannel {
    pub async fn connect(target: SocketAddr, metrics: TransportMetrics) -> Result<Self> {
        let local = match target.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        debug!(%target, "UDP data channel opened");
        Ok(Self {
            socket,
            target,
            metrics,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Sends one datagram without waiting for socket readiness.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::protocol(format!(
                "datagram of {} bytes exceeds UDP limit {MAX_DATAGRAM_SIZE}",
                data.len()
            )));
        }

        match self.socket.try_send(data) {
            Ok(sent) => {
                self.metrics.record_send(sent);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!(target = %self.target, bytes = data.len(), "UDP socket busy, datagram dropped");
                self.metrics.record_error();
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e.into())
            }
        }
    }
}
