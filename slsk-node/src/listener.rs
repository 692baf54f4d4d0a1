//! Inbound peer socket acceptor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Opening, PeerConnection};
use crate::race::PierceRegistry;

pub struct Listener {
    listener: TcpListener,
    handshake_timeout: Duration,
    registry: Arc<PierceRegistry>,
    incoming: mpsc::Sender<PeerConnection>,
}

impl Listener {
    /// Bind on all interfaces. Port 0 picks a free port.
    pub async fn bind(
        port: u16,
        handshake_timeout: Duration,
        registry: Arc<PierceRegistry>,
        incoming: mpsc::Sender<PeerConnection>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self::from_listener(listener, handshake_timeout, registry, incoming))
    }

    pub fn from_listener(
        listener: TcpListener,
        handshake_timeout: Duration,
        registry: Arc<PierceRegistry>,
        incoming: mpsc::Sender<PeerConnection>,
    ) -> Self {
        Self {
            listener,
            handshake_timeout,
            registry,
            incoming,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the receiving side of `incoming` goes away.
    /// PierceFirewall connections go to whoever registered the token; PeerInit connections go to `incoming`.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening for peers");
        }
        loop {
            if self.incoming.is_closed() {
                break;
            }
            match self.listener.accept().await {
                Ok((stream, addr)) => self.handle(stream, addr),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn handle(&self, stream: TcpStream, addr: SocketAddr) {
        let timeout = self.handshake_timeout;
        let registry = self.registry.clone();
        let incoming = self.incoming.clone();
        tokio::spawn(async move {
            match PeerConnection::accept(stream, addr, timeout).await {
                Ok((conn, Opening::PierceFirewall { token })) => {
                    if let Err(mut orphan) = registry.fulfil(token, conn) {
                        debug!(%addr, token, "no one waiting for pierced connection");
                        orphan.disconnect();
                    }
                }
                Ok((conn, Opening::PeerInit)) => {
                    let _ = incoming.send(conn).await;
                }
                Err(e) => debug!(%addr, error = %e, "inbound handshake failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PeerIdentity;
    use slsk_core::ConnectionType;

    #[tokio::test]
    async fn routes_by_opening_message() {
        let registry = PierceRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let listener = Listener::bind(0, Duration::from_secs(5), registry.clone(), tx)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        tokio::spawn(listener.run());

        let _direct = PeerConnection::connect_direct(
            addr,
            "alice",
            PeerIdentity::new("me", ConnectionType::Distributed, 1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.username(), "alice");
        assert_eq!(conn.identity().conn_type, ConnectionType::Distributed);

        let reg = registry.register(77);
        let _pierce = PeerConnection::connect_indirect(
            addr,
            PeerIdentity::new("me", ConnectionType::Peer, 77),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let conn = reg
            .wait(PeerIdentity::new("bob", ConnectionType::Peer, 77))
            .await
            .unwrap();
        assert_eq!(conn.username(), "bob");
        assert_eq!(registry.pending_count(), 0);
    }
}
