//! Username → address resolution, answered by the server's GetPeerAddress replies.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use slsk_core::ServerRequest;
use tokio::sync::oneshot;
use tracing::debug;

use crate::server::ServerHandle;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("user {0} is offline")]
    Offline(String),
    #[error("timed out resolving {0}")]
    Timeout(String),
    #[error("server connection closed")]
    ServerClosed,
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, username: &str) -> Result<SocketAddr, ResolveError>;
}

type Waiter = oneshot::Sender<Result<SocketAddr, ResolveError>>;

/// Resolves through the server. Concurrent lookups for one user share a single request.
pub struct ServerResolver {
    server: ServerHandle,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    timeout: Duration,
}

impl ServerResolver {
    pub fn new(server: ServerHandle, timeout: Duration) -> Self {
        Self {
            server,
            waiters: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Feed a GetPeerAddress reply from the server read loop.
    pub fn on_peer_address(&self, username: &str, ip: Ipv4Addr, port: u16) {
        let Some(waiters) = self.waiters.lock().remove(username) else {
            debug!(username, "unsolicited peer address");
            return;
        };
        let result = if ip.is_unspecified() {
            Err(ResolveError::Offline(username.to_owned()))
        } else {
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }

    fn forget_closed(&self, username: &str) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(username) {
            list.retain(|w| !w.is_closed());
            if list.is_empty() {
                waiters.remove(username);
            }
        }
    }
}

/// One caller's wait. However the lookup ends, even by being dropped mid-race, its waiter and
/// any other abandoned ones for the same user are pruned.
struct Lookup<'a> {
    resolver: &'a ServerResolver,
    username: &'a str,
    rx: oneshot::Receiver<Result<SocketAddr, ResolveError>>,
}

impl Drop for Lookup<'_> {
    fn drop(&mut self) {
        self.rx.close();
        self.resolver.forget_closed(self.username);
    }
}

#[async_trait]
impl AddressResolver for ServerResolver {
    async fn resolve(&self, username: &str) -> Result<SocketAddr, ResolveError> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = self.waiters.lock();
            let list = waiters.entry(username.to_owned()).or_default();
            list.push(tx);
            list.len() == 1
        };
        let mut lookup = Lookup {
            resolver: self,
            username,
            rx,
        };
        if first {
            let request = ServerRequest::GetPeerAddress {
                username: username.to_owned(),
            };
            if self.server.send(request).is_err() {
                return Err(ResolveError::ServerClosed);
            }
        }
        match tokio::time::timeout(self.timeout, &mut lookup.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResolveError::ServerClosed),
            Err(_) => Err(ResolveError::Timeout(username.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn concurrent_lookups_share_one_request() {
        let (server, mut requests) = ServerHandle::channel();
        let resolver = Arc::new(ServerResolver::new(server, Duration::from_secs(5)));
        let a = tokio::spawn({
            let r = resolver.clone();
            async move { r.resolve("bob").await }
        });
        let b = tokio::spawn({
            let r = resolver.clone();
            async move { r.resolve("bob").await }
        });
        let first = requests.recv().await.unwrap();
        assert_eq!(
            first,
            ServerRequest::GetPeerAddress {
                username: "bob".into()
            }
        );
        while resolver.pending() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(requests.try_recv().is_err());
        resolver.on_peer_address("bob", Ipv4Addr::new(10, 0, 0, 2), 2234);
        let want: SocketAddr = "10.0.0.2:2234".parse().unwrap();
        assert_eq!(a.await.unwrap(), Ok(want));
        assert_eq!(b.await.unwrap(), Ok(want));
        assert_eq!(resolver.pending(), 0);
    }

    #[tokio::test]
    async fn zero_address_means_offline() {
        let (server, _requests) = ServerHandle::channel();
        let resolver = Arc::new(ServerResolver::new(server, Duration::from_secs(5)));
        let task = tokio::spawn({
            let r = resolver.clone();
            async move { r.resolve("ghost").await }
        });
        while resolver.pending() < 1 {
            tokio::task::yield_now().await;
        }
        resolver.on_peer_address("ghost", Ipv4Addr::UNSPECIFIED, 0);
        assert_eq!(
            task.await.unwrap(),
            Err(ResolveError::Offline("ghost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_times_out() {
        let (server, _requests) = ServerHandle::channel();
        let resolver = ServerResolver::new(server, Duration::from_secs(10));
        assert_eq!(
            resolver.resolve("slow").await,
            Err(ResolveError::Timeout("slow".into()))
        );
        assert_eq!(resolver.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lookup_is_forgotten() {
        let (server, mut requests) = ServerHandle::channel();
        let resolver = ServerResolver::new(server, Duration::from_secs(10));
        let gave_up = tokio::time::timeout(Duration::from_secs(1), resolver.resolve("bob")).await;
        assert!(gave_up.is_err());
        assert_eq!(resolver.pending(), 0);
        assert!(requests.try_recv().is_ok());

        // With nobody left waiting, the next lookup asks the server again.
        let gave_up = tokio::time::timeout(Duration::from_secs(1), resolver.resolve("bob")).await;
        assert!(gave_up.is_err());
        assert!(requests.try_recv().is_ok());
        assert_eq!(resolver.pending(), 0);
    }
}
