//! Reaching a peer two ways at once: dial them directly, or ask the server to have them dial us
//! (they answer with PierceFirewall). First success wins; the loser is dropped, which closes its
//! socket and revokes its token registration.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slsk_core::peer::SearchReply;
use slsk_core::wire::FrameEncodeError;
use slsk_core::{ConnectionType, PeerMessage, ServerRequest};
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::connection::{ConnectionError, PeerConnection, PeerIdentity};
use crate::pool::{ConnectRequest, ConnectionPool};
use crate::resolver::AddressResolver;
use crate::server::ServerHandle;

#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("neither path connected before the deadline")]
    Timeout,
    #[error("both connection paths failed")]
    Failed,
    #[error("delivery failed: {0}")]
    Delivery(#[from] ConnectionError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
}

/// Which path won a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    Direct,
    Indirect,
}

/// Tokens we asked the server to relay, waiting for the matching PierceFirewall.
#[derive(Debug, Default)]
pub struct PierceRegistry {
    pending: Mutex<HashMap<u32, oneshot::Sender<PeerConnection>>>,
}

impl PierceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for `token`. Dropping the registration revokes it.
    pub fn register(self: &Arc<Self>, token: u32) -> Registration {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(token, tx).is_some() {
            debug!(token, "replaced existing pierce registration");
        }
        Registration {
            token,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Hand an inbound PierceFirewall connection to whoever registered its token.
    /// Gives the connection back if nobody is waiting.
    pub fn fulfil(&self, token: u32, conn: PeerConnection) -> Result<(), PeerConnection> {
        let waiter = self.pending.lock().remove(&token);
        match waiter {
            Some(tx) => tx.send(conn),
            None => Err(conn),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn revoke(&self, token: u32) {
        self.pending.lock().remove(&token);
    }
}

pub struct Registration {
    token: u32,
    rx: oneshot::Receiver<PeerConnection>,
    registry: Arc<PierceRegistry>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("token", &self.token).finish()
    }
}

impl Registration {
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Resolve once the peer pierces through; `identity` is attached to the connection.
    pub async fn wait(mut self, identity: PeerIdentity) -> Result<PeerConnection, ConnectionError> {
        let mut conn = (&mut self.rx).await.map_err(|_| ConnectionError::Closed)?;
        conn.set_identity(identity);
        Ok(conn)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.revoke(self.token);
    }
}

/// Race two connection attempts under one deadline. The first success wins and the other
/// future is dropped; a failure on one side leaves the other running.
pub async fn race_connection<D, I, E>(
    direct: D,
    indirect: I,
    deadline: Duration,
) -> Result<(PeerConnection, Path), RaceError>
where
    D: Future<Output = Result<PeerConnection, E>>,
    I: Future<Output = Result<PeerConnection, E>>,
    E: fmt::Display,
{
    let race = async {
        tokio::pin!(direct);
        tokio::pin!(indirect);
        let mut direct_done = false;
        let mut indirect_done = false;
        loop {
            tokio::select! {
                res = &mut direct, if !direct_done => match res {
                    Ok(conn) => return Ok((conn, Path::Direct)),
                    Err(e) => {
                        debug!(error = %e, "direct path failed");
                        direct_done = true;
                    }
                },
                res = &mut indirect, if !indirect_done => match res {
                    Ok(conn) => return Ok((conn, Path::Indirect)),
                    Err(e) => {
                        debug!(error = %e, "indirect path failed");
                        indirect_done = true;
                    }
                },
                else => return Err(RaceError::Failed),
            }
        }
    };
    tokio::time::timeout(deadline, race)
        .await
        .map_err(|_| RaceError::Timeout)?
}

/// Opens connections to a user by racing a resolved direct dial against a server-relayed one.
pub struct PeerDialer {
    own_username: String,
    pool: Arc<ConnectionPool>,
    registry: Arc<PierceRegistry>,
    resolver: Arc<dyn AddressResolver>,
    server: ServerHandle,
    connect_timeout: Duration,
    deadline: Duration,
}

#[derive(Debug, thiserror::Error)]
enum PathError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
    #[error(transparent)]
    Server(#[from] crate::server::ServerError),
}

impl PeerDialer {
    pub fn new(
        own_username: impl Into<String>,
        pool: Arc<ConnectionPool>,
        registry: Arc<PierceRegistry>,
        resolver: Arc<dyn AddressResolver>,
        server: ServerHandle,
        connect_timeout: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            own_username: own_username.into(),
            pool,
            registry,
            resolver,
            server,
            connect_timeout,
            deadline,
        }
    }

    #[instrument(skip(self))]
    pub async fn open(
        &self,
        username: &str,
        conn_type: ConnectionType,
    ) -> Result<(PeerConnection, Path), RaceError> {
        let token: u32 = rand::random();
        let identity = PeerIdentity::new(username, conn_type, token);
        let registration = self.registry.register(token);

        let direct = async {
            let addr = self.resolver.resolve(username).await.map_err(ConnectionError::from)?;
            let request = ConnectRequest {
                username: username.to_owned(),
                addr,
                token,
                conn_type,
                indirect: false,
            };
            Ok::<_, PathError>(self.pool.connect(&request, self.connect_timeout).await?)
        };
        let indirect = async {
            self.server.send(ServerRequest::ConnectToPeer {
                token,
                username: username.to_owned(),
                conn_type,
            })?;
            Ok::<_, PathError>(registration.wait(identity.clone()).await?)
        };
        let (conn, path) = race_connection(direct, indirect, self.deadline).await?;
        debug!(username, ?path, "peer reached");
        Ok((conn, path))
    }

    pub fn own_username(&self) -> &str {
        &self.own_username
    }
}

/// Delivers local search results to whoever asked.
pub struct SearchResponder {
    dialer: Arc<PeerDialer>,
}

impl SearchResponder {
    pub fn new(dialer: Arc<PeerDialer>) -> Self {
        Self { dialer }
    }

    #[instrument(skip(self, reply), fields(token = reply.token, files = reply.files.len()))]
    pub async fn respond(&self, username: &str, reply: SearchReply) -> Result<Path, RaceError> {
        let frame = PeerMessage::SearchReply(reply).to_frame()?;
        let (mut conn, path) = self.dialer.open(username, ConnectionType::Peer).await?;
        conn.send(frame).await?;
        debug!(username, ?path, "search reply delivered");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_revoked_on_drop() {
        let registry = PierceRegistry::new();
        let reg = registry.register(5);
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(reg.token(), 5);
        drop(reg);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn race_times_out() {
        let never = std::future::pending::<Result<PeerConnection, ConnectionError>>();
        let also_never = std::future::pending::<Result<PeerConnection, ConnectionError>>();
        let res = race_connection(never, also_never, Duration::from_secs(12)).await;
        assert!(matches!(res, Err(RaceError::Timeout)));
    }

    #[tokio::test]
    async fn race_fails_when_both_fail() {
        let a = async { Err::<PeerConnection, _>(ConnectionError::Closed) };
        let b = async { Err::<PeerConnection, _>(ConnectionError::ConnectTimeout) };
        let res = race_connection(a, b, Duration::from_secs(12)).await;
        assert!(matches!(res, Err(RaceError::Failed)));
    }
}
