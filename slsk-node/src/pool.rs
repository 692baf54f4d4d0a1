//! Outbound connection bookkeeping: one attempt per (username, token) and a throttled queue for
//! server-relayed ConnectToPeer requests.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slsk_core::ConnectionType;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::connection::{ConnectionError, PeerConnection, PeerIdentity};

pub type PoolKey = (String, u32);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection to {0} with token {1} already in flight")]
    Duplicate(String, u32),
    #[error("connect queue is full")]
    QueueFull,
    #[error("connect queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Connect(#[from] ConnectionError),
}

/// One outbound connection to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub username: String,
    pub addr: SocketAddr,
    pub token: u32,
    pub conn_type: ConnectionType,
    /// Open with PierceFirewall (answering a relayed ConnectToPeer) instead of PeerInit.
    pub indirect: bool,
}

impl ConnectRequest {
    pub fn key(&self) -> PoolKey {
        (self.username.clone(), self.token)
    }
}

/// Removes its key from the in-flight set when the attempt ends, however it ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<PoolKey>>,
    key: Option<PoolKey>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.set.lock().remove(&key);
        }
    }
}

/// Keeps `key` in the established set for as long as it lives.
#[derive(Debug)]
pub struct Established {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
}

impl Drop for Established {
    fn drop(&mut self) {
        self.pool.established.lock().remove(&self.key);
    }
}

#[derive(Debug)]
pub struct ConnectionPool {
    own_username: String,
    in_flight: Mutex<HashSet<PoolKey>>,
    established: Mutex<HashSet<PoolKey>>,
}

impl ConnectionPool {
    pub fn new(own_username: impl Into<String>) -> Self {
        Self {
            own_username: own_username.into(),
            in_flight: Mutex::new(HashSet::new()),
            established: Mutex::new(HashSet::new()),
        }
    }

    /// Open a connection. A second call for a key already in flight fails at once with
    /// `Duplicate` and opens nothing. The key only counts as established while whoever serves
    /// the connection holds `hold(key)`.
    pub async fn connect(
        &self,
        request: &ConnectRequest,
        timeout: Duration,
    ) -> Result<PeerConnection, PoolError> {
        let key = request.key();
        if !self.in_flight.lock().insert(key.clone()) {
            debug!(username = %key.0, token = key.1, "duplicate connect rejected");
            return Err(PoolError::Duplicate(key.0, key.1));
        }
        let _guard = InFlight {
            set: &self.in_flight,
            key: Some(key.clone()),
        };
        let identity = PeerIdentity::new(request.username.clone(), request.conn_type, request.token);
        let conn = if request.indirect {
            PeerConnection::connect_indirect(request.addr, identity, timeout).await?
        } else {
            PeerConnection::connect_direct(request.addr, &self.own_username, identity, timeout)
                .await?
        };
        Ok(conn)
    }

    /// Mark `key` as served until the returned guard drops.
    pub fn hold(self: &Arc<Self>, key: PoolKey) -> Established {
        self.established.lock().insert(key.clone());
        Established {
            pool: Arc::clone(self),
            key,
        }
    }

    pub fn is_established(&self, key: &PoolKey) -> bool {
        self.established.lock().contains(key)
    }

    pub fn established_count(&self) -> usize {
        self.established.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Bounded FIFO of connect requests drained by one worker at a fixed minimum spacing.
/// Full queue means the request is dropped; callers are never blocked.
#[derive(Debug, Clone)]
pub struct ConnectQueue {
    tx: mpsc::Sender<ConnectRequest>,
}

impl ConnectQueue {
    /// Start the worker. `handler` is called once per dequeued request, spaced at least
    /// `min_interval` apart; the future it returns runs on its own task so a slow dial does not
    /// hold up the queue. Requests whose key is already established are skipped.
    pub fn spawn<F, Fut>(
        pool: Arc<ConnectionPool>,
        capacity: usize,
        min_interval: Duration,
        handler: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: Fn(ConnectRequest) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<ConnectRequest>(capacity.max(1));
        let worker = tokio::spawn(async move {
            let mut pace = tokio::time::interval(min_interval);
            pace.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while let Some(request) = rx.recv().await {
                pace.tick().await;
                // Checked after the wait: the key may have been served meanwhile.
                if pool.is_established(&request.key()) {
                    trace!(username = %request.username, token = request.token, "already connected; skipping");
                    continue;
                }
                tokio::spawn(handler(request));
            }
        });
        (Self { tx }, worker)
    }

    pub fn enqueue(&self, request: ConnectRequest) -> Result<(), PoolError> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(dropped) => {
                debug!(username = %dropped.username, token = dropped.token, "connect queue full; dropping");
                PoolError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => PoolError::QueueClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn request(name: &str, token: u32) -> ConnectRequest {
        ConnectRequest {
            username: name.into(),
            addr: "127.0.0.1:1".parse().unwrap(),
            token,
            conn_type: ConnectionType::Peer,
            indirect: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_spaces_dials() {
        let pool = Arc::new(ConnectionPool::new("me"));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let (queue, _worker) = ConnectQueue::spawn(pool, 100, Duration::from_millis(50), {
            let stamps = stamps.clone();
            move |_req| {
                stamps.lock().push(Instant::now());
                async {}
            }
        });
        for i in 0..10 {
            queue.enqueue(request("u", i)).unwrap();
        }
        while stamps.lock().len() < 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stamps = stamps.lock();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn full_queue_drops_excess() {
        let pool = Arc::new(ConnectionPool::new("me"));
        let (queue, _worker) =
            ConnectQueue::spawn(pool, 3, Duration::from_millis(50), |_req| async {});
        // No await in between, so the worker cannot drain anything yet.
        let results: Vec<_> = (0..6).map(|i| queue.enqueue(request("u", i))).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert!(results[3..]
            .iter()
            .all(|r| matches!(r, Err(PoolError::QueueFull))));
    }

    #[tokio::test(start_paused = true)]
    async fn established_keys_are_skipped() {
        let pool = Arc::new(ConnectionPool::new("me"));
        let held = pool.hold(("u".into(), 1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (queue, _worker) = ConnectQueue::spawn(pool.clone(), 10, Duration::from_millis(5), {
            let seen = seen.clone();
            move |req: ConnectRequest| {
                seen.lock().push(req.token);
                async {}
            }
        });
        queue.enqueue(request("u", 1)).unwrap();
        queue.enqueue(request("u", 2)).unwrap();
        while seen.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec![2]);
        drop(held);
        assert!(!pool.is_established(&("u".into(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn key_served_during_pacing_wait_is_skipped() {
        let pool = Arc::new(ConnectionPool::new("me"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::new(Mutex::new(Vec::new()));
        let (queue, _worker) = ConnectQueue::spawn(pool.clone(), 10, Duration::from_millis(50), {
            let (pool, seen, held) = (pool.clone(), seen.clone(), held.clone());
            move |req: ConnectRequest| {
                seen.lock().push(req.token);
                let (pool, held) = (pool.clone(), held.clone());
                async move {
                    // The peer reaches us on its own while token 2 waits its turn.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    held.lock().push(pool.hold(("u".into(), 2)));
                }
            }
        });
        queue.enqueue(request("u", 1)).unwrap();
        queue.enqueue(request("u", 2)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock(), vec![1]);
        assert!(pool.is_established(&("u".into(), 2)));
    }
}
