//! Soulseek client runtime on tokio: server session, peer connections, connection pool,
//! search delivery, and the distributed network.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod distributed;
pub mod listener;
pub mod peers;
pub mod pool;
pub mod race;
pub mod resolver;
pub mod search;
pub mod server;
pub mod shares;

pub use client::{Client, ClientError, ClientHandle, Command};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionError, HandshakeState, PeerConnection, PeerIdentity};
pub use pool::{ConnectQueue, ConnectRequest, ConnectionPool, Established, PoolError};
pub use race::{race_connection, PeerDialer, PierceRegistry, RaceError, SearchResponder};
