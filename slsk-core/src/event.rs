//! Events surfaced to the application embedding the client.

use std::net::Ipv4Addr;

use crate::peer::{PeerMessage, SearchReply, UserInfo};
use crate::protocol::{UserStats, UserStatus};
use crate::server::RoomUser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    LoggedIn {
        greeting: String,
        own_ip: Ipv4Addr,
    },
    LoginFailed {
        reason: String,
    },
    /// Another client logged in with our name; the server closes this session.
    Relogged,
    RoomJoined {
        room: String,
        users: Vec<RoomUser>,
    },
    RoomLeft {
        room: String,
    },
    RoomMessage {
        room: String,
        username: String,
        message: String,
    },
    UserJoinedRoom {
        room: String,
        user: RoomUser,
    },
    UserLeftRoom {
        room: String,
        username: String,
    },
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
    },
    UserStatus {
        username: String,
        status: UserStatus,
        privileged: bool,
    },
    UserStats {
        username: String,
        stats: UserStats,
    },
    /// A peer answered one of our searches.
    SearchResults(SearchReply),
    DistributedParentChanged {
        parent: Option<String>,
    },
    DistributedBranch {
        level: u32,
        root: String,
    },
    DistributedChildrenChanged {
        count: usize,
    },
    /// A peer request the client does not answer by itself (transfers, queue updates).
    PeerRequest {
        username: String,
        message: PeerMessage,
    },
    UserInfo {
        username: String,
        info: UserInfo,
    },
    ConnectionFailed {
        username: String,
        token: u32,
    },
}
