//! Soulseek protocol engine.
//! Framing, message catalogs and the distributed tree. No I/O; hosts drive it.

pub mod compress;
pub mod dispatch;
pub mod distributed;
pub mod event;
pub mod peer;
pub mod protocol;
pub mod search;
pub mod server;
pub mod tree;
pub mod wire;

pub use dispatch::{Dispatch, HandlerTable};
pub use distributed::DistributedMessage;
pub use event::Event;
pub use peer::{PeerInitMessage, PeerMessage, SearchReply};
pub use protocol::{ConnectionType, FileEntry, Folder, UserStatus};
pub use search::{InMemoryShareIndex, ResultFilter, SearchQuery, ShareIndex};
pub use server::{ServerRequest, ServerResponse};
pub use tree::{DistributedTree, TreeAction, TreeState};
pub use wire::{decode_frame, encode_frame, CodeWidth, DecodeError, Frame, FrameDecodeError, FrameEncodeError};
