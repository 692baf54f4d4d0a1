//! Serving established `P` connections: answer share/info requests from the index and surface
//! everything else as events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slsk_core::peer::{FolderContentsReply, SharesReply, TransferReply, UserInfo};
use slsk_core::protocol::{PeerCode, TransferDirection};
use slsk_core::{ConnectionType, Dispatch, Event, HandlerTable, PeerMessage, ShareIndex};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::connection::PeerConnection;
use crate::pool::ConnectionPool;
use crate::race::PeerDialer;

const NOT_SHARED: &str = "File not shared.";

/// Peer codes this client parses on `P` connections.
const PEER_CODES: &[PeerCode] = &[
    PeerCode::GetShareFileList,
    PeerCode::SharedFileListResponse,
    PeerCode::FileSearchResponse,
    PeerCode::UserInfoRequest,
    PeerCode::UserInfoResponse,
    PeerCode::FolderContentsRequest,
    PeerCode::FolderContentsResponse,
    PeerCode::TransferRequest,
    PeerCode::TransferResponse,
    PeerCode::QueueUpload,
    PeerCode::PlaceInQueueResponse,
    PeerCode::UploadFailed,
    PeerCode::UploadDenied,
    PeerCode::PlaceInQueueRequest,
    PeerCode::ArtworkRequest,
    PeerCode::ArtworkResponse,
];

pub fn peer_handlers() -> HandlerTable<Vec<PeerMessage>> {
    let mut table = HandlerTable::new();
    for &code in PEER_CODES {
        let code = code as u32;
        table.register(code, move |out: &mut Vec<PeerMessage>, payload: &[u8]| {
            out.push(PeerMessage::parse(code, payload)?);
            Ok(())
        });
    }
    table
}

pub struct PeerServiceConfig {
    pub description: String,
    pub transfer_reply_includes_size: bool,
}

struct Session {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

pub struct PeerService {
    shares: Arc<dyn ShareIndex>,
    pool: Arc<ConnectionPool>,
    dialer: Arc<PeerDialer>,
    events: mpsc::Sender<Event>,
    config: PeerServiceConfig,
    table: HandlerTable<Vec<PeerMessage>>,
    sessions: Mutex<HashMap<String, Session>>,
    generation: AtomicU64,
}

impl PeerService {
    pub fn new(
        shares: Arc<dyn ShareIndex>,
        pool: Arc<ConnectionPool>,
        dialer: Arc<PeerDialer>,
        events: mpsc::Sender<Event>,
        config: PeerServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            shares,
            pool,
            dialer,
            events,
            config,
            table: peer_handlers(),
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Send `msg` to `username`, reusing a live `P` connection or opening one.
    pub fn send_to(self: &Arc<Self>, username: &str, msg: PeerMessage) {
        let msg = {
            let sessions = self.sessions.lock();
            match sessions.get(username) {
                Some(session) => match session.tx.send(msg) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(msg)) => msg,
                },
                None => msg,
            }
        };
        let service = Arc::clone(self);
        let username = username.to_owned();
        tokio::spawn(async move {
            match service.dialer.open(&username, ConnectionType::Peer).await {
                Ok((conn, path)) => {
                    debug!(%username, ?path, "opened peer connection");
                    service.serve_with(conn, vec![msg]).await;
                }
                Err(e) => {
                    debug!(%username, error = %e, "could not reach peer");
                    service.emit(Event::ConnectionFailed { username, token: 0 });
                }
            }
        });
    }

    /// Accept or refuse a transfer a peer offered us.
    pub fn answer_transfer(self: &Arc<Self>, username: &str, token: u32, size: Option<u64>, deny: Option<String>) {
        let reply = match deny {
            Some(reason) => TransferReply::denied(token, reason),
            None => self.allowed(token, size),
        };
        self.send_to(username, PeerMessage::TransferReply(reply));
    }

    fn allowed(&self, token: u32, size: Option<u64>) -> TransferReply {
        let size = if self.config.transfer_reply_includes_size {
            size
        } else {
            None
        };
        TransferReply::allowed(token, size)
    }

    pub async fn serve(self: Arc<Self>, conn: PeerConnection) {
        self.serve_with(conn, Vec::new()).await;
    }

    /// Pump one connection until either side closes it. `first` is sent before anything is read.
    #[instrument(skip_all, fields(peer = %conn.username()))]
    async fn serve_with(self: Arc<Self>, mut conn: PeerConnection, first: Vec<PeerMessage>) {
        let username = conn.username().to_owned();
        let key = (username.clone(), conn.identity().token);
        let _held = self.pool.hold(key);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for msg in first {
            let _ = tx.send(msg);
        }
        self.sessions
            .lock()
            .insert(username.clone(), Session { generation, tx });

        let mut parsed = Vec::new();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if !self.write(&mut conn, &msg).await {
                        break;
                    }
                }
                frame = conn.recv() => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "peer read failed");
                            break;
                        }
                    };
                    match self.table.dispatch(&mut parsed, frame.code, &frame.payload) {
                        Dispatch::Handled | Dispatch::Unknown(_) => {}
                        Dispatch::Malformed(code, e) => debug!(code, error = %e, "malformed peer message"),
                    }
                    let mut ok = true;
                    for msg in parsed.drain(..) {
                        if let Some(reply) = self.handle(&username, msg) {
                            if !self.write(&mut conn, &reply).await {
                                ok = false;
                                break;
                            }
                        }
                    }
                    if !ok {
                        break;
                    }
                }
            }
        }

        {
            let mut sessions = self.sessions.lock();
            if sessions.get(&username).is_some_and(|s| s.generation == generation) {
                sessions.remove(&username);
            }
        }
        conn.disconnect();
    }

    async fn write(&self, conn: &mut PeerConnection, msg: &PeerMessage) -> bool {
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(code = ?msg.code(), error = %e, "could not encode peer message");
                return true;
            }
        };
        match conn.send(frame).await {
            Ok(()) => {
                trace!(code = ?msg.code(), "sent peer message");
                true
            }
            Err(e) => {
                debug!(error = %e, "peer write failed");
                false
            }
        }
    }

    /// React to one parsed message; `Some` is the reply to send back.
    pub fn handle(&self, username: &str, msg: PeerMessage) -> Option<PeerMessage> {
        match msg {
            PeerMessage::GetShareFileList => Some(PeerMessage::SharesReply(SharesReply {
                folders: self.shares.listing(),
                private_folders: Vec::new(),
            })),
            PeerMessage::UserInfoRequest => Some(PeerMessage::UserInfoReply(UserInfo {
                description: self.config.description.clone(),
                picture: None,
                total_uploads: 0,
                queue_size: 0,
                slots_free: true,
                upload_permitted: Some(1),
            })),
            PeerMessage::FolderContentsRequest { token, folder } => {
                let folders = self.shares.folder(&folder).unwrap_or_default();
                Some(PeerMessage::FolderContentsReply(FolderContentsReply {
                    token,
                    folder,
                    folders,
                }))
            }
            PeerMessage::ArtworkRequest { token, filename } => {
                let data = self.shares.artwork(&filename)?;
                Some(PeerMessage::ArtworkReply { token, data })
            }
            PeerMessage::PlaceInQueueRequest { filename } | PeerMessage::QueueUpload { filename }
                if !self.shares.contains(&filename) =>
            {
                Some(PeerMessage::UploadDenied {
                    filename,
                    reason: NOT_SHARED.to_owned(),
                })
            }
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token,
                filename,
                ..
            } if !self.shares.contains(&filename) => {
                Some(PeerMessage::TransferReply(TransferReply::denied(token, NOT_SHARED)))
            }
            PeerMessage::SearchReply(reply) => {
                self.emit(Event::SearchResults(reply));
                None
            }
            PeerMessage::UserInfoReply(info) => {
                self.emit(Event::UserInfo {
                    username: username.to_owned(),
                    info,
                });
                None
            }
            message => {
                self.emit(Event::PeerRequest {
                    username: username.to_owned(),
                    message,
                });
                None
            }
        }
    }

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            debug!("event channel full or closed; dropping peer event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::PierceRegistry;
    use crate::resolver::{AddressResolver, ResolveError};
    use crate::server::ServerHandle;
    use slsk_core::peer::SearchReply;
    use slsk_core::InMemoryShareIndex;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct Offline;

    #[async_trait::async_trait]
    impl AddressResolver for Offline {
        async fn resolve(&self, username: &str) -> Result<SocketAddr, ResolveError> {
            Err(ResolveError::Offline(username.to_owned()))
        }
    }

    fn service(include_size: bool) -> (Arc<PeerService>, mpsc::Receiver<Event>) {
        let mut index = InMemoryShareIndex::new();
        index
            .add_file("Music\\Album\\01 Intro.mp3", 1_000)
            .add_file("Music\\Album\\02 Song.mp3", 2_000)
            .set_artwork("Music\\Album\\01 Intro.mp3", vec![0xff, 0xd8]);
        let pool = Arc::new(ConnectionPool::new("me"));
        let (server, _server_rx) = ServerHandle::channel();
        let dialer = Arc::new(PeerDialer::new(
            "me",
            pool.clone(),
            PierceRegistry::new(),
            Arc::new(Offline),
            server,
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let (tx, rx) = mpsc::channel(16);
        let svc = PeerService::new(
            Arc::new(index),
            pool,
            dialer,
            tx,
            PeerServiceConfig {
                description: "hello from me".into(),
                transfer_reply_includes_size: include_size,
            },
        );
        (svc, rx)
    }

    #[test]
    fn answers_from_the_index() {
        let (svc, _rx) = service(true);
        let Some(PeerMessage::SharesReply(shares)) = svc.handle("peer", PeerMessage::GetShareFileList) else {
            panic!("expected shares reply");
        };
        assert_eq!(shares.folders.len(), 1);
        assert_eq!(shares.folders[0].files.len(), 2);

        let Some(PeerMessage::UserInfoReply(info)) = svc.handle("peer", PeerMessage::UserInfoRequest) else {
            panic!("expected user info");
        };
        assert_eq!(info.description, "hello from me");

        let reply = svc.handle(
            "peer",
            PeerMessage::FolderContentsRequest {
                token: 3,
                folder: "Music".into(),
            },
        );
        let Some(PeerMessage::FolderContentsReply(contents)) = reply else {
            panic!("expected folder contents");
        };
        assert_eq!(contents.token, 3);
        assert_eq!(contents.folders[0].name, "Music\\Album");

        let reply = svc.handle(
            "peer",
            PeerMessage::ArtworkRequest {
                token: 4,
                filename: "Music\\Album\\01 Intro.mp3".into(),
            },
        );
        assert_eq!(
            reply,
            Some(PeerMessage::ArtworkReply {
                token: 4,
                data: vec![0xff, 0xd8]
            })
        );
    }

    #[test]
    fn unshared_files_are_denied() {
        let (svc, mut rx) = service(true);
        let reply = svc.handle(
            "peer",
            PeerMessage::QueueUpload {
                filename: "Music\\Nope.mp3".into(),
            },
        );
        assert_eq!(
            reply,
            Some(PeerMessage::UploadDenied {
                filename: "Music\\Nope.mp3".into(),
                reason: "File not shared.".into(),
            })
        );
        let reply = svc.handle(
            "peer",
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token: 8,
                filename: "Music\\Nope.mp3".into(),
                size: None,
            },
        );
        assert_eq!(
            reply,
            Some(PeerMessage::TransferReply(TransferReply::denied(8, "File not shared.")))
        );

        // A shared file is the application's call.
        let queued = PeerMessage::PlaceInQueueRequest {
            filename: "Music\\Album\\02 Song.mp3".into(),
        };
        assert_eq!(svc.handle("peer", queued.clone()), None);
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::PeerRequest {
                username: "peer".into(),
                message: queued,
            }
        );
    }

    #[test]
    fn search_replies_become_events() {
        let (svc, mut rx) = service(true);
        let reply = SearchReply {
            username: "peer".into(),
            token: 11,
            files: Vec::new(),
            free_slot: true,
            avg_speed: 0,
            queue_length: 0,
            private_files: Vec::new(),
        };
        assert_eq!(svc.handle("peer", PeerMessage::SearchReply(reply.clone())), None);
        assert_eq!(rx.try_recv().unwrap(), Event::SearchResults(reply));
    }

    #[test]
    fn transfer_reply_size_follows_config() {
        let (with_size, _rx) = service(true);
        assert_eq!(with_size.allowed(5, Some(1_000)).size, Some(1_000));
        let (without, _rx) = service(false);
        assert_eq!(without.allowed(5, Some(1_000)).size, None);
    }

    #[test]
    fn handler_table_covers_peer_codes() {
        let table = peer_handlers();
        assert_eq!(table.len(), PEER_CODES.len());
        let mut out = Vec::new();
        assert!(matches!(table.dispatch(&mut out, 9_999, &[]), Dispatch::Unknown(9_999)));
        assert!(matches!(table.dispatch(&mut out, 4, &[]), Dispatch::Handled));
        assert_eq!(out, vec![PeerMessage::GetShareFileList]);
    }
}
