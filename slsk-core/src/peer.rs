//! Peer protocol: the 1-byte-code opening messages and the 4-byte-code messages that follow.

use serde::{Deserialize, Serialize};

use crate::compress;
use crate::protocol::{
    ConnectionType, FileEntry, Folder, PeerCode, PeerInitCode, TransferDirection,
};
use crate::wire::{
    encode_frame, CodeWidth, DecodeError, FrameEncodeError, MessageReader, MessageWriter,
    OrTruncated,
};

/// First message on a peer socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerInitMessage {
    /// Reply to a server-relayed ConnectToPeer; completes the handshake on its own.
    PierceFirewall { token: u32 },
    /// Sent by the dialing side of a direct connection.
    PeerInit {
        username: String,
        conn_type: ConnectionType,
        token: u32,
    },
}

impl PeerInitMessage {
    pub fn code(&self) -> PeerInitCode {
        match self {
            PeerInitMessage::PierceFirewall { .. } => PeerInitCode::PierceFirewall,
            PeerInitMessage::PeerInit { .. } => PeerInitCode::PeerInit,
        }
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let mut w = MessageWriter::new();
        match self {
            PeerInitMessage::PierceFirewall { token } => {
                w.append_u32(*token);
            }
            PeerInitMessage::PeerInit {
                username,
                conn_type,
                token,
            } => {
                w.append_string(username)
                    .append_string(conn_type.as_str())
                    .append_u32(*token);
            }
        }
        w.into_frame(CodeWidth::U8, self.code() as u32)
    }

    pub fn parse(code: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = MessageReader::new(payload);
        match PeerInitCode::try_from(code)? {
            PeerInitCode::PierceFirewall => Ok(PeerInitMessage::PierceFirewall {
                token: r.read_u32().or_truncated("token")?,
            }),
            PeerInitCode::PeerInit => Ok(PeerInitMessage::PeerInit {
                username: r.read_string().or_truncated("username")?,
                conn_type: ConnectionType::read(&mut r)?,
                // Some clients send a zero-length token field; treat as 0.
                token: r.read_u32().unwrap_or(0),
            }),
        }
    }
}

/// Search results sent back to a searcher. Compressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReply {
    pub username: String,
    pub token: u32,
    pub files: Vec<FileEntry>,
    pub free_slot: bool,
    pub avg_speed: u32,
    pub queue_length: u32,
    pub private_files: Vec<FileEntry>,
}

impl SearchReply {
    fn write(&self, w: &mut MessageWriter) {
        w.append_string(&self.username).append_u32(self.token);
        FileEntry::write_list(&self.files, w);
        w.append_bool(self.free_slot)
            .append_u32(self.avg_speed)
            .append_u32(self.queue_length)
            .append_u32(0);
        if !self.private_files.is_empty() {
            FileEntry::write_list(&self.private_files, w);
        }
    }

    fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        let username = r.read_string().or_truncated("username")?;
        let token = r.read_u32().or_truncated("token")?;
        let files = FileEntry::read_list(r)?;
        let free_slot = r.read_bool().or_truncated("free slot")?;
        let avg_speed = r.read_u32().or_truncated("avg speed")?;
        let queue_length = r.read_u32().or_truncated("queue length")?;
        // Trailing unknown field and private results are optional.
        let mut private_files = Vec::new();
        if r.read_u32().is_some() && r.remaining() >= 4 {
            private_files = FileEntry::read_list(r)?;
        }
        Ok(Self {
            username,
            token,
            files,
            free_slot,
            avg_speed,
            queue_length,
            private_files,
        })
    }
}

/// Full share listing. Compressed on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharesReply {
    pub folders: Vec<Folder>,
    pub private_folders: Vec<Folder>,
}

impl SharesReply {
    fn write(&self, w: &mut MessageWriter) {
        Folder::write_list(&self.folders, w);
        w.append_u32(0);
        if !self.private_folders.is_empty() {
            Folder::write_list(&self.private_folders, w);
        }
    }

    fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        let folders = Folder::read_list(r)?;
        let mut private_folders = Vec::new();
        if r.read_u32().is_some() && r.remaining() >= 4 {
            private_folders = Folder::read_list(r)?;
        }
        Ok(Self {
            folders,
            private_folders,
        })
    }
}

/// Contents of one requested folder: token, folder, then a list of directory blocks.
/// Compressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderContentsReply {
    pub token: u32,
    pub folder: String,
    pub folders: Vec<Folder>,
}

impl FolderContentsReply {
    fn write(&self, w: &mut MessageWriter) {
        w.append_u32(self.token).append_string(&self.folder);
        Folder::write_list(&self.folders, w);
    }

    fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            token: r.read_u32().or_truncated("token")?,
            folder: r.read_string().or_truncated("folder")?,
            folders: Folder::read_list(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub total_uploads: u32,
    pub queue_size: u32,
    pub slots_free: bool,
    pub upload_permitted: Option<u32>,
}

/// Answer to a TransferRequest.
/// Whether an allowed reply carries the file size varies between clients, so `size` is
/// written only when present and read only when the bytes are there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReply {
    pub token: u32,
    pub allowed: bool,
    pub size: Option<u64>,
    pub reason: Option<String>,
}

impl TransferReply {
    pub fn allowed(token: u32, size: Option<u64>) -> Self {
        Self {
            token,
            allowed: true,
            size,
            reason: None,
        }
    }

    pub fn denied(token: u32, reason: impl Into<String>) -> Self {
        Self {
            token,
            allowed: false,
            size: None,
            reason: Some(reason.into()),
        }
    }
}

/// Messages exchanged on an established `P` connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    GetShareFileList,
    SharesReply(SharesReply),
    SearchReply(SearchReply),
    UserInfoRequest,
    UserInfoReply(UserInfo),
    FolderContentsRequest { token: u32, folder: String },
    FolderContentsReply(FolderContentsReply),
    TransferRequest {
        direction: TransferDirection,
        token: u32,
        filename: String,
        size: Option<u64>,
    },
    TransferReply(TransferReply),
    QueueUpload { filename: String },
    PlaceInQueueReply { filename: String, place: u32 },
    UploadFailed { filename: String },
    UploadDenied { filename: String, reason: String },
    PlaceInQueueRequest { filename: String },
    ArtworkRequest { token: u32, filename: String },
    ArtworkReply { token: u32, data: Vec<u8> },
}

impl PeerMessage {
    pub fn code(&self) -> PeerCode {
        match self {
            PeerMessage::GetShareFileList => PeerCode::GetShareFileList,
            PeerMessage::SharesReply(_) => PeerCode::SharedFileListResponse,
            PeerMessage::SearchReply(_) => PeerCode::FileSearchResponse,
            PeerMessage::UserInfoRequest => PeerCode::UserInfoRequest,
            PeerMessage::UserInfoReply(_) => PeerCode::UserInfoResponse,
            PeerMessage::FolderContentsRequest { .. } => PeerCode::FolderContentsRequest,
            PeerMessage::FolderContentsReply(_) => PeerCode::FolderContentsResponse,
            PeerMessage::TransferRequest { .. } => PeerCode::TransferRequest,
            PeerMessage::TransferReply(_) => PeerCode::TransferResponse,
            PeerMessage::QueueUpload { .. } => PeerCode::QueueUpload,
            PeerMessage::PlaceInQueueReply { .. } => PeerCode::PlaceInQueueResponse,
            PeerMessage::UploadFailed { .. } => PeerCode::UploadFailed,
            PeerMessage::UploadDenied { .. } => PeerCode::UploadDenied,
            PeerMessage::PlaceInQueueRequest { .. } => PeerCode::PlaceInQueueRequest,
            PeerMessage::ArtworkRequest { .. } => PeerCode::ArtworkRequest,
            PeerMessage::ArtworkReply { .. } => PeerCode::ArtworkResponse,
        }
    }

    /// Uncompressed payload, per the message schema.
    pub fn payload(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        match self {
            PeerMessage::GetShareFileList | PeerMessage::UserInfoRequest => {}
            PeerMessage::SharesReply(reply) => reply.write(&mut w),
            PeerMessage::SearchReply(reply) => reply.write(&mut w),
            PeerMessage::UserInfoReply(info) => {
                w.append_string(&info.description);
                match &info.picture {
                    Some(picture) => {
                        w.append_bool(true).append_bytes(picture);
                    }
                    None => {
                        w.append_bool(false);
                    }
                }
                w.append_u32(info.total_uploads)
                    .append_u32(info.queue_size)
                    .append_bool(info.slots_free);
                if let Some(permitted) = info.upload_permitted {
                    w.append_u32(permitted);
                }
            }
            PeerMessage::FolderContentsRequest { token, folder } => {
                w.append_u32(*token).append_string(folder);
            }
            PeerMessage::FolderContentsReply(reply) => reply.write(&mut w),
            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                size,
            } => {
                w.append_u32(direction.as_u32())
                    .append_u32(*token)
                    .append_string(filename);
                if let Some(size) = size {
                    w.append_u64(*size);
                }
            }
            PeerMessage::TransferReply(reply) => {
                w.append_u32(reply.token).append_bool(reply.allowed);
                if reply.allowed {
                    if let Some(size) = reply.size {
                        w.append_u64(size);
                    }
                } else {
                    w.append_string(reply.reason.as_deref().unwrap_or_default());
                }
            }
            PeerMessage::QueueUpload { filename }
            | PeerMessage::UploadFailed { filename }
            | PeerMessage::PlaceInQueueRequest { filename } => {
                w.append_string(filename);
            }
            PeerMessage::PlaceInQueueReply { filename, place } => {
                w.append_string(filename).append_u32(*place);
            }
            PeerMessage::UploadDenied { filename, reason } => {
                w.append_string(filename).append_string(reason);
            }
            PeerMessage::ArtworkRequest { token, filename } => {
                w.append_u32(*token).append_string(filename);
            }
            PeerMessage::ArtworkReply { token, data } => {
                w.append_u32(*token).append_bytes(data);
            }
        }
        w.into_payload()
    }

    /// Build the full frame, compressing the payload for the three large replies.
    pub fn to_frame(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let code = self.code();
        let payload = self.payload();
        if code.is_compressed() {
            let packed = compress::compress(&payload)?;
            encode_frame(CodeWidth::U32, code as u32, &packed)
        } else {
            encode_frame(CodeWidth::U32, code as u32, &payload)
        }
    }

    /// Parse a peer frame payload, inflating it first when the code is a compressed reply.
    pub fn parse(code: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let code = PeerCode::try_from(code)?;
        if code.is_compressed() {
            let inflated = compress::decompress(payload)?;
            Self::parse_plain(code, &inflated)
        } else {
            Self::parse_plain(code, payload)
        }
    }

    fn parse_plain(code: PeerCode, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = MessageReader::new(payload);
        let r = &mut r;
        Ok(match code {
            PeerCode::GetShareFileList => PeerMessage::GetShareFileList,
            PeerCode::SharedFileListResponse => PeerMessage::SharesReply(SharesReply::read(r)?),
            PeerCode::FileSearchResponse => PeerMessage::SearchReply(SearchReply::read(r)?),
            PeerCode::UserInfoRequest => PeerMessage::UserInfoRequest,
            PeerCode::UserInfoResponse => {
                let description = r.read_string().or_truncated("description")?;
                let picture = if r.read_bool().or_truncated("has picture")? {
                    Some(r.read_bytes().or_truncated("picture")?.to_vec())
                } else {
                    None
                };
                PeerMessage::UserInfoReply(UserInfo {
                    description,
                    picture,
                    total_uploads: r.read_u32().or_truncated("total uploads")?,
                    queue_size: r.read_u32().or_truncated("queue size")?,
                    slots_free: r.read_bool().or_truncated("slots free")?,
                    upload_permitted: r.read_u32(),
                })
            }
            PeerCode::FolderContentsRequest => PeerMessage::FolderContentsRequest {
                token: r.read_u32().or_truncated("token")?,
                folder: r.read_string().or_truncated("folder")?,
            },
            PeerCode::FolderContentsResponse => {
                PeerMessage::FolderContentsReply(FolderContentsReply::read(r)?)
            }
            PeerCode::TransferRequest => {
                let direction = r.read_u32().or_truncated("direction")?;
                let direction = TransferDirection::from_u32(direction)
                    .ok_or(DecodeError::Invalid("direction"))?;
                PeerMessage::TransferRequest {
                    direction,
                    token: r.read_u32().or_truncated("token")?,
                    filename: r.read_string().or_truncated("filename")?,
                    size: r.read_u64(),
                }
            }
            PeerCode::TransferResponse => {
                let token = r.read_u32().or_truncated("token")?;
                let allowed = r.read_bool().or_truncated("allowed")?;
                let reply = if allowed {
                    TransferReply::allowed(token, r.read_u64())
                } else {
                    TransferReply {
                        token,
                        allowed,
                        size: None,
                        reason: r.read_string(),
                    }
                };
                PeerMessage::TransferReply(reply)
            }
            PeerCode::QueueUpload => PeerMessage::QueueUpload {
                filename: r.read_string().or_truncated("filename")?,
            },
            PeerCode::PlaceInQueueResponse => PeerMessage::PlaceInQueueReply {
                filename: r.read_string().or_truncated("filename")?,
                place: r.read_u32().or_truncated("place")?,
            },
            PeerCode::UploadFailed => PeerMessage::UploadFailed {
                filename: r.read_string().or_truncated("filename")?,
            },
            PeerCode::UploadDenied => PeerMessage::UploadDenied {
                filename: r.read_string().or_truncated("filename")?,
                reason: r.read_string().or_truncated("reason")?,
            },
            PeerCode::PlaceInQueueRequest => PeerMessage::PlaceInQueueRequest {
                filename: r.read_string().or_truncated("filename")?,
            },
            PeerCode::ArtworkRequest => PeerMessage::ArtworkRequest {
                token: r.read_u32().or_truncated("token")?,
                filename: r.read_string().or_truncated("filename")?,
            },
            PeerCode::ArtworkResponse => PeerMessage::ArtworkReply {
                token: r.read_u32().or_truncated("token")?,
                data: r.read_bytes().or_truncated("artwork")?.to_vec(),
            },
        })
    }
}
