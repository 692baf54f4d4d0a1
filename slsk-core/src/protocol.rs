//! Message codes for the four sub-protocols and the record types they share.

use serde::{Deserialize, Serialize};

use crate::wire::{DecodeError, MessageReader, MessageWriter, OrTruncated};

/// Client version reported at login.
pub const CLIENT_VERSION: u32 = 160;
/// Minor version reported at login.
pub const CLIENT_MINOR_VERSION: u32 = 1;
/// Peer codes at or above this value are client-specific extensions.
pub const VENDOR_CODE_BASE: u32 = 10_000;

/// Server message codes (4-byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerCode {
    Login = 1,
    SetWaitPort = 2,
    GetPeerAddress = 3,
    WatchUser = 5,
    UnwatchUser = 6,
    GetUserStatus = 7,
    SayChatroom = 13,
    JoinRoom = 14,
    LeaveRoom = 15,
    UserJoinedRoom = 16,
    UserLeftRoom = 17,
    ConnectToPeer = 18,
    MessageUser = 22,
    MessageAcked = 23,
    FileSearch = 26,
    SetStatus = 28,
    ServerPing = 32,
    SharedFoldersFiles = 35,
    GetUserStats = 36,
    Relogged = 41,
    UserSearch = 42,
    RoomList = 64,
    PrivilegedUsers = 69,
    HaveNoParent = 71,
    ParentMinSpeed = 83,
    ParentSpeedRatio = 84,
    CheckPrivileges = 92,
    EmbeddedMessage = 93,
    AcceptChildren = 100,
    PossibleParents = 102,
    WishlistSearch = 103,
    WishlistInterval = 104,
    BranchLevel = 126,
    BranchRoot = 127,
    ChildDepth = 129,
    ResetDistributed = 130,
    ExcludedSearchPhrases = 160,
    CantConnectToPeer = 1001,
}

impl TryFrom<u32> for ServerCode {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        use ServerCode::*;
        Ok(match code {
            1 => Login,
            2 => SetWaitPort,
            3 => GetPeerAddress,
            5 => WatchUser,
            6 => UnwatchUser,
            7 => GetUserStatus,
            13 => SayChatroom,
            14 => JoinRoom,
            15 => LeaveRoom,
            16 => UserJoinedRoom,
            17 => UserLeftRoom,
            18 => ConnectToPeer,
            22 => MessageUser,
            23 => MessageAcked,
            26 => FileSearch,
            28 => SetStatus,
            32 => ServerPing,
            35 => SharedFoldersFiles,
            36 => GetUserStats,
            41 => Relogged,
            42 => UserSearch,
            64 => RoomList,
            69 => PrivilegedUsers,
            71 => HaveNoParent,
            83 => ParentMinSpeed,
            84 => ParentSpeedRatio,
            92 => CheckPrivileges,
            93 => EmbeddedMessage,
            100 => AcceptChildren,
            102 => PossibleParents,
            103 => WishlistSearch,
            104 => WishlistInterval,
            126 => BranchLevel,
            127 => BranchRoot,
            129 => ChildDepth,
            130 => ResetDistributed,
            160 => ExcludedSearchPhrases,
            1001 => CantConnectToPeer,
            other => return Err(DecodeError::UnknownCode(other)),
        })
    }
}

/// Peer-init codes (1-byte): the first message on a fresh peer socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerInitCode {
    PierceFirewall = 0,
    PeerInit = 1,
}

impl TryFrom<u32> for PeerInitCode {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PeerInitCode::PierceFirewall),
            1 => Ok(PeerInitCode::PeerInit),
            other => Err(DecodeError::UnknownCode(other)),
        }
    }
}

/// Peer message codes (4-byte), including the vendor range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PeerCode {
    GetShareFileList = 4,
    SharedFileListResponse = 5,
    FileSearchResponse = 9,
    UserInfoRequest = 15,
    UserInfoResponse = 16,
    FolderContentsRequest = 36,
    FolderContentsResponse = 37,
    TransferRequest = 40,
    TransferResponse = 41,
    QueueUpload = 43,
    PlaceInQueueResponse = 44,
    UploadFailed = 46,
    UploadDenied = 50,
    PlaceInQueueRequest = 51,
    ArtworkRequest = VENDOR_CODE_BASE,
    ArtworkResponse = VENDOR_CODE_BASE + 1,
}

impl PeerCode {
    /// Replies whose payload is a zlib stream.
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            PeerCode::SharedFileListResponse
                | PeerCode::FileSearchResponse
                | PeerCode::FolderContentsResponse
        )
    }

    pub fn is_vendor(self) -> bool {
        self as u32 >= VENDOR_CODE_BASE
    }
}

impl TryFrom<u32> for PeerCode {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        use PeerCode::*;
        Ok(match code {
            4 => GetShareFileList,
            5 => SharedFileListResponse,
            9 => FileSearchResponse,
            15 => UserInfoRequest,
            16 => UserInfoResponse,
            36 => FolderContentsRequest,
            37 => FolderContentsResponse,
            40 => TransferRequest,
            41 => TransferResponse,
            43 => QueueUpload,
            44 => PlaceInQueueResponse,
            46 => UploadFailed,
            50 => UploadDenied,
            51 => PlaceInQueueRequest,
            10_000 => ArtworkRequest,
            10_001 => ArtworkResponse,
            other => return Err(DecodeError::UnknownCode(other)),
        })
    }
}

/// Distributed message codes (1-byte on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
    EmbeddedMessage = 93,
}

impl TryFrom<u32> for DistributedCode {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        use DistributedCode::*;
        Ok(match code {
            0 => Ping,
            3 => SearchRequest,
            4 => BranchLevel,
            5 => BranchRoot,
            7 => ChildDepth,
            93 => EmbeddedMessage,
            other => return Err(DecodeError::UnknownCode(other)),
        })
    }
}

/// Purpose of a peer socket, sent as a one-letter string in PeerInit and ConnectToPeer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    Peer,
    File,
    Distributed,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::File => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(ConnectionType::Peer),
            "F" => Some(ConnectionType::File),
            "D" => Some(ConnectionType::Distributed),
            _ => None,
        }
    }

    pub(crate) fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        let s = r.read_string().or_truncated("connection type")?;
        Self::parse(&s).ok_or(DecodeError::Invalid("connection type"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(UserStatus::Offline),
            1 => Some(UserStatus::Away),
            2 => Some(UserStatus::Online),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            UserStatus::Offline => 0,
            UserStatus::Away => 1,
            UserStatus::Online => 2,
        }
    }

    pub(crate) fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        let v = r.read_u32().or_truncated("status")?;
        Self::from_u32(v).ok_or(DecodeError::Invalid("status"))
    }
}

/// Upload statistics the server keeps per user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub avg_speed: u32,
    pub upload_count: u64,
    pub files: u32,
    pub dirs: u32,
}

impl UserStats {
    pub(crate) fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            avg_speed: r.read_u32().or_truncated("avg speed")?,
            upload_count: r.read_u64().or_truncated("upload count")?,
            files: r.read_u32().or_truncated("file count")?,
            dirs: r.read_u32().or_truncated("dir count")?,
        })
    }

    pub(crate) fn write(&self, w: &mut MessageWriter) {
        w.append_u32(self.avg_speed)
            .append_u64(self.upload_count)
            .append_u32(self.files)
            .append_u32(self.dirs);
    }
}

/// Known file attribute codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Bitrate,
    Duration,
    Vbr,
    Encoder,
    SampleRate,
    BitDepth,
}

impl AttributeKind {
    pub fn code(self) -> u32 {
        match self {
            AttributeKind::Bitrate => 0,
            AttributeKind::Duration => 1,
            AttributeKind::Vbr => 2,
            AttributeKind::Encoder => 3,
            AttributeKind::SampleRate => 4,
            AttributeKind::BitDepth => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(AttributeKind::Bitrate),
            1 => Some(AttributeKind::Duration),
            2 => Some(AttributeKind::Vbr),
            3 => Some(AttributeKind::Encoder),
            4 => Some(AttributeKind::SampleRate),
            5 => Some(AttributeKind::BitDepth),
            _ => None,
        }
    }
}

/// One (code, value) attribute pair. Unknown codes are kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttribute {
    pub code: u32,
    pub value: u32,
}

impl FileAttribute {
    pub fn new(kind: AttributeKind, value: u32) -> Self {
        Self {
            code: kind.code(),
            value,
        }
    }

    pub fn kind(&self) -> Option<AttributeKind> {
        AttributeKind::from_code(self.code)
    }
}

/// A shared file as it appears in search results, share listings and folder contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

/// code(1) + filename(4) + size(8) + extension(4) + attribute count(4)
pub(crate) const MIN_FILE_ENTRY_LEN: usize = 21;

impl FileEntry {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        let filename = filename.into();
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.contains(|c| c == '\\' || c == '/'))
            .unwrap_or_default();
        Self {
            filename,
            size,
            extension,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, kind: AttributeKind, value: u32) -> Self {
        self.attributes.push(FileAttribute::new(kind, value));
        self
    }

    pub fn attribute(&self, kind: AttributeKind) -> Option<u32> {
        self.attributes
            .iter()
            .find(|a| a.code == kind.code())
            .map(|a| a.value)
    }

    pub(crate) fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        r.read_u8().or_truncated("file code")?;
        let filename = r.read_string().or_truncated("filename")?;
        let size = r.read_u64().or_truncated("file size")?;
        let extension = r.read_string().or_truncated("extension")?;
        let n = r.read_count(8).or_truncated("attribute count")?;
        let mut attributes = Vec::with_capacity(n);
        for _ in 0..n {
            attributes.push(FileAttribute {
                code: r.read_u32().or_truncated("attribute code")?,
                value: r.read_u32().or_truncated("attribute value")?,
            });
        }
        Ok(Self {
            filename,
            size,
            extension,
            attributes,
        })
    }

    pub(crate) fn write(&self, w: &mut MessageWriter) {
        w.append_u8(1)
            .append_string(&self.filename)
            .append_u64(self.size)
            .append_string(&self.extension)
            .append_u32(self.attributes.len() as u32);
        for a in &self.attributes {
            w.append_u32(a.code).append_u32(a.value);
        }
    }

    pub(crate) fn read_list(r: &mut MessageReader<'_>) -> Result<Vec<Self>, DecodeError> {
        let n = r.read_count(MIN_FILE_ENTRY_LEN).or_truncated("file count")?;
        let mut files = Vec::with_capacity(n);
        for _ in 0..n {
            files.push(Self::read(r)?);
        }
        Ok(files)
    }

    pub(crate) fn write_list(files: &[Self], w: &mut MessageWriter) {
        w.append_u32(files.len() as u32);
        for f in files {
            f.write(w);
        }
    }
}

/// A directory and the files directly inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub files: Vec<FileEntry>,
}

impl Folder {
    pub fn new(name: impl Into<String>, files: Vec<FileEntry>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }

    pub(crate) fn read(r: &mut MessageReader<'_>) -> Result<Self, DecodeError> {
        let name = r.read_string().or_truncated("folder name")?;
        let files = FileEntry::read_list(r)?;
        Ok(Self { name, files })
    }

    pub(crate) fn write(&self, w: &mut MessageWriter) {
        w.append_string(&self.name);
        FileEntry::write_list(&self.files, w);
    }

    pub(crate) fn read_list(r: &mut MessageReader<'_>) -> Result<Vec<Self>, DecodeError> {
        // name(4) + file count(4)
        let n = r.read_count(8).or_truncated("folder count")?;
        let mut folders = Vec::with_capacity(n);
        for _ in 0..n {
            folders.push(Self::read(r)?);
        }
        Ok(folders)
    }

    pub(crate) fn write_list(folders: &[Self], w: &mut MessageWriter) {
        w.append_u32(folders.len() as u32);
        for f in folders {
            f.write(w);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn as_u32(self) -> u32 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TransferDirection::Download),
            1 => Some(TransferDirection::Upload),
            _ => None,
        }
    }
}
