//! Distributed-network messages. Codes are one byte on the wire.

use crate::protocol::DistributedCode;
use crate::wire::{CodeWidth, DecodeError, FrameEncodeError, MessageReader, MessageWriter, OrTruncated};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributedMessage {
    Ping,
    SearchRequest {
        unknown: u32,
        username: String,
        token: u32,
        query: String,
    },
    BranchLevel(u32),
    BranchRoot(String),
    ChildDepth(u32),
    /// A server message wrapped by the branch root; `code` is the distributed code of `payload`.
    EmbeddedMessage { code: u8, payload: Vec<u8> },
}

impl DistributedMessage {
    pub fn search(username: impl Into<String>, token: u32, query: impl Into<String>) -> Self {
        DistributedMessage::SearchRequest {
            unknown: 0x31,
            username: username.into(),
            token,
            query: query.into(),
        }
    }

    pub fn code(&self) -> DistributedCode {
        match self {
            DistributedMessage::Ping => DistributedCode::Ping,
            DistributedMessage::SearchRequest { .. } => DistributedCode::SearchRequest,
            DistributedMessage::BranchLevel(_) => DistributedCode::BranchLevel,
            DistributedMessage::BranchRoot(_) => DistributedCode::BranchRoot,
            DistributedMessage::ChildDepth(_) => DistributedCode::ChildDepth,
            DistributedMessage::EmbeddedMessage { .. } => DistributedCode::EmbeddedMessage,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        match self {
            DistributedMessage::Ping => {}
            DistributedMessage::SearchRequest {
                unknown,
                username,
                token,
                query,
            } => {
                w.append_u32(*unknown)
                    .append_string(username)
                    .append_u32(*token)
                    .append_string(query);
            }
            DistributedMessage::BranchLevel(level) | DistributedMessage::ChildDepth(level) => {
                w.append_u32(*level);
            }
            DistributedMessage::BranchRoot(root) => {
                w.append_string(root);
            }
            DistributedMessage::EmbeddedMessage { code, payload } => {
                w.append_u8(*code).append_raw(payload);
            }
        }
        w.into_payload()
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let mut w = MessageWriter::new();
        w.append_raw(&self.payload());
        w.into_frame(CodeWidth::U8, self.code() as u32)
    }

    pub fn parse(code: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = MessageReader::new(payload);
        Ok(match DistributedCode::try_from(code)? {
            DistributedCode::Ping => DistributedMessage::Ping,
            DistributedCode::SearchRequest => DistributedMessage::SearchRequest {
                unknown: r.read_u32().or_truncated("unknown")?,
                username: r.read_string().or_truncated("username")?,
                token: r.read_u32().or_truncated("token")?,
                query: r.read_string().or_truncated("query")?,
            },
            DistributedCode::BranchLevel => {
                DistributedMessage::BranchLevel(r.read_u32().or_truncated("branch level")?)
            }
            DistributedCode::BranchRoot => {
                DistributedMessage::BranchRoot(r.read_string().or_truncated("branch root")?)
            }
            DistributedCode::ChildDepth => {
                DistributedMessage::ChildDepth(r.read_u32().or_truncated("child depth")?)
            }
            DistributedCode::EmbeddedMessage => DistributedMessage::EmbeddedMessage {
                code: r.read_u8().or_truncated("embedded code")?,
                payload: r.rest().to_vec(),
            },
        })
    }

    /// Unwrap an embedded message into the message it carries.
    pub fn unwrap_embedded(code: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        Self::parse(u32::from(code), payload)
    }
}
