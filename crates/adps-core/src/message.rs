//! Request/reply envelope exchanged between analysis clients and the server.
//!
//! Every RPC is one `Message` each way. The encoding is a fixed big-endian
//! header followed by an opaque payload:
//!
//! ```text
//! [i32 source_rank][i32 dest_rank][i32 type][i32 kind][u32 len][payload of len]
//! ```

use crate::config::{HandshakeConfig, ServerConfig};
use crate::error::{PsError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Size of the fixed envelope header in bytes.
pub const HEADER_LEN: usize = 20;

/// RPC message type. Every `Req*` has exactly one `Rep*` counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    ReqAdd = 0,
    RepAdd = 1,
    ReqGet = 2,
    RepGet = 3,
    ReqCmd = 4,
    RepCmd = 5,
    ReqQuit = 6,
    RepQuit = 7,
    ReqEcho = 8,
    RepEcho = 9,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::ReqAdd,
        MessageType::RepAdd,
        MessageType::ReqGet,
        MessageType::RepGet,
        MessageType::ReqCmd,
        MessageType::RepCmd,
        MessageType::ReqQuit,
        MessageType::RepQuit,
        MessageType::ReqEcho,
        MessageType::RepEcho,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    pub fn is_request(self) -> bool {
        self.code() % 2 == 0
    }

    /// The reply type answering this type. Replies map to themselves.
    pub fn reply(self) -> Self {
        match self {
            MessageType::ReqAdd | MessageType::RepAdd => MessageType::RepAdd,
            MessageType::ReqGet | MessageType::RepGet => MessageType::RepGet,
            MessageType::ReqCmd | MessageType::RepCmd => MessageType::RepCmd,
            MessageType::ReqQuit | MessageType::RepQuit => MessageType::RepQuit,
            MessageType::ReqEcho | MessageType::RepEcho => MessageType::RepEcho,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ReqAdd => "REQ_ADD",
            MessageType::RepAdd => "REP_ADD",
            MessageType::ReqGet => "REQ_GET",
            MessageType::RepGet => "REP_GET",
            MessageType::ReqCmd => "REQ_CMD",
            MessageType::RepCmd => "REP_CMD",
            MessageType::ReqQuit => "REQ_QUIT",
            MessageType::RepQuit => "REP_QUIT",
            MessageType::ReqEcho => "REQ_ECHO",
            MessageType::RepEcho => "REP_ECHO",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload family carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum MessageKind {
    /// Function statistics (ADD/GET) or handshake text (ECHO).
    #[default]
    Default = 0,
    /// Control command.
    Cmd = 1,
    /// Per-rank anomaly reports.
    AnomalyStats = 2,
    /// Error reply; payload is the UTF-8 error text.
    Error = 3,
}

impl MessageKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(MessageKind::Default),
            1 => Some(MessageKind::Cmd),
            2 => Some(MessageKind::AnomalyStats),
            3 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Control-plane commands carried by `REQ_CMD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageCmd {
    Quit = 0,
}

impl MessageCmd {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(MessageCmd::Quit),
            _ => None,
        }
    }

    pub fn to_payload(self) -> Vec<u8> {
        (self as i32).to_be_bytes().to_vec()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let raw: [u8; 4] = payload
            .try_into()
            .map_err(|_| {
                PsError::format(format!("command payload must be 4 bytes, got {}", payload.len()))
            })?;
        let code = i32::from_be_bytes(raw);
        Self::from_code(code).ok_or_else(|| PsError::InvalidRequest {
            message: format!("unknown command {}", code),
        })
    }
}

/// One RPC envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source_rank: i32,
    pub dest_rank: i32,
    pub msg_type: MessageType,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        source_rank: i32,
        dest_rank: i32,
        msg_type: MessageType,
        kind: MessageKind,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_rank,
            dest_rank,
            msg_type,
            kind,
            payload: payload.into(),
        }
    }

    /// Handshake request from `rank` to `server_rank`.
    pub fn echo_request(rank: i32, server_rank: i32) -> Self {
        Self::new(
            rank,
            server_rank,
            MessageType::ReqEcho,
            MessageKind::Default,
            HandshakeConfig::HELLO,
        )
    }

    pub fn command(rank: i32, server_rank: i32, cmd: MessageCmd) -> Self {
        Self::new(rank, server_rank, MessageType::ReqCmd, MessageKind::Cmd, cmd.to_payload())
    }

    /// Reply to `self` with the same kind, swapping the rank fields.
    pub fn reply(&self, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(
            self.dest_rank,
            self.source_rank,
            self.msg_type.reply(),
            self.kind,
            payload,
        )
    }

    /// Error reply to a request of type `request_type`.
    pub fn error_reply(
        source_rank: i32,
        dest_rank: i32,
        request_type: MessageType,
        err: &PsError,
    ) -> Self {
        Self::new(
            source_rank,
            dest_rank,
            request_type.reply(),
            MessageKind::Error,
            err.to_string(),
        )
    }

    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| PsError::format(format!("payload is not UTF-8: {}", e)))
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i32(self.source_rank);
        buf.put_i32(self.dest_rank);
        buf.put_i32(self.msg_type.code());
        buf.put_i32(self.kind.code());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(PsError::format(format!(
                "envelope truncated: {} bytes, header needs {}",
                bytes.len(),
                HEADER_LEN
            )));
        }

        let mut buf = bytes;
        let source_rank = buf.get_i32();
        let dest_rank = buf.get_i32();
        let type_code = buf.get_i32();
        let kind_code = buf.get_i32();
        let len = buf.get_u32() as usize;

        let msg_type = MessageType::from_code(type_code)
            .ok_or_else(|| PsError::format(format!("unknown message type {}", type_code)))?;
        let kind = MessageKind::from_code(kind_code)
            .ok_or_else(|| PsError::format(format!("unknown message kind {}", kind_code)))?;

        if len > ServerConfig::MAX_MESSAGE_SIZE {
            return Err(PsError::format(format!(
                "payload length {} exceeds maximum {}",
                len,
                ServerConfig::MAX_MESSAGE_SIZE
            )));
        }
        if buf.remaining() < len {
            return Err(PsError::format(format!(
                "payload truncated: declared {} bytes, {} present",
                len,
                buf.remaining()
            )));
        }
        if buf.remaining() > len {
            return Err(PsError::format(format!(
                "{} trailing bytes after payload",
                buf.remaining() - len
            )));
        }

        Ok(Self {
            source_rank,
            dest_rank,
            msg_type,
            kind,
            payload: buf.to_vec(),
        })
    }

    /// Read the type field of an envelope that may not decode as a whole.
    pub fn peek_type(bytes: &[u8]) -> Option<MessageType> {
        let raw: [u8; 4] = bytes.get(8..12)?.try_into().ok()?;
        MessageType::from_code(i32::from_be_bytes(raw))
    }

    /// Read the source rank field of a possibly corrupt envelope.
    pub fn peek_source(bytes: &[u8]) -> Option<i32> {
        let raw: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
        Some(i32::from_be_bytes(raw))
    }
}

/// The reply text a server of `backend_id` gives to handshake `request`.
pub fn handshake_reply(request: &str, backend_id: &str) -> String {
    format!("{}{}{}", request, HandshakeConfig::SENTINEL, backend_id)
}
