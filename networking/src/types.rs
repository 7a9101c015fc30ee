use std::fmt::Display;

use async_trait::async_trait;
use containers::{Block, BlockHeader, Bytes32};
use libp2p_identity::PeerId;
use serde::Serialize;

/// Protocol version advertised in `getheaders`.
pub const GET_HEADERS_VERSION: u32 = 1;

/// Most headers a peer returns for one `getheaders`.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

/// Peer connection state.
///
/// DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No active connection to this peer.
    Disconnected,
    /// Transport connection in progress.
    Connecting,
    /// Handshake done, can exchange protocol messages.
    Connected,
    /// Graceful shutdown in progress.
    Disconnecting,
}

/// Inventory item kinds understood by `getdata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvKind {
    Transaction = 1,
    Block = 2,
    FilteredBlock = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Bytes32,
}

impl InvItem {
    pub fn block(hash: Bytes32) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }
}

/// Messages exchanged with a peer during catch-up.
///
/// Framing and encoding live below the [`Peer`] abstraction; this enum is the
/// decoded vocabulary the sync core works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GetHeaders {
        version: u32,
        locator: Vec<Bytes32>,
        hash_stop: Bytes32,
    },
    Headers(Vec<BlockHeader>),
    GetData(Vec<InvItem>),
    Block(Block),
    MerkleBlock(Block),
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

impl Message {
    pub fn get_headers(locator: Vec<Bytes32>, hash_stop: Bytes32) -> Self {
        Message::GetHeaders {
            version: GET_HEADERS_VERSION,
            locator,
            hash_stop,
        }
    }

    pub fn get_blocks(hashes: impl IntoIterator<Item = Bytes32>) -> Self {
        Message::GetData(hashes.into_iter().map(InvItem::block).collect())
    }

    /// Wire command name.
    pub fn name(&self) -> &'static str {
        match self {
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::GetHeaders { locator, .. } => {
                write!(f, "GetHeaders(locator_len={})", locator.len())
            }
            Message::Headers(headers) => write!(f, "Headers(count={})", headers.len()),
            Message::GetData(items) => write!(f, "GetData(count={})", items.len()),
            Message::Block(block) => write!(f, "Block({})", block.hash()),
            Message::MerkleBlock(block) => write!(f, "MerkleBlock({})", block.hash()),
            Message::Ping { nonce } => write!(f, "Ping({nonce})"),
            Message::Pong { nonce } => write!(f, "Pong({nonce})"),
        }
    }
}

/// A connected remote peer.
///
/// Sending is fire-and-forget; inbound messages are delivered in arrival
/// order. `next_message` returns `None` once the connection is gone.
#[async_trait]
pub trait Peer: Send + Sync {
    fn peer_id(&self) -> PeerId;

    fn send_message(&self, message: Message);

    async fn next_message(&self) -> Option<Message>;
}
