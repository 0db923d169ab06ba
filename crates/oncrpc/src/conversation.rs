//! Transport conversations
//!
//! A conversation is every packet exchanged between two endpoints that
//! share one XID space. Each conversation owns its own [`CallTable`].
//!
//! Stream transports match on the full address/port pair in either
//! direction. Datagram servers often answer from a different socket than
//! the one the call was sent to, so datagram conversations are keyed on
//! the client address plus the server port the call was aimed at:
//!
//! ```text
//! call:  client:ephemeral -> server:port    key = (client, port)
//! reply: server:other     -> client:eph.    key = (client, other)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::debug;

use crate::call_table::CallTable;

/// Monotonically increasing per-capture frame identifier
pub type FrameNumber = u64;

/// Transport protocol carrying the RPC messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Record-marked byte stream
    Tcp,
    /// One message per datagram
    Udp,
}

/// Metadata the transport layer supplies with every segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub frame: FrameNumber,
    /// Capture time, relative to any fixed epoch
    pub timestamp: Duration,
    pub transport: Transport,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// Stream sequence number of the first byte (zero for datagrams)
    pub seq: u32,
}

impl PacketInfo {
    pub fn tcp(frame: FrameNumber, src: SocketAddr, dst: SocketAddr, seq: u32) -> Self {
        Self {
            frame,
            timestamp: Duration::ZERO,
            transport: Transport::Tcp,
            src,
            dst,
            seq,
        }
    }

    pub fn udp(frame: FrameNumber, src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            frame,
            timestamp: Duration::ZERO,
            transport: Transport::Udp,
            src,
            dst,
            seq: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Which side of an exchange a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Call,
    Reply,
}

/// Lookup key for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Full endpoint pair, stored in a canonical order
    Stream { a: SocketAddr, b: SocketAddr },
    /// Client address and the server port the calls were sent to
    Datagram { client: IpAddr, server_port: u16 },
}

impl ConversationKey {
    pub fn new(info: &PacketInfo, direction: Direction) -> Self {
        match info.transport {
            Transport::Tcp => {
                let (a, b) = if info.src <= info.dst {
                    (info.src, info.dst)
                } else {
                    (info.dst, info.src)
                };
                ConversationKey::Stream { a, b }
            }
            Transport::Udp => match direction {
                Direction::Call => ConversationKey::Datagram {
                    client: info.src.ip(),
                    server_port: info.dst.port(),
                },
                Direction::Reply => ConversationKey::Datagram {
                    client: info.dst.ip(),
                    server_port: info.src.port(),
                },
            },
        }
    }
}

/// Capture-unique conversation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub u32);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conv#{}", self.0)
    }
}

/// Per-conversation state
#[derive(Debug)]
pub struct ConversationState {
    pub id: ConversationId,
    pub key: ConversationKey,
    pub first_frame: FrameNumber,
    pub calls: CallTable,
    /// Set once any message on this conversation framed and classified
    pub rpc_seen: bool,
}

/// Owns every conversation for the lifetime of a capture
#[derive(Debug, Default)]
pub struct ConversationStore {
    ids: HashMap<ConversationKey, ConversationId>,
    conversations: Vec<ConversationState>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the conversation for `key`, creating it on first sight
    pub fn get_or_create(&mut self, key: ConversationKey, frame: FrameNumber) -> ConversationId {
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = ConversationId(self.conversations.len() as u32);
        debug!("New conversation {} for {:?} at frame {}", id, key, frame);
        self.conversations.push(ConversationState {
            id,
            key,
            first_frame: frame,
            calls: CallTable::new(),
            rpc_seen: false,
        });
        self.ids.insert(key, id);
        id
    }

    pub fn find(&self, key: &ConversationKey) -> Option<ConversationId> {
        self.ids.get(key).copied()
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationState> {
        self.conversations.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: ConversationId) -> Option<&mut ConversationState> {
        self.conversations.get_mut(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationState> {
        self.conversations.iter()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
