//! # Wire Protocol Messages
//!
//! This module defines the message envelope and payload types exchanged over
//! logical streams, plus the bounded msgpack codec that frames them.
//!
//! ## Envelope
//!
//! Every message on a stream is `msgpack({ Header: string, Content: bytes })`.
//! `Content` carries a nested msgpack payload whose schema is determined by
//! the header. The receiver populates the transient `from` field with the
//! peer's verified address before dispatch.
//!
//! ## Headers
//!
//! The header set is closed:
//!
//! | Header | Payload |
//! |---|---|
//! | `ok`, `no`, `terminate`, `ping`, `pong` | none / reason string |
//! | `cap` | capabilities + entry (handshake) |
//! | `dht.query`, `dht.find_closest`, `add_peer.request`, `hash_list.request` | Address |
//! | `dht.announce`, `dht.entry` | Entry |
//! | `dht.entries` | array of Entry |
//! | `search` | `{ query, page }` |
//! | `recent`, `popular` | page number |
//! | `posts` | array of Post |
//! | `hash_list` | `{ hashList, size }` |
//! | `piece.request` | `{ address, id, length }` |
//!
//! ## Size Limits
//!
//! The decoder counts every byte it consumes and refuses to buffer more than
//! `max_message_size` (default 1 MiB) for a single message; the budget is
//! reset between messages. Oversized or malformed input is an error, never a
//! panic.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::entry::Entry;
use crate::identity::Address;

// Status replies.
pub const PROTO_OK: &str = "ok";
pub const PROTO_NO: &str = "no";
pub const PROTO_TERMINATE: &str = "terminate";

// Session liveness.
pub const PROTO_PING: &str = "ping";
pub const PROTO_PONG: &str = "pong";

// Handshake capability exchange.
pub const PROTO_CAP: &str = "cap";

// DHT operations.
pub const PROTO_DHT_QUERY: &str = "dht.query";
pub const PROTO_DHT_ANNOUNCE: &str = "dht.announce";
pub const PROTO_DHT_FIND_CLOSEST: &str = "dht.find_closest";
pub const PROTO_DHT_ENTRIES: &str = "dht.entries";
pub const PROTO_DHT_ENTRY: &str = "dht.entry";

// Post queries.
pub const PROTO_SEARCH: &str = "search";
pub const PROTO_RECENT: &str = "recent";
pub const PROTO_POPULAR: &str = "popular";
pub const PROTO_POSTS: &str = "posts";

// Collection mirroring.
pub const PROTO_HASH_LIST_REQUEST: &str = "hash_list.request";
pub const PROTO_HASH_LIST: &str = "hash_list";
pub const PROTO_PIECE_REQUEST: &str = "piece.request";
pub const PROTO_ADD_PEER_REQUEST: &str = "add_peer.request";

/// Default cap on a single decoded message (configurable per connection).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum entries accepted in a single `dht.entries` reply.
pub const ENTRY_LENGTH_MAX: usize = 1024;

/// Page size for paginated queries.
pub const MAX_PAGE_SIZE: usize = 25;

/// Maximum length of a search query string.
pub const MAX_SEARCH_LENGTH: usize = 256;

/// Protocol and codec failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message exceeds size cap of {0} bytes")]
    MessageTooLarge(usize),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not a zif connection")]
    BadMagic,
    #[error("incorrect protocol version")]
    BadVersion,
    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The protocol envelope carried on every logical stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Header")]
    pub header: String,
    #[serde(rename = "Content", with = "serde_bytes")]
    pub content: Vec<u8>,

    /// Verified address of the sending peer; populated on the receiver.
    #[serde(skip)]
    pub from: Option<Address>,
}

impl Message {
    pub fn new(header: &str) -> Self {
        Self {
            header: header.to_owned(),
            content: Vec::new(),
            from: None,
        }
    }

    /// Build a message with a msgpack-encoded payload.
    pub fn with_payload<T: Serialize>(header: &str, payload: &T) -> Result<Self, WireError> {
        Ok(Self {
            header: header.to_owned(),
            content: rmp_serde::to_vec_named(payload)?,
            from: None,
        })
    }

    /// A `no` reply carrying a reason string.
    pub fn no(reason: &str) -> Self {
        Self::with_payload(PROTO_NO, &reason).unwrap_or_else(|_| Self::new(PROTO_NO))
    }

    /// Decode the payload according to the schema the caller expects.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(rmp_serde::from_slice(&self.content)?)
    }

    /// The reason string of a `no` reply, if one was attached.
    pub fn reason(&self) -> Option<String> {
        self.read::<String>().ok()
    }

    /// Easier than comparing the header member to a constant repeatedly.
    pub fn is_ok(&self) -> bool {
        self.header == PROTO_OK
    }

    pub fn is_no(&self) -> bool {
        self.header == PROTO_NO
    }
}

/// Capability set exchanged during handshake.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageCapabilities {
    /// Compression codecs this peer accepts for piece streams.
    pub compression: Vec<String>,
}

/// Payload of the `cap` handshake message: who we are plus what we speak.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHandshake {
    pub capabilities: MessageCapabilities,
    pub entry: Entry,
}

/// Payload of `search`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSearchQuery {
    pub query: String,
    pub page: i64,
}

/// Payload of `hash_list`: the concatenated 32-byte piece hashes of a
/// collection plus the piece count.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageCollection {
    #[serde(with = "serde_bytes")]
    pub hash_list: Vec<u8>,
    pub size: i64,
}

/// Reasons a received hash list is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error("hash list length does not match piece count")]
    LengthMismatch,
    #[error("hash list does not match collection root")]
    RootMismatch,
}

impl MessageCollection {
    /// Check the hash list against a signed collection root hash.
    pub fn verify(&self, root: &[u8]) -> Result<(), CollectionError> {
        if self.hash_list.len() % 32 != 0 || self.size as usize != self.hash_list.len() / 32 {
            return Err(CollectionError::LengthMismatch);
        }
        if blake3::hash(&self.hash_list).as_bytes() != root {
            return Err(CollectionError::RootMismatch);
        }
        Ok(())
    }
}

/// Payload of `piece.request`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequestPiece {
    pub address: String,
    pub id: i64,
    pub length: i64,
}

/// Returns true when a decode error only means "not enough bytes yet".
fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error as E;
    match err {
        E::InvalidMarkerRead(io) | E::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Incremental msgpack framer with a per-message byte budget.
///
/// One codec is bound to one stream; bytes belonging to a pipelined next
/// message survive in the buffer across calls.
#[derive(Debug)]
pub struct MessageCodec {
    buf: Vec<u8>,
    max: usize,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max: max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max
    }

    /// Bytes read past the last decoded message. They belong to whatever
    /// takes over the connection next (the multiplexer, after handshake).
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    /// Read exactly one message, consuming at most `max_message_size` bytes
    /// for it. The budget resets once a message is produced.
    pub async fn read_message<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Message, WireError> {
        loop {
            if !self.buf.is_empty() {
                let (result, consumed) = {
                    let mut cursor = std::io::Cursor::new(self.buf.as_slice());
                    let mut de = rmp_serde::Deserializer::new(&mut cursor);
                    let result = Message::deserialize(&mut de);
                    drop(de);
                    (result, cursor.position() as usize)
                };

                match result {
                    Ok(msg) => {
                        self.buf.drain(..consumed);
                        return Ok(msg);
                    }
                    Err(e) if is_incomplete(&e) => {
                        if self.buf.len() >= self.max {
                            return Err(WireError::MessageTooLarge(self.max));
                        }
                        // fall through and read more
                    }
                    Err(e) => return Err(WireError::Decode(e)),
                }
            }

            let budget = self.max - self.buf.len();
            let mut chunk = vec![0u8; budget.min(8 * 1024)];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(WireError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Encode and write one message.
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        msg: &Message,
    ) -> Result<(), WireError> {
        let bytes = rmp_serde::to_vec_named(msg)?;
        if bytes.len() > self.max {
            return Err(WireError::MessageTooLarge(self.max));
        }
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn encode(msg: &Message) -> Vec<u8> {
        rmp_serde::to_vec_named(msg).unwrap()
    }

    #[tokio::test]
    async fn roundtrip_through_codec() {
        let addr = Keypair::generate().address();
        let msg = Message::with_payload(PROTO_DHT_QUERY, &addr).unwrap();

        let bytes = encode(&msg);
        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        let mut reader = std::io::Cursor::new(bytes);

        let decoded = codec.read_message(&mut reader).await.unwrap();
        assert_eq!(decoded.header, PROTO_DHT_QUERY);
        assert_eq!(decoded.read::<crate::identity::Address>().unwrap(), addr);
    }

    #[tokio::test]
    async fn pipelined_messages_share_the_buffer() {
        // ok followed immediately by cap, as the handshake pipelines them
        let first = Message::new(PROTO_OK);
        let second = Message::with_payload(PROTO_RECENT, &3i64).unwrap();

        let mut bytes = encode(&first);
        bytes.extend_from_slice(&encode(&second));

        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        let mut reader = std::io::Cursor::new(bytes);

        assert!(codec.read_message(&mut reader).await.unwrap().is_ok());
        let msg = codec.read_message(&mut reader).await.unwrap();
        assert_eq!(msg.header, PROTO_RECENT);
        assert_eq!(msg.read::<i64>().unwrap(), 3);
    }

    #[tokio::test]
    async fn message_at_the_cap_is_accepted_one_more_byte_is_not() {
        // find the content size whose encoded form is exactly the cap
        let cap = 4096;
        let overhead = encode(&Message {
            header: PROTO_POSTS.into(),
            content: vec![0u8; cap],
            from: None,
        })
        .len()
            - cap;

        let fitting = Message {
            header: PROTO_POSTS.into(),
            content: vec![0u8; cap - overhead],
            from: None,
        };
        let encoded = encode(&fitting);
        assert_eq!(encoded.len(), cap);

        let mut codec = MessageCodec::new(cap);
        let mut reader = std::io::Cursor::new(encoded);
        assert!(codec.read_message(&mut reader).await.is_ok());

        let too_big = Message {
            header: PROTO_POSTS.into(),
            content: vec![0u8; cap - overhead + 1],
            from: None,
        };
        let mut codec = MessageCodec::new(cap);
        let mut reader = std::io::Cursor::new(encode(&too_big));
        assert!(matches!(
            codec.read_message(&mut reader).await,
            Err(WireError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_reports_closed() {
        let msg = Message::with_payload(PROTO_RECENT, &1i64).unwrap();
        let bytes = encode(&msg);
        let truncated = &bytes[..bytes.len() - 1];

        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        let mut reader = std::io::Cursor::new(truncated.to_vec());
        assert!(matches!(
            codec.read_message(&mut reader).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        // 0x81 opens a one-pair map, then a non-string key marker
        let garbage = vec![0x81u8, 0xc1, 0xc1];
        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        let mut reader = std::io::Cursor::new(garbage);
        assert!(matches!(
            codec.read_message(&mut reader).await,
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn payload_schemas_roundtrip() {
        let sq = MessageSearchQuery {
            query: "cats".into(),
            page: 2,
        };
        let msg = Message::with_payload(PROTO_SEARCH, &sq).unwrap();
        assert_eq!(msg.read::<MessageSearchQuery>().unwrap(), sq);

        let rp = MessageRequestPiece {
            address: "abc".into(),
            id: 4,
            length: 2,
        };
        let msg = Message::with_payload(PROTO_PIECE_REQUEST, &rp).unwrap();
        assert_eq!(msg.read::<MessageRequestPiece>().unwrap(), rp);

        let col = MessageCollection {
            hash_list: vec![0u8; 64],
            size: 2,
        };
        let msg = Message::with_payload(PROTO_HASH_LIST, &col).unwrap();
        assert_eq!(msg.read::<MessageCollection>().unwrap(), col);
    }

    #[test]
    fn collection_verifies_against_root() {
        let hash_list = vec![7u8; 96];
        let col = MessageCollection {
            hash_list: hash_list.clone(),
            size: 3,
        };

        let root = blake3::hash(&hash_list);
        assert!(col.verify(root.as_bytes()).is_ok());
        assert!(col.verify(&[0u8; 32]).is_err());

        let bad_size = MessageCollection {
            hash_list,
            size: 2,
        };
        assert!(bad_size.verify(root.as_bytes()).is_err());
    }

    #[test]
    fn no_reply_carries_reason() {
        let msg = Message::no("entry failed verification");
        assert!(msg.is_no());
        assert_eq!(msg.reason().as_deref(), Some("entry failed verification"));
    }
}
