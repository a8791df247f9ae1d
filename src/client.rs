//! # Client: Request Issuance
//!
//! A [`Client`] wraps one byte stream — the raw connection during handshake,
//! a logical stream afterwards — together with its message codec. Request
//! operations all follow the same template: send one message, read exactly
//! one reply (piece fetches stream instead), decode, verify every entry that
//! came back, and let the caller close the stream.
//!
//! A 10-second deadline covers the request/reply exchange; a peer that
//! stalls mid-request is an error, not a hang.

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::data::{read_piece_stream, Piece, Post, PIECE_CHANNEL_BUFFER};
use crate::entry::{Entry, EntryError};
use crate::identity::Address;
use crate::messages::{
    CollectionError, Message, MessageCodec, MessageCollection, MessageRequestPiece,
    MessageSearchQuery, WireError, ENTRY_LENGTH_MAX, MAX_SEARCH_LENGTH, PROTO_ADD_PEER_REQUEST,
    PROTO_DHT_ANNOUNCE, PROTO_DHT_FIND_CLOSEST, PROTO_DHT_QUERY, PROTO_HASH_LIST_REQUEST,
    PROTO_PIECE_REQUEST, PROTO_PING, PROTO_PONG, PROTO_POPULAR, PROTO_RECENT, PROTO_SEARCH,
};
use crate::netdb::{NetDB, NetDbError};
use crate::transport::{BoxedSocket, PrefixedSocket, STREAM_DEADLINE};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("peer returned no: {0}")]
    PeerReturnedNo(String),
    #[error("unexpected reply header: {0}")]
    UnexpectedHeader(String),
    #[error("peer returned too many entries ({0})")]
    TooManyEntries(usize),
    #[error("search query too long ({0} > {MAX_SEARCH_LENGTH})")]
    SearchTooLong(usize),
    #[error("request timed out")]
    Timeout,
    #[error("returned entry failed verification: {0}")]
    Entry(#[from] EntryError),
    #[error("collection rejected: {0}")]
    Collection(#[from] CollectionError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Storage(#[from] NetDbError),
}

pub struct Client {
    socket: BoxedSocket,
    codec: MessageCodec,
}

impl Client {
    pub fn new(socket: BoxedSocket, max_message_size: usize) -> Self {
        Self {
            socket,
            codec: MessageCodec::new(max_message_size),
        }
    }

    /// Split back into the socket and whatever the codec buffered past the
    /// last message.
    pub fn into_parts(self) -> (BoxedSocket, Vec<u8>) {
        (self.socket, self.codec.into_buffer())
    }

    /// Direct access to the underlying stream, for handlers that write a
    /// raw body (piece streams) instead of an enveloped reply.
    pub fn inner_mut(&mut self) -> &mut BoxedSocket {
        &mut self.socket
    }

    pub async fn read_message(&mut self) -> Result<Message, WireError> {
        self.codec.read_message(&mut self.socket).await
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<(), WireError> {
        self.codec.write_message(&mut self.socket, msg).await
    }

    /// Reply `no` with a reason; used by handlers reporting failure.
    pub async fn write_no(&mut self, reason: &str) -> Result<(), WireError> {
        self.write_message(&Message::no(reason)).await
    }

    /// Close the stream, flushing what is in flight.
    pub async fn close(mut self) {
        let _ = self.socket.shutdown().await;
    }

    /// One request, one reply, one deadline.
    async fn request(&mut self, msg: &Message) -> Result<Message, ClientError> {
        timeout(STREAM_DEADLINE, async {
            self.write_message(msg).await?;
            self.read_message().await
        })
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::from)
    }

    /// Protocol-level liveness probe.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        let reply = self.request(&Message::new(PROTO_PING)).await?;
        if reply.header != PROTO_PONG {
            return Err(ClientError::UnexpectedHeader(reply.header));
        }
        Ok(())
    }

    /// Announce the given entry to a peer, passing on this node's details so
    /// it can be reached by other peers on the network.
    pub async fn announce(&mut self, entry: &Entry) -> Result<(), ClientError> {
        let msg = Message::with_payload(PROTO_DHT_ANNOUNCE, entry)?;
        let reply = self.request(&msg).await?;
        if !reply.is_ok() {
            return Err(ClientError::PeerReturnedNo(
                reply.reason().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Ask the peer for the entry stored under an address.
    pub async fn query(&mut self, address: &Address) -> Result<Entry, ClientError> {
        let msg = Message::with_payload(PROTO_DHT_QUERY, address)?;
        let reply = self.request(&msg).await?;

        if reply.is_no() {
            return Err(ClientError::PeerReturnedNo(
                reply.reason().unwrap_or_default(),
            ));
        }

        let entry: Entry = reply.read()?;
        entry.verify()?;
        debug!(peer = %entry.address, "verified queried entry");

        Ok(entry)
    }

    /// Ask the peer for the k entries it knows closest to an address.
    /// Unverifiable entries are dropped, never returned.
    pub async fn find_closest(&mut self, address: &Address) -> Result<Vec<Entry>, ClientError> {
        let msg = Message::with_payload(PROTO_DHT_FIND_CLOSEST, address)?;
        let reply = self.request(&msg).await?;

        if reply.is_no() {
            return Err(ClientError::PeerReturnedNo(
                reply.reason().unwrap_or_default(),
            ));
        }

        let entries: Vec<Entry> = reply.read()?;
        if entries.len() > ENTRY_LENGTH_MAX {
            return Err(ClientError::TooManyEntries(entries.len()));
        }

        let mut verified = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.verify() {
                Ok(()) => verified.push(entry),
                Err(e) => warn!(peer = %entry.address, error = %e, "dropping unverifiable entry"),
            }
        }

        info!(entries = verified.len(), "find closest complete");
        Ok(verified)
    }

    /// Seed the routing table through this peer: ask for the entries
    /// closest to our own address and store every verified one. Returns how
    /// many peers were learned.
    pub async fn bootstrap(
        &mut self,
        netdb: &NetDB,
        self_address: &Address,
    ) -> Result<usize, ClientError> {
        let peers = self.find_closest(self_address).await?;

        let mut added = 0;
        for entry in &peers {
            if entry.address == *self_address {
                continue;
            }
            netdb.insert(entry).await?;
            added += 1;
        }

        info!(peers = added, "bootstrap complete");
        Ok(added)
    }

    /// Full-text search of the peer's posts.
    pub async fn search(&mut self, query: &str, page: i64) -> Result<Vec<Post>, ClientError> {
        if query.len() > MAX_SEARCH_LENGTH {
            return Err(ClientError::SearchTooLong(query.len()));
        }

        let payload = MessageSearchQuery {
            query: query.to_owned(),
            page,
        };
        let reply = self
            .request(&Message::with_payload(PROTO_SEARCH, &payload)?)
            .await?;
        Ok(reply.read()?)
    }

    pub async fn recent(&mut self, page: i64) -> Result<Vec<Post>, ClientError> {
        let reply = self
            .request(&Message::with_payload(PROTO_RECENT, &page)?)
            .await?;
        Ok(reply.read()?)
    }

    pub async fn popular(&mut self, page: i64) -> Result<Vec<Post>, ClientError> {
        let reply = self
            .request(&Message::with_payload(PROTO_POPULAR, &page)?)
            .await?;
        Ok(reply.read()?)
    }

    /// Download a peer's hash list and check it against the collection root
    /// in its signed entry.
    pub async fn collection(
        &mut self,
        address: &Address,
        remote_entry: &Entry,
    ) -> Result<MessageCollection, ClientError> {
        let reply = self
            .request(&Message::with_payload(PROTO_HASH_LIST_REQUEST, address)?)
            .await?;

        if reply.is_no() {
            return Err(ClientError::PeerReturnedNo(
                reply.reason().unwrap_or_default(),
            ));
        }

        let collection: MessageCollection = reply.read()?;
        collection.verify(&remote_entry.collection_hash)?;

        info!(pieces = collection.size, "received valid collection");
        Ok(collection)
    }

    /// Register as a seed for an address with this peer.
    pub async fn request_add_peer(&mut self, address: &Address) -> Result<(), ClientError> {
        let reply = self
            .request(&Message::with_payload(PROTO_ADD_PEER_REQUEST, address)?)
            .await?;
        if !reply.is_ok() {
            return Err(ClientError::PeerReturnedNo(
                reply.reason().unwrap_or_default(),
            ));
        }
        info!("registered as seed peer");
        Ok(())
    }

    /// Request pieces `since..since+length` of a collection and stream them
    /// lazily. The stream body is gzip on the raw stream, so this consumes
    /// the client; it ends at the sentinel post or when the receiver is
    /// dropped.
    pub async fn pieces(
        mut self,
        address: &Address,
        since: i64,
        length: i64,
    ) -> Result<mpsc::Receiver<Piece>, ClientError> {
        let payload = MessageRequestPiece {
            address: address.to_base58(),
            id: since,
            length,
        };
        timeout(
            STREAM_DEADLINE,
            self.write_message(&Message::with_payload(PROTO_PIECE_REQUEST, &payload)?),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        let (socket, leftover) = self.into_parts();
        let reader = PrefixedSocket::new(leftover, socket);

        let (tx, rx) = mpsc::channel(PIECE_CHANNEL_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = read_piece_stream(reader, tx).await {
                debug!(error = %e, "piece stream ended early");
            }
        });

        Ok(rx)
    }
}
