//! # Peer: a Live Counterpart
//!
//! A [`Peer`] owns exactly one transport connection and the multiplex
//! session layered on it, caches the remote's verified entry, and carries
//! the per-peer rate limiters. Its typed request operations all open a
//! logical stream, perform one exchange, and close the stream again.
//!
//! A peer calls back into its manager through the [`PeerHooks`] capability
//! set bound after construction — last-seen updates, seed-manager
//! registration, and entry bookkeeping all flow through it, so the peer
//! never needs to know who manages it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::client::{Client, ClientError};
use crate::data::{Collection, Piece};
use crate::entry::Entry;
use crate::identity::Address;
use crate::limiter::PeerLimiter;
use crate::messages::{MessageCapabilities, MessageCollection, MessageHandshake, WireError};
use crate::transport::{
    ConnHeader, HandshakeError, Session, SessionError, StreamManager,
};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer could not be reached")]
    Unreachable,
    #[error("ping timed out")]
    PingTimeout,
    #[error("piece hash mismatch")]
    PieceHashMismatch,
    #[error("peer returned an entry for the wrong address")]
    WrongEntry,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Callbacks a peer delivers to whatever manages it. A single value with
/// these four methods is bound after construction; the manager side holds
/// the peer map, so the reference back is deliberately indirect.
#[async_trait]
pub trait PeerHooks: Send + Sync + 'static {
    /// The peer was just observed alive.
    fn update_seen(&self, address: &Address);

    /// Start (or reuse) a seed manager for an address.
    async fn add_seed_manager(&self, address: Address) -> anyhow::Result<()>;

    /// A fresh verified entry passed through this peer.
    async fn add_entry(&self, entry: Entry) -> anyhow::Result<()>;

    /// We now seed the given entry's collection.
    async fn add_seeding(&self, entry: Entry) -> anyhow::Result<()>;
}

pub struct Peer {
    address: Address,
    public_key: Vec<u8>,
    capabilities: MessageCapabilities,

    streams: StreamManager,
    limiter: PeerLimiter,
    entry: RwLock<Option<Entry>>,
    hooks: std::sync::RwLock<Option<Arc<dyn PeerHooks>>>,
}

impl Peer {
    /// Dial `addr`, run the preamble + handshake, and wrap the verified
    /// connection. The session is not promoted yet; callers pick the role.
    pub async fn connect(
        addr: &str,
        socks_port: Option<u16>,
        max_message_size: usize,
        local: &MessageHandshake,
    ) -> Result<Arc<Peer>, PeerError> {
        debug!(address = addr, "connecting");

        let streams = StreamManager::new(socks_port, max_message_size);
        let header = streams.open_tcp(addr, local).await?;

        Ok(Arc::new(Self::from_parts(streams, header)))
    }

    /// Wrap an accepted, handshaken connection (server side).
    pub async fn from_accepted(
        client: Client,
        header: ConnHeader,
        max_message_size: usize,
    ) -> Arc<Peer> {
        let streams = StreamManager::new(None, max_message_size);
        streams.set_connection(client, header.clone()).await;
        Arc::new(Self::from_parts(streams, header))
    }

    fn from_parts(streams: StreamManager, header: ConnHeader) -> Self {
        Self {
            address: header.entry.address,
            public_key: header.entry.public_key.clone(),
            capabilities: header.capabilities,
            streams,
            limiter: PeerLimiter::default(),
            entry: RwLock::new(Some(header.entry)),
            hooks: std::sync::RwLock::new(None),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn capabilities(&self) -> &MessageCapabilities {
        &self.capabilities
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Bind the manager-side callbacks.
    pub fn bind_hooks(&self, hooks: Arc<dyn PeerHooks>) {
        *self.hooks.write().expect("hooks lock poisoned") = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn PeerHooks>> {
        self.hooks.read().expect("hooks lock poisoned").clone()
    }

    pub fn update_seen(&self) {
        if let Some(hooks) = self.hooks() {
            hooks.update_seen(&self.address);
        }
    }

    /// Promote the connection to a session as the dialing side.
    pub async fn connect_client(&self) -> Result<Arc<Session>, PeerError> {
        Ok(self.streams.connect_client().await?)
    }

    /// Promote the connection to a session as the accepting side.
    pub async fn connect_server(&self) -> Result<Arc<Session>, PeerError> {
        Ok(self.streams.connect_server().await?)
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.streams.session().await
    }

    /// Accept the next inbound logical stream from this peer.
    pub async fn accept_stream(&self) -> Option<(u64, Client)> {
        self.streams.accept_stream().await
    }

    pub fn remove_stream(&self, id: u64) {
        self.streams.remove_stream(id);
    }

    /// Open a logical stream for a request, taking a query token first.
    pub async fn open_stream(&self) -> Result<Client, PeerError> {
        self.limiter.query.wait().await;
        self.update_seen();
        Ok(self.streams.open_stream().await?)
    }

    /// Tear the connection down. Background loops observe the closed
    /// session and exit.
    pub async fn terminate(&self) {
        self.streams.close().await;
    }

    /// Liveness probe with a deadline: one `ping`/`pong` exchange on a
    /// fresh stream. Returns the round-trip time.
    pub async fn ping(&self, deadline: Duration) -> Result<Duration, PeerError> {
        let session = self.session().await.ok_or(SessionError::NoSession)?;
        if session.is_closed() {
            return Err(SessionError::Closed.into());
        }

        let start = Instant::now();
        timeout(deadline, async {
            let mut stream = self.streams.open_stream().await?;
            let result = stream.ping().await;
            stream.close().await;
            result.map_err(PeerError::from)
        })
        .await
        .map_err(|_| PeerError::PingTimeout)??;

        self.update_seen();
        Ok(start.elapsed())
    }

    /// Announce an entry (normally our own, freshly re-signed) to this
    /// peer. Paced by the per-peer announce limiter.
    pub async fn announce(&self, entry: &Entry) -> Result<(), PeerError> {
        self.limiter.announce.wait().await;

        debug!(peer = %self.address, "sending announce");

        let mut stream = self.streams.open_stream().await?;
        let result = stream.announce(entry).await;
        stream.close().await;
        result?;

        self.update_seen();
        Ok(())
    }

    /// The remote's entry: cached from the handshake, refreshed on demand.
    pub async fn entry(&self) -> Result<Entry, PeerError> {
        if let Some(entry) = self.entry.read().await.clone() {
            return Ok(entry);
        }
        self.fetch_entry().await
    }

    /// Query the peer for its own entry and re-cache it.
    pub async fn fetch_entry(&self) -> Result<Entry, PeerError> {
        let entry = self.query(&self.address).await?;
        if entry.address != self.address {
            return Err(PeerError::WrongEntry);
        }
        *self.entry.write().await = Some(entry.clone());
        Ok(entry)
    }

    pub async fn query(&self, address: &Address) -> Result<Entry, PeerError> {
        info!(target = %address, peer = %self.address, "querying");

        let mut stream = self.open_stream().await?;
        let result = stream.query(address).await;
        stream.close().await;
        Ok(result?)
    }

    pub async fn find_closest(&self, address: &Address) -> Result<Vec<Entry>, PeerError> {
        info!(target = %address, peer = %self.address, "finding closest");

        let mut stream = self.open_stream().await?;
        let result = stream.find_closest(address).await;
        stream.close().await;
        Ok(result?)
    }

    pub async fn search(&self, query: &str, page: i64) -> Result<Vec<crate::data::Post>, PeerError> {
        let mut stream = self.open_stream().await?;
        let result = stream.search(query, page).await;
        stream.close().await;
        Ok(result?)
    }

    pub async fn recent(&self, page: i64) -> Result<Vec<crate::data::Post>, PeerError> {
        let mut stream = self.open_stream().await?;
        let result = stream.recent(page).await;
        stream.close().await;
        Ok(result?)
    }

    pub async fn popular(&self, page: i64) -> Result<Vec<crate::data::Post>, PeerError> {
        let mut stream = self.open_stream().await?;
        let result = stream.popular(page).await;
        stream.close().await;
        Ok(result?)
    }

    pub async fn collection(
        &self,
        address: &Address,
        remote_entry: &Entry,
    ) -> Result<MessageCollection, PeerError> {
        let mut stream = self.open_stream().await?;
        let result = stream.collection(address, remote_entry).await;
        stream.close().await;
        Ok(result?)
    }

    /// Start a lazy piece download. The stream stays open until the
    /// sentinel arrives or the receiver is dropped.
    pub async fn pieces(
        &self,
        address: &Address,
        since: i64,
        length: i64,
    ) -> Result<mpsc::Receiver<Piece>, PeerError> {
        let stream = self.open_stream().await?;
        Ok(stream.pieces(address, since, length).await?)
    }

    /// Register as a seed for `entry` with this peer, then wire up the
    /// local bookkeeping through the hooks.
    pub async fn request_add_peer(&self, entry: &Entry) -> Result<(), PeerError> {
        info!(seeding = %entry.address, "registering as seed");

        let mut stream = self.open_stream().await?;
        let result = stream.request_add_peer(&entry.address).await;
        stream.close().await;
        result?;

        if let Some(hooks) = self.hooks() {
            if let Err(e) = hooks.add_seed_manager(entry.address).await {
                warn!(error = %e, "seed manager setup failed");
            }
            // a collection does not seed itself
            if !entry.seeds.contains(&entry.address) {
                if let Err(e) = hooks.add_seeding(entry.clone()).await {
                    warn!(error = %e, "seeding bookkeeping failed");
                }
            }
        }

        Ok(())
    }

    /// Mirror this peer's collection: fetch and persist its hash list,
    /// stream all pieces (verifying each against the list), hand them to
    /// `pieces_out`, and register as a seed when done.
    pub async fn mirror(
        &self,
        data_dir: &std::path::Path,
        pieces_out: mpsc::Sender<Piece>,
    ) -> Result<Entry, PeerError> {
        let entry = self.fetch_entry().await?;

        if let Some(hooks) = self.hooks() {
            if let Err(e) = hooks.add_entry(entry.clone()).await {
                warn!(error = %e, "entry bookkeeping failed");
            }
        }

        info!(peer = %entry.address, "mirroring");

        let mcol = self.collection(&entry.address, &entry).await?;
        let collection = Collection::from_hash_list(mcol.hash_list.clone());
        let path = data_dir
            .join(entry.address.to_base58())
            .join("collection.dat");
        if let Err(e) = collection.save(&path).await {
            warn!(error = %e, path = %path.display(), "failed to persist mirrored collection");
        }

        info!(size = mcol.size, "downloading collection");

        let mut rx = self.pieces(&entry.address, 0, mcol.size).await?;
        let mut index = 0usize;
        while let Some(piece) = rx.recv().await {
            match collection.piece_hash(index) {
                Some(expected) if expected == &piece.hash()[..] => {}
                _ => return Err(PeerError::PieceHashMismatch),
            }
            if pieces_out.send(piece).await.is_err() {
                // consumer gone; stop mirroring
                return Ok(entry);
            }
            index += 1;
        }

        info!("mirror complete");

        self.request_add_peer(&entry).await?;
        Ok(entry)
    }
}
