//! # The Local Node
//!
//! [`LocalNode`] ties the pieces together: the keypair and the signed local
//! entry, the NetDB, the peer manager, the local collection, and the post
//! store behind its trait. It is also the node's [`ProtocolHandler`] — every
//! message the server dispatches lands in the handler impl at the bottom of
//! this file.
//!
//! ```ignore
//! let node = LocalNode::open(config, keypair, Arc::new(EmptyPostStore)).await?;
//! let (addr, _accept_loop) = node.listen("0.0.0.0:5050").await?;
//! node.bootstrap("bootstrap.example.org:5050").await?;
//! let entry = node.peer_manager().resolve(&some_address).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::Config;
use crate::data::{Collection, PostStore};
use crate::entry::Entry;
use crate::identity::{Address, Keypair};
use crate::messages::{
    Message, MessageCapabilities, MessageCollection, MessageHandshake, MessageRequestPiece,
    MessageSearchQuery, PROTO_DHT_ENTRIES, PROTO_DHT_ENTRY, PROTO_HASH_LIST, PROTO_OK,
    PROTO_POSTS, MAX_SEARCH_LENGTH,
};
use crate::netdb::NetDB;
use crate::peer::Peer;
use crate::peer_manager::{PeerManager, ResolveError, SeedSpawner};
use crate::server::{ProtocolHandler, Server};
use crate::transport::ConnHeader;

// ============================================================================
// Local identity
// ============================================================================

/// The node's own keypair and signed entry. Shared between the peer
/// manager (announce loops re-sign) and the server (handshakes present it).
pub struct LocalIdentity {
    keypair: Keypair,
    entry: RwLock<Entry>,
    capabilities: MessageCapabilities,
}

impl LocalIdentity {
    pub fn new(keypair: Keypair, entry: Entry) -> Arc<Self> {
        Arc::new(Self {
            keypair,
            entry: RwLock::new(entry),
            capabilities: MessageCapabilities {
                compression: vec!["gzip".into()],
            },
        })
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub async fn entry(&self) -> Entry {
        self.entry.read().await.clone()
    }

    pub async fn public_address(&self) -> String {
        self.entry.read().await.public_address.clone()
    }

    pub async fn set_public_address(&self, host: String) {
        self.entry.write().await.public_address = host;
    }

    pub async fn set_port(&self, port: u16) {
        self.entry.write().await.port = port;
    }

    pub async fn set_collection(&self, collection_hash: Vec<u8>, post_count: i64) {
        let mut entry = self.entry.write().await;
        entry.collection_hash = collection_hash;
        entry.post_count = post_count;
    }

    /// Add a peer to our (unsigned) seed list. Returns false when it was
    /// already there.
    pub async fn add_seed(&self, address: Address) -> bool {
        let mut entry = self.entry.write().await;
        if entry.seeds.contains(&address) {
            return false;
        }
        entry.seeds.push(address);
        true
    }

    /// Record that we seed `address`. Callers re-sign afterwards, since
    /// the seeding list is covered by the signature.
    pub async fn add_seeding(&self, address: Address) {
        let mut entry = self.entry.write().await;
        if !entry.seeding.contains(&address) {
            entry.seeding.push(address);
        }
    }

    /// Re-sign the entry, refreshing its `updated` stamp.
    pub async fn sign_entry(&self) {
        let mut entry = self.entry.write().await;
        self.keypair.sign_entry(&mut entry);
    }

    pub async fn handshake_payload(&self) -> MessageHandshake {
        MessageHandshake {
            capabilities: self.capabilities.clone(),
            entry: self.entry().await,
        }
    }
}

// ============================================================================
// Local node
// ============================================================================

pub struct LocalNode {
    identity: Arc<LocalIdentity>,
    netdb: Arc<NetDB>,
    peers: Arc<PeerManager>,
    posts: Arc<dyn PostStore>,
    collection: Mutex<Collection>,
    config: Config,
}

impl LocalNode {
    /// Open the node: storage, identity, peer manager. Does not listen yet.
    pub async fn open(
        config: Config,
        keypair: Keypair,
        posts: Arc<dyn PostStore>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::open_with_seed_spawner(config, keypair, posts, None).await
    }

    pub async fn open_with_seed_spawner(
        config: Config,
        keypair: Keypair,
        posts: Arc<dyn PostStore>,
        seed_spawner: Option<Arc<dyn SeedSpawner>>,
    ) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let address = keypair.address();
        let netdb = Arc::new(
            NetDB::open(
                address,
                &config.data_dir.join("netdb.db"),
                config.data_dir.join("table.dat"),
            )
            .await?,
        );

        // our collection, mirrored into the signed entry
        let collection = match Collection::load(&config.data_dir.join("collection.dat")).await {
            Ok(collection) => collection,
            Err(_) => Collection::default(),
        };

        let mut entry = keypair.new_entry(&config.node.name, &config.node.desc);
        entry.public_address = config.node.public_address.clone();
        if entry.public_address.is_empty() {
            // peers reject entries without a public address at handshake
            if let Some(ip) = crate::peer_manager::probe_external_ip() {
                entry.public_address = ip.to_string();
            }
        }
        entry.port = config
            .bind
            .zif
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        entry.collection_hash = collection.root_hash().to_vec();
        entry.post_count = posts.post_count(&address).await.unwrap_or(0);
        keypair.sign_entry(&mut entry);

        let identity = LocalIdentity::new(keypair, entry);

        let peers = PeerManager::new(
            identity.clone(),
            netdb.clone(),
            seed_spawner,
            config.net.max_peers,
            config.socks_port(),
            config.net.max_message_size,
            config.data_dir.clone(),
        );

        let node = Arc::new(Self {
            identity,
            netdb,
            peers,
            posts,
            collection: Mutex::new(collection),
            config,
        });

        // the peer manager talks back to us through a weak handler ref
        let handler: Arc<dyn ProtocolHandler> = node.clone();
        node.peers.set_handler(Arc::downgrade(&handler));

        info!(address = %node.address(), "node open");
        Ok(node)
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    pub fn netdb(&self) -> &Arc<NetDB> {
        &self.netdb
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub async fn entry(&self) -> Entry {
        self.identity.entry().await
    }

    /// Bind the protocol listener. When the configured entry carries no
    /// port yet (ephemeral bind), the bound port is adopted and the entry
    /// re-signed.
    pub async fn listen(
        self: &Arc<Self>,
        addr: &str,
    ) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let handler: Arc<dyn ProtocolHandler> = self.clone();
        let (local_addr, handle) = Server::new(handler, self.config.net.max_message_size)
            .listen(addr)
            .await?;

        if self.identity.entry().await.port == 0 {
            self.identity.set_port(local_addr.port()).await;
            self.identity.sign_entry().await;
        }

        Ok((local_addr, handle))
    }

    /// Bootstrap through a known public address: connect, ask for the
    /// entries closest to ourselves, store every verified one.
    pub async fn bootstrap(self: &Arc<Self>, addr: &str) -> Result<usize, ResolveError> {
        let peer = self.peers.connect_peer_direct(addr).await?;

        let mut stream = peer.open_stream().await?;
        let result = stream.bootstrap(&self.netdb, &self.address()).await;
        stream.close().await;

        result.map_err(|e| ResolveError::Peer(e.into()))
    }

    /// Replace the local collection and re-sign the entry over its root.
    pub async fn set_collection(self: &Arc<Self>, collection: Collection) {
        let root = collection.root_hash().to_vec();
        let count = self
            .posts
            .post_count(&self.address())
            .await
            .unwrap_or_default();
        *self.collection.lock().await = collection;
        self.identity.set_collection(root, count).await;
        self.identity.sign_entry().await;
    }
}

// ============================================================================
// Protocol handlers
// ============================================================================

#[async_trait]
impl ProtocolHandler for LocalNode {
    async fn handshake_payload(&self) -> MessageHandshake {
        self.identity.handshake_payload().await
    }

    async fn handle_handshake(
        &self,
        client: Client,
        header: ConnHeader,
    ) -> anyhow::Result<Arc<Peer>> {
        let entry = header.entry.clone();
        let peer =
            Peer::from_accepted(client, header, self.config.net.max_message_size).await;
        peer.connect_server().await?;

        self.peers.set_peer(peer.clone()).await;

        // a free verified entry; insert it just in case
        if let Err(e) = self.netdb.insert(&entry).await {
            debug!(error = %e, "could not store handshake entry");
        }

        Ok(peer)
    }

    async fn handle_close_connection(&self, address: &Address) {
        self.peers.handle_close_connection(address).await;
    }

    /// The querying peer sends an address; we respond with the entry under
    /// it, or `no` when we hold nothing.
    async fn handle_query(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let address: Address = msg.read()?;
        info!(target = %address, "received query");

        if address == self.address() {
            let entry = self.identity.entry().await;
            client
                .write_message(&Message::with_payload(PROTO_DHT_ENTRY, &entry)?)
                .await?;
            return Ok(());
        }

        match self.netdb.query(&address).await? {
            Some(entry) => {
                client
                    .write_message(&Message::with_payload(PROTO_DHT_ENTRY, &entry)?)
                    .await?;
            }
            None => {
                client.write_no("no entry stored").await?;
            }
        }
        Ok(())
    }

    async fn handle_find_closest(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let address: Address = msg.read()?;
        info!(target = %address, "received find closest");

        let entries = self.netdb.find_closest(&address).await?;
        debug!(count = entries.len(), "found entries");

        client
            .write_message(&Message::with_payload(PROTO_DHT_ENTRIES, &entries)?)
            .await?;
        Ok(())
    }

    async fn handle_announce(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let entry: Entry = msg.read()?;
        info!(address = %entry.address, "announce");

        match self.netdb.insert(&entry).await {
            Ok(affected) if affected > 0 => {
                client.write_message(&Message::new(PROTO_OK)).await?;
                info!(peer = %entry.address, "saved new peer");
            }
            Ok(_) => {
                client.write_no("failed to save entry").await?;
            }
            Err(e) => {
                warn!(peer = %entry.address, error = %e, "rejected announce");
                client.write_no(&e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn handle_search(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let query: MessageSearchQuery = msg.read()?;
        if query.query.len() > MAX_SEARCH_LENGTH {
            anyhow::bail!("search query too long");
        }
        info!(query = %query.query, "search received");

        let posts = self.posts.search(&query.query, query.page).await?;
        client
            .write_message(&Message::with_payload(PROTO_POSTS, &posts)?)
            .await?;
        Ok(())
    }

    async fn handle_recent(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let page: i64 = msg.read()?;
        info!(page, "received query for recent posts");

        let posts = self.posts.query_recent(page).await?;
        client
            .write_message(&Message::with_payload(PROTO_POSTS, &posts)?)
            .await?;
        Ok(())
    }

    async fn handle_popular(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let page: i64 = msg.read()?;
        info!(page, "received query for popular posts");

        let posts = self.posts.query_popular(page).await?;
        client
            .write_message(&Message::with_payload(PROTO_POSTS, &posts)?)
            .await?;
        Ok(())
    }

    async fn handle_hash_list(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let address: Address = msg.read()?;
        info!(address = %address, "collection request received");

        let hash_list = if address == self.address() {
            self.collection.lock().await.hash_list.clone()
        } else if self.netdb.query(&address).await?.is_some() {
            // a mirrored collection, persisted when we seeded it
            let path = self
                .config
                .data_dir
                .join(address.to_base58())
                .join("collection.dat");
            Collection::load(&path).await?.hash_list
        } else {
            anyhow::bail!("cannot return collection hash list");
        };

        let collection = MessageCollection {
            size: (hash_list.len() / 32) as i64,
            hash_list,
        };
        client
            .write_message(&Message::with_payload(PROTO_HASH_LIST, &collection)?)
            .await?;
        Ok(())
    }

    /// Piece requests stream their reply as a gzip body directly on the
    /// stream; the server closes the stream only after we return, i.e.
    /// after the body is complete.
    async fn handle_piece(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let request: MessageRequestPiece = msg.read()?;
        info!(id = request.id, length = request.length, "received piece request");

        let address = Address::from_base58(&request.address)?;
        let posts = self
            .posts
            .piece_posts(&address, request.id, request.length)
            .await?
            .ok_or_else(|| anyhow::anyhow!("piece not found"))?;

        crate::data::write_piece_channel(client.inner_mut(), posts).await?;
        info!("sent all pieces");
        Ok(())
    }

    /// The sender asks to be registered as a seed for the given address.
    async fn handle_add_peer(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()> {
        let address: Address = msg.read()?;
        let from = msg
            .from
            .ok_or_else(|| anyhow::anyhow!("add peer request without a verified sender"))?;

        info!(from = %from, seeding = %address, "handling add peer request");

        if address == self.address() {
            if self.identity.add_seed(from).await {
                info!(peer = %from, "new seed peer");
            }
        } else {
            let mut entry = self
                .netdb
                .query(&address)
                .await?
                .ok_or_else(|| anyhow::anyhow!("cannot add peer, do not have entry"))?;

            if !entry.seeds.contains(&from) {
                entry.seeds.push(from);
            }
            self.netdb.insert(&entry).await?;
            info!(seed = %from, seeding = %address, "added seed");
        }

        client.write_message(&Message::new(PROTO_OK)).await?;
        Ok(())
    }
}
