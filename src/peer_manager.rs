//! # Peer Manager
//!
//! Keeps the bounded map of live peers and everything that revolves around
//! it: address resolution (local lookup, then an iterative Kademlia walk),
//! connection reuse through the public-address reverse index, last-seen
//! driven LRU eviction, the per-peer heartbeat and announce loops, and the
//! seed-manager workers.
//!
//! The map is bounded by `max_peers`; the bound is eventual, not
//! instantaneous — concurrent connects may briefly overshoot before the
//! eviction scan catches up.
//!
//! Peers call back into the manager through the [`PeerHooks`] capability
//! set; the hooks hold only a weak reference, so a peer can never keep a
//! dead manager alive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::entry::Entry;
use crate::identity::{Address, ADDRESS_BINARY_SIZE};
use crate::netdb::{NetDB, NetDbError};
use crate::node::LocalIdentity;
use crate::peer::{Peer, PeerError, PeerHooks};
use crate::server::{listen_stream, ProtocolHandler};

pub const HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(30);
pub const ANNOUNCE_FREQUENCY: Duration = Duration::from_secs(30 * 60);

/// Maximum hops for one path of the iterative resolver.
pub const RESOLVE_DEPTH: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("peer could not be reached")]
    PeerUnreachable,
    #[error("peer has disconnected")]
    PeerDisconnected,
    #[error("recursion limit reached, peer cannot be resolved")]
    RecursionLimit,
    #[error("address could not be resolved")]
    AddressUnresolvable,
    #[error("cannot connect to self")]
    SelfConnect,
    #[error(transparent)]
    Storage(#[from] NetDbError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Process-monotonic nanoseconds, for last-seen ordering.
fn monotonic_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// ============================================================================
// Seed managers
// ============================================================================

/// Handle on a seed worker. The worker itself is supplied externally; the
/// manager only tracks it and delivers the close signal when the peer goes
/// away.
pub struct SeedManager {
    address: Address,
    close: Option<oneshot::Sender<()>>,
}

impl SeedManager {
    pub fn new(address: Address, close: oneshot::Sender<()>) -> Self {
        Self {
            address,
            close: Some(close),
        }
    }

    /// A tracked seed relationship with no worker attached.
    pub fn inert(address: Address) -> Self {
        Self {
            address,
            close: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Deliver the single-shot close signal.
    pub fn close(&mut self) {
        if let Some(tx) = self.close.take() {
            let _ = tx.send(());
        }
    }
}

/// Supplies seed workers. Provided by the embedding application; the core
/// only knows how to start and stop them.
pub trait SeedSpawner: Send + Sync + 'static {
    fn spawn(&self, address: Address) -> SeedManager;
}

// ============================================================================
// Peer manager
// ============================================================================

pub struct PeerManager {
    peers: std::sync::RwLock<HashMap<Address, Arc<Peer>>>,
    peer_seen: std::sync::RwLock<HashMap<Address, u64>>,
    public_to_address: std::sync::RwLock<HashMap<String, Address>>,
    seed_managers: Mutex<HashMap<Address, SeedManager>>,

    local: Arc<LocalIdentity>,
    netdb: Arc<NetDB>,
    handler: std::sync::RwLock<Option<Weak<dyn ProtocolHandler>>>,
    seed_spawner: Option<Arc<dyn SeedSpawner>>,

    max_peers: usize,
    socks_port: Option<u16>,
    max_message_size: usize,
    data_dir: PathBuf,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalIdentity>,
        netdb: Arc<NetDB>,
        seed_spawner: Option<Arc<dyn SeedSpawner>>,
        max_peers: usize,
        socks_port: Option<u16>,
        max_message_size: usize,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: std::sync::RwLock::new(HashMap::new()),
            peer_seen: std::sync::RwLock::new(HashMap::new()),
            public_to_address: std::sync::RwLock::new(HashMap::new()),
            seed_managers: Mutex::new(HashMap::new()),
            local,
            netdb,
            handler: std::sync::RwLock::new(None),
            seed_spawner,
            max_peers,
            socks_port,
            max_message_size,
            data_dir,
        })
    }

    /// Wire up the node-side handler; held weakly to break the cycle.
    pub fn set_handler(&self, handler: Weak<dyn ProtocolHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.handler
            .read()
            .expect("handler lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn count(&self) -> usize {
        self.peers.read().expect("peers lock poisoned").len()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peers lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_peer(&self, address: &Address) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peers lock poisoned")
            .get(address)
            .cloned()
    }

    pub fn is_tracked(&self, address: &Address) -> bool {
        self.peers
            .read()
            .expect("peers lock poisoned")
            .contains_key(address)
    }

    fn touch_seen(&self, address: &Address) {
        self.peer_seen
            .write()
            .expect("seen lock poisoned")
            .insert(*address, monotonic_ns());
    }

    /// Connect to a peer at a direct public address ("host:port"). Reuses
    /// an existing connection to the same address when one is live.
    pub async fn connect_peer_direct(
        self: &Arc<Self>,
        addr: &str,
    ) -> Result<Arc<Peer>, ResolveError> {
        let known = self
            .public_to_address
            .read()
            .expect("public index poisoned")
            .get(addr)
            .copied();
        if let Some(address) = known {
            if let Some(peer) = self.get_peer(&address) {
                return Ok(peer);
            }
        }

        let payload = self.local.handshake_payload().await;
        let peer = Peer::connect(addr, self.socks_port, self.max_message_size, &payload)
            .await
            .map_err(|e| {
                debug!(address = addr, error = %e, "dial failed");
                ResolveError::PeerUnreachable
            })?;

        // the dialer takes the multiplex client role and still serves the
        // peer's inbound streams
        peer.connect_client().await?;
        if let Some(handler) = self.handler() {
            tokio::spawn(listen_stream(peer.clone(), handler));
        }

        // a free verified entry; keep it
        if let Ok(entry) = peer.entry().await {
            if let Err(e) = self.netdb.insert(&entry).await {
                debug!(error = %e, "could not store dialed peer's entry");
            }
        }

        self.set_peer(peer.clone()).await;

        Ok(peer)
    }

    /// Resolve an address, then connect to the entry's public address.
    pub async fn connect_peer(
        self: &Arc<Self>,
        address: &Address,
    ) -> Result<(Arc<Peer>, Entry), ResolveError> {
        let entry = self.resolve(address).await?;

        if entry.address == self.local.address() {
            return Err(ResolveError::SelfConnect);
        }

        if let Some(peer) = self.get_peer(&entry.address) {
            return Ok((peer, entry));
        }

        debug!(address = %entry.address, "connecting");
        let peer = self.connect_peer_direct(&entry.dial_address()).await?;
        Ok((peer, entry))
    }

    /// Resolve an address into an entry. Hopefully we already have it, in
    /// which case it's just loaded from the store; otherwise the closest
    /// known peers are walked, each path bounded by [`RESOLVE_DEPTH`] hops.
    pub async fn resolve(self: &Arc<Self>, address: &Address) -> Result<Entry, ResolveError> {
        debug!(address = %address, "resolving");

        if *address == self.local.address() {
            return Ok(self.local.entry().await);
        }

        if let Some(entry) = self.netdb.query(address).await? {
            return Ok(entry);
        }

        let closest = self.netdb.find_closest(address).await?;

        for candidate in &closest {
            match self.resolve_step(candidate, address, RESOLVE_DEPTH).await {
                Ok(Some(entry)) if entry.address == *address => {
                    self.netdb.insert(&entry).await?;
                    return Ok(entry);
                }
                Ok(_) => continue,
                Err(ResolveError::RecursionLimit) => return Err(ResolveError::RecursionLimit),
                Err(e) => {
                    debug!(via = %candidate.address, error = %e, "resolve path failed");
                    continue;
                }
            }
        }

        Err(ResolveError::AddressUnresolvable)
    }

    /// One step of the iterative walk: ask a peer for the target, then
    /// recurse into whatever closer entries it offers. The depth budget is
    /// per path, so a slow branch cannot starve its siblings.
    fn resolve_step<'a>(
        self: &'a Arc<Self>,
        via: &'a Entry,
        target: &'a Address,
        depth: u32,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Option<Entry>, ResolveError>> + Send + 'a>,
    > {
        Box::pin(async move {
            if depth == 0 {
                return Err(ResolveError::RecursionLimit);
            }

            // peers may hand our own entry back; there is nothing behind it
            if via.address == self.local.address() {
                return Ok(None);
            }

            info!(via = %via.address, target = %target, "querying for resolve");

            let peer = match self.get_peer(&via.address) {
                Some(peer) => peer,
                None => self.connect_peer_direct(&via.dial_address()).await?,
            };

            match peer.query(target).await {
                Ok(entry) => {
                    if entry.address == *target {
                        return Ok(Some(entry));
                    }
                }
                Err(PeerError::Client(crate::client::ClientError::PeerReturnedNo(_))) => {}
                Err(e) => return Err(e.into()),
            }

            let closest = peer.find_closest(target).await?;

            for candidate in &closest {
                match self.resolve_step(candidate, target, depth - 1).await {
                    Ok(Some(entry)) => return Ok(Some(entry)),
                    Ok(None) => continue,
                    Err(ResolveError::RecursionLimit) => {
                        return Err(ResolveError::RecursionLimit)
                    }
                    Err(e) => {
                        debug!(via = %candidate.address, error = %e, "resolve branch failed");
                        continue;
                    }
                }
            }

            Ok(None)
        })
    }

    /// Track a peer: index it, bind its hooks, start its heartbeat and
    /// announce loops, and evict the least recently seen peers while the
    /// map exceeds its bound.
    pub async fn set_peer(self: &Arc<Self>, peer: Arc<Peer>) {
        let address = *peer.address();

        if self.is_tracked(&address) {
            return;
        }

        let entry = match peer.entry().await {
            Ok(entry) => entry,
            Err(e) => {
                error!(peer = %address, error = %e, "peer without an entry, not tracking");
                return;
            }
        };

        peer.bind_hooks(Arc::new(ManagerHooks {
            manager: Arc::downgrade(self),
        }));

        self.public_to_address
            .write()
            .expect("public index poisoned")
            .insert(entry.dial_address(), address);
        self.peers
            .write()
            .expect("peers lock poisoned")
            .insert(address, peer.clone());
        self.touch_seen(&address);

        // clear space for the newcomer: drop the least recently seen peers
        loop {
            let victim = {
                let peers = self.peers.read().expect("peers lock poisoned");
                if peers.len() <= self.max_peers {
                    break;
                }
                let seen = self.peer_seen.read().expect("seen lock poisoned");

                let mut oldest_key = None;
                let mut oldest_value = u64::MAX;
                for (addr, stamp) in seen.iter() {
                    if *stamp < oldest_value && peers.contains_key(addr) {
                        oldest_key = Some(*addr);
                        oldest_value = *stamp;
                    }
                }
                oldest_key
            };

            let Some(victim) = victim else { break };
            info!(removing = %victim, "too many peers connected");
            if let Some(peer) = self.get_peer(&victim) {
                peer.terminate().await;
            }
            self.handle_close_connection(&victim).await;
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(heartbeat_peer(weak.clone(), peer.clone()));
        tokio::spawn(announce_peer(weak, peer));
    }

    /// Forget a peer and signal its seed manager.
    pub async fn handle_close_connection(&self, address: &Address) {
        self.peers
            .write()
            .expect("peers lock poisoned")
            .remove(address);
        self.peer_seen
            .write()
            .expect("seen lock poisoned")
            .remove(address);
        self.public_to_address
            .write()
            .expect("public index poisoned")
            .retain(|_, mapped| mapped != address);

        if let Some(mut sm) = self.seed_managers.lock().await.remove(address) {
            sm.close();
        }
    }

    /// Start tracking a seed worker for an address, if not already.
    pub async fn add_seed_manager(&self, address: Address) -> anyhow::Result<()> {
        let mut managers = self.seed_managers.lock().await;
        if managers.contains_key(&address) {
            return Ok(());
        }

        info!(peer = %address, "loading seed manager");
        let manager = match &self.seed_spawner {
            Some(spawner) => spawner.spawn(address),
            None => SeedManager::inert(address),
        };
        managers.insert(address, manager);
        Ok(())
    }

    /// Read the packed seed file (20-byte addresses, no separator) and
    /// start a seed manager for each. Returns how many were loaded.
    pub async fn load_seeds(&self) -> anyhow::Result<usize> {
        info!("loading seed list");

        let path = self.data_dir.join("seeding.dat");
        let raw = tokio::fs::read(&path).await?;

        let mut loaded = 0;
        for chunk in raw.chunks_exact(ADDRESS_BINARY_SIZE) {
            let address = Address::from_slice(chunk).expect("chunk size is fixed");
            if let Err(e) = self.add_seed_manager(address).await {
                error!(error = %e, "seed manager failed to start");
                continue;
            }
            loaded += 1;
        }

        info!(count = loaded, "finished loading seed list");
        Ok(loaded)
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }
}

// ============================================================================
// Background loops
// ============================================================================

/// Ping the peer every [`HEARTBEAT_FREQUENCY`]; a failed or timed-out ping
/// terminates it.
async fn heartbeat_peer(manager: Weak<PeerManager>, peer: Arc<Peer>) {
    let mut ticker = interval(HEARTBEAT_FREQUENCY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        if !manager.is_tracked(peer.address()) {
            return;
        }

        debug!(peer = %peer.address(), "sending heartbeat");
        // allows for a suddenly slower connection, most requests have a
        // lower timeout
        if let Err(e) = peer.ping(HEARTBEAT_FREQUENCY).await {
            info!(peer = %peer.address(), error = %e, "peer has no heartbeat, terminating");
            peer.terminate().await;
            manager.handle_close_connection(peer.address()).await;
            return;
        }
    }
}

/// Announce our entry to the peer now and then every
/// [`ANNOUNCE_FREQUENCY`]. Failures are retried next tick.
async fn announce_peer(manager: Weak<PeerManager>, peer: Arc<Peer>) {
    let mut ticker = interval(ANNOUNCE_FREQUENCY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        if !manager.is_tracked(peer.address()) {
            return;
        }

        info!(peer = %peer.address(), "announcing to peer");
        if let Err(e) = announce_once(&manager, &peer).await {
            error!(peer = %peer.address(), error = %e, "announce failed");
        }
    }
}

async fn announce_once(manager: &Arc<PeerManager>, peer: &Arc<Peer>) -> Result<(), PeerError> {
    // a node behind a fresh config may not know its own public address yet
    if manager.local.public_address().await.is_empty() {
        debug!("local public address unknown, probing");
        if let Some(ip) = probe_external_ip() {
            manager.local.set_public_address(ip.to_string()).await;
        }
    }

    manager.local.sign_entry().await;
    let entry = manager.local.entry().await;
    peer.announce(&entry).await
}

/// Discover the local routable IP by "connecting" a UDP socket outward and
/// reading the chosen source address. No packet is actually sent.
pub(crate) fn probe_external_ip() -> Option<std::net::IpAddr> {
    let targets = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];
    for target in targets {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if !ip.is_loopback() && !ip.is_unspecified() {
                        return Some(ip);
                    }
                }
            }
        }
    }
    None
}

// ============================================================================
// Hooks
// ============================================================================

/// The capability set bound onto every tracked peer. Holds the manager
/// weakly; a hook firing after shutdown is a no-op.
struct ManagerHooks {
    manager: Weak<PeerManager>,
}

#[async_trait]
impl PeerHooks for ManagerHooks {
    fn update_seen(&self, address: &Address) {
        if let Some(manager) = self.manager.upgrade() {
            manager.touch_seen(address);
        }
    }

    async fn add_seed_manager(&self, address: Address) -> anyhow::Result<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.add_seed_manager(address).await,
            None => Ok(()),
        }
    }

    async fn add_entry(&self, entry: Entry) -> anyhow::Result<()> {
        if let Some(manager) = self.manager.upgrade() {
            manager.netdb.insert(&entry).await?;
        }
        Ok(())
    }

    async fn add_seeding(&self, entry: Entry) -> anyhow::Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };

        // record that we now seed this entry's collection, and re-sign so
        // the seeding list is covered by our signature
        manager.local.add_seeding(entry.address).await;
        manager.local.sign_entry().await;

        let local_address = manager.local.address();
        if let Err(e) = manager.netdb.insert_seed(&entry.address, &local_address).await {
            debug!(error = %e, "seed relation not recorded");
        }
        Ok(())
    }
}
