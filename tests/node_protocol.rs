//! Integration tests for the protocol core.
//!
//! These spin up real nodes on loopback TCP and exercise handshake, DHT
//! queries, announces, bootstrap, iterative resolution, LRU peer eviction
//! and piece streaming end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use zif::client::ClientError;
use zif::data::{EmptyPostStore, Post, PostStore};
use zif::entry::Entry;
use zif::identity::{Address, Keypair};
use zif::node::LocalNode;
use zif::peer_manager::ResolveError;
use zif::Config;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    node: Arc<LocalNode>,
    addr: String,
    // the node's storage lives here; dropping it deletes the files
    _dir: tempfile::TempDir,
}

async fn spawn_node_with(
    max_peers: usize,
    posts: Arc<dyn PostStore>,
) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.bind.zif = "127.0.0.1:0".into();
    config.socks.enabled = false;
    config.net.max_peers = max_peers;
    config.node.name = "tester".into();
    config.node.desc = "integration test node".into();
    config.node.public_address = "127.0.0.1".into();

    let node = LocalNode::open(config, Keypair::generate(), posts)
        .await
        .expect("node open");
    let (addr, _accept) = node.listen("127.0.0.1:0").await.expect("listen");

    TestNode {
        node,
        addr: addr.to_string(),
        _dir: dir,
    }
}

async fn spawn_node() -> TestNode {
    spawn_node_with(100, Arc::new(EmptyPostStore)).await
}

/// A third-party entry that exists only as a signed record, not as a
/// reachable node.
fn fabricated_entry(name: &str) -> Entry {
    let kp = Keypair::generate();
    let mut entry = kp.new_entry(name, "a fabricated node");
    entry.public_address = "203.0.113.200".into();
    entry.port = 4444;
    kp.sign_entry(&mut entry);
    entry
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn handshake_then_query_returns_the_signed_entry() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    let peer = timeout(TEST_TIMEOUT, b.node.peer_manager().connect_peer_direct(&a.addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    assert_eq!(*peer.address(), a.node.address());

    // querying the peer for its own address yields its signed entry
    let entry = timeout(TEST_TIMEOUT, peer.query(&a.node.address()))
        .await
        .expect("query timed out")
        .expect("query failed");
    assert_eq!(entry.address, a.node.address());
    assert_eq!(entry.verify(), Ok(()));

    // the dial left A's verified entry in B's NetDB
    let stored = b
        .node
        .netdb()
        .query(&a.node.address())
        .await
        .expect("netdb query")
        .expect("entry stored");
    assert_eq!(stored.address, a.node.address());
}

#[tokio::test]
async fn ping_answers_pong() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    let peer = b
        .node
        .peer_manager()
        .connect_peer_direct(&a.addr)
        .await
        .expect("connect failed");

    let rtt = timeout(TEST_TIMEOUT, peer.ping(Duration::from_secs(5)))
        .await
        .expect("ping timed out")
        .expect("ping failed");
    assert!(rtt < Duration::from_secs(5));
}

#[tokio::test]
async fn announce_stores_valid_entries_and_rejects_tampered_ones() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    let peer = b
        .node
        .peer_manager()
        .connect_peer_direct(&a.addr)
        .await
        .expect("connect failed");

    // a valid third-party entry is accepted and stored
    let valid = fabricated_entry("valid");
    let mut stream = peer.open_stream().await.expect("open stream");
    stream.announce(&valid).await.expect("announce failed");
    stream.close().await;

    let stored = a
        .node
        .netdb()
        .query(&valid.address)
        .await
        .expect("netdb query")
        .expect("announced entry stored");
    assert_eq!(stored.name, "valid");

    // an entry whose signature covers different bytes is refused
    let mut tampered = fabricated_entry("original");
    tampered.name = "changed".into();

    let mut stream = peer.open_stream().await.expect("open stream");
    let err = stream.announce(&tampered).await.unwrap_err();
    stream.close().await;
    assert!(matches!(err, ClientError::PeerReturnedNo(_)));

    // and the store is unchanged
    assert!(a
        .node
        .netdb()
        .query(&tampered.address)
        .await
        .expect("netdb query")
        .is_none());
}

#[tokio::test]
async fn bootstrap_learns_the_peers_the_other_side_knows() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    // A knows three fabricated nodes
    let known: Vec<Entry> = (0..3).map(|i| fabricated_entry(&format!("known{i}"))).collect();
    for entry in &known {
        a.node.netdb().insert(entry).await.expect("seed insert");
    }

    let learned = timeout(TEST_TIMEOUT, b.node.bootstrap(&a.addr))
        .await
        .expect("bootstrap timed out")
        .expect("bootstrap failed");
    assert!(learned >= 3, "expected at least the fabricated peers, got {learned}");

    for entry in &known {
        assert!(
            b.node.netdb().query(&entry.address).await.unwrap().is_some(),
            "bootstrap should have stored {}",
            entry.name
        );
    }
    // the bootstrap peer itself is stored too
    assert!(b
        .node
        .netdb()
        .query(&a.node.address())
        .await
        .unwrap()
        .is_some());

    // and find_closest over what we learned is ordered by distance
    let closest = b.node.netdb().find_closest(&b.node.address()).await.unwrap();
    assert!(!closest.is_empty());
    for pair in closest.windows(2) {
        let target = b.node.address();
        assert!(pair[0].address.xor(&target) <= pair[1].address.xor(&target));
    }
}

#[tokio::test]
async fn resolve_walks_the_network_iteratively() {
    // topology: us -> relay -> holder, with the target entry only on holder
    let holder = spawn_node().await;
    let relay = spawn_node().await;
    let us = spawn_node().await;

    let target = fabricated_entry("target");
    holder
        .node
        .netdb()
        .insert(&target)
        .await
        .expect("holder insert");

    // relay knows the holder, we know only the relay
    relay
        .node
        .netdb()
        .insert(&holder.node.entry().await)
        .await
        .expect("relay insert");
    us.node
        .netdb()
        .insert(&relay.node.entry().await)
        .await
        .expect("us insert");

    let resolved = timeout(
        TEST_TIMEOUT,
        us.node.peer_manager().resolve(&target.address),
    )
    .await
    .expect("resolve timed out")
    .expect("resolve failed");

    assert_eq!(resolved.address, target.address);
    assert_eq!(resolved.name, "target");

    // the resolved entry was inserted locally along the way
    assert!(us
        .node
        .netdb()
        .query(&target.address)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn resolving_nowhere_reports_unresolvable() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    // connected, but nobody holds the target
    b.node
        .peer_manager()
        .connect_peer_direct(&a.addr)
        .await
        .expect("connect failed");

    let missing = Keypair::generate().address();
    let err = timeout(TEST_TIMEOUT, b.node.peer_manager().resolve(&missing))
        .await
        .expect("resolve timed out")
        .unwrap_err();
    assert!(matches!(err, ResolveError::AddressUnresolvable));
}

#[tokio::test]
async fn excess_peers_are_evicted_least_recently_seen_first() {
    let hub = spawn_node_with(2, Arc::new(EmptyPostStore)).await;

    let p1 = spawn_node().await;
    let p2 = spawn_node().await;
    let p3 = spawn_node().await;

    p1.node
        .peer_manager()
        .connect_peer_direct(&hub.addr)
        .await
        .expect("p1 connect");
    sleep(Duration::from_millis(300)).await;

    p2.node
        .peer_manager()
        .connect_peer_direct(&hub.addr)
        .await
        .expect("p2 connect");
    sleep(Duration::from_millis(300)).await;

    p3.node
        .peer_manager()
        .connect_peer_direct(&hub.addr)
        .await
        .expect("p3 connect");

    let hub_peers = hub.node.peer_manager().clone();
    wait_until("the newest peer to be tracked and the map back at its bound", || {
        hub_peers.count() == 2 && hub_peers.get_peer(&p3.node.address()).is_some()
    })
    .await;

    assert!(
        hub_peers.get_peer(&p1.node.address()).is_none(),
        "oldest peer should have been evicted"
    );
    assert!(hub_peers.get_peer(&p2.node.address()).is_some());
}

struct FixedPosts(Vec<Post>);

#[async_trait]
impl PostStore for FixedPosts {
    async fn search(&self, _query: &str, _page: i64) -> anyhow::Result<Vec<Post>> {
        Ok(self.0.clone())
    }

    async fn query_recent(&self, _page: i64) -> anyhow::Result<Vec<Post>> {
        Ok(self.0.clone())
    }

    async fn query_popular(&self, _page: i64) -> anyhow::Result<Vec<Post>> {
        Ok(self.0.clone())
    }

    async fn piece_posts(
        &self,
        _address: &Address,
        _since: i64,
        _length: i64,
    ) -> anyhow::Result<Option<mpsc::Receiver<Post>>> {
        let (tx, rx) = mpsc::channel(16);
        let posts = self.0.clone();
        tokio::spawn(async move {
            for post in posts {
                if tx.send(post).await.is_err() {
                    return;
                }
            }
        });
        Ok(Some(rx))
    }

    async fn post_count(&self, _address: &Address) -> anyhow::Result<i64> {
        Ok(self.0.len() as i64)
    }
}

fn sample_posts() -> Vec<Post> {
    (0..3)
        .map(|i| Post {
            id: i,
            info_hash: format!("infohash{i}"),
            title: format!("post number {i}"),
            size: 100 + i,
            seeders: 4,
            ..Post::default()
        })
        .collect()
}

#[tokio::test]
async fn recent_posts_travel_as_an_enveloped_reply() {
    let server = spawn_node_with(100, Arc::new(FixedPosts(sample_posts()))).await;
    let client = spawn_node().await;

    let peer = client
        .node
        .peer_manager()
        .connect_peer_direct(&server.addr)
        .await
        .expect("connect failed");

    let posts = timeout(TEST_TIMEOUT, peer.recent(0))
        .await
        .expect("recent timed out")
        .expect("recent failed");
    assert_eq!(posts, sample_posts());
}

#[tokio::test]
async fn piece_stream_ends_cleanly_at_the_sentinel() {
    let server = spawn_node_with(100, Arc::new(FixedPosts(sample_posts()))).await;
    let client = spawn_node().await;

    let peer = client
        .node
        .peer_manager()
        .connect_peer_direct(&server.addr)
        .await
        .expect("connect failed");

    let mut rx = timeout(
        TEST_TIMEOUT,
        peer.pieces(&server.node.address(), 0, 1),
    )
    .await
    .expect("pieces timed out")
    .expect("pieces failed");

    let piece = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("first piece timed out")
        .expect("piece stream was empty");
    assert_eq!(piece.posts, sample_posts());

    // the sentinel closes the sequence; nothing follows
    assert!(timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("stream close timed out")
        .is_none());
}
