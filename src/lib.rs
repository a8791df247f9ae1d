//! # Zif — Peer-to-Peer Content Discovery Core
//!
//! The networking core of the Zif network. Each node publishes a signed
//! directory [`Entry`] identifying itself, maintains a Kademlia-style DHT
//! keyed by 160-bit addresses, and speaks a msgpack request/response
//! protocol over multiplexed TCP (optionally through a SOCKS5 tunnel) so
//! peers can resolve addresses, announce themselves, fetch collections and
//! posts, and register seed relationships.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, 20-byte addresses, XOR metric |
//! | `entry` | Signed directory entries and their verification gate |
//! | `messages` | Wire envelope, payload schemas, bounded msgpack codec |
//! | `limiter` | Token-bucket rate limiting |
//! | `netdb` | k-bucket routing table + durable entry store |
//! | `data` | Posts, pieces, collections, the gzip piece stream |
//! | `transport` | Dialing, preamble, handshake, yamux sessions |
//! | `client` | Request issuance over logical streams |
//! | `server` | Accept loops and message dispatch |
//! | `peer` | Live peer handles with typed operations |
//! | `peer_manager` | Resolver, bounded peer map, lifecycle loops |
//! | `node` | The local node tying everything together |
//! | `config` | Daemon configuration surface |
//!
//! ## Trust Model
//!
//! The transport is cleartext; authenticity comes from per-entry Ed25519
//! signatures and from the fact that a node's address is derived from its
//! public key. Every received entry passes the verification gate before it
//! is used or stored, and both handshake directions check the address
//! against the presented key.

pub mod client;
pub mod config;
pub mod data;
pub mod entry;
pub mod identity;
pub mod limiter;
pub mod messages;
pub mod netdb;
pub mod node;
pub mod peer;
pub mod peer_manager;
pub mod server;
pub mod transport;

pub use client::{Client, ClientError};
pub use config::Config;
pub use data::{Collection, EmptyPostStore, Piece, Post, PostStore};
pub use entry::{Entry, EntryError};
pub use identity::{Address, Keypair};
pub use messages::{Message, MessageCapabilities, MAX_MESSAGE_SIZE};
pub use netdb::{NetDB, NetDbError, RoutingTable, BUCKET_SIZE};
pub use node::{LocalIdentity, LocalNode};
pub use peer::{Peer, PeerError, PeerHooks};
pub use peer_manager::{PeerManager, ResolveError, SeedManager, SeedSpawner};
pub use server::{ProtocolHandler, Server};
pub use transport::{ConnHeader, Session, SessionError, StreamManager};
