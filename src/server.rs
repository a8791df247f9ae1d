//! # Server: Accepting Connections and Dispatching Requests
//!
//! The TCP accept loop checks the 4-byte preamble (wrong magic or version
//! closes the socket), runs the accepting side of the handshake, and hands
//! the verified connection to the [`ProtocolHandler`] to become a peer.
//!
//! Each peer then gets a stream accept loop, rate-limited to 4 new streams
//! per second with a burst of 3 — excess streams are dropped, not queued.
//! Every accepted stream is read as a sequence of messages; each message is
//! stamped with the peer's verified address and dispatched by header. One
//! request per stream is the convention; the stream is closed once the
//! handler returns, which for piece requests is only after the whole gzip
//! body has been written.
//!
//! Handler failures are logged and answered with `no` + reason. They never
//! take the server down.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::client::Client;
use crate::identity::Address;
use crate::limiter::Limiter;
use crate::messages::{Message, MessageHandshake, WireError, PROTO_ADD_PEER_REQUEST, PROTO_DHT_ANNOUNCE, PROTO_DHT_FIND_CLOSEST, PROTO_DHT_QUERY, PROTO_HASH_LIST_REQUEST, PROTO_PIECE_REQUEST, PROTO_PING, PROTO_PONG, PROTO_POPULAR, PROTO_RECENT, PROTO_SEARCH, PROTO_TERMINATE};
use crate::peer::Peer;
use crate::transport::{handshake_accept, read_preamble, ConnHeader};

/// Time a connecting peer gets to complete preamble + handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound stream pacing: 4 per second, bursting to 3.
const STREAM_ACCEPT_RATE: Duration = Duration::from_millis(250);
const STREAM_ACCEPT_BURST: usize = 3;

/// The operations a node exposes to the network. The server owns none of
/// the state behind these; it decodes, stamps and routes.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// The capabilities + current signed entry presented in handshakes.
    async fn handshake_payload(&self) -> MessageHandshake;

    /// A connection completed its handshake; wrap it into a peer (server
    /// session role) and start tracking it.
    async fn handle_handshake(
        &self,
        client: Client,
        header: ConnHeader,
    ) -> anyhow::Result<Arc<Peer>>;

    /// A tracked peer's connection is gone.
    async fn handle_close_connection(&self, address: &Address);

    async fn handle_query(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_find_closest(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_announce(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_search(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_recent(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_popular(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_hash_list(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_piece(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
    async fn handle_add_peer(&self, msg: &Message, client: &mut Client) -> anyhow::Result<()>;
}

pub struct Server {
    handler: Arc<dyn ProtocolHandler>,
    max_message_size: usize,
}

impl Server {
    pub fn new(handler: Arc<dyn ProtocolHandler>, max_message_size: usize) -> Self {
        Self {
            handler,
            max_message_size,
        }
    }

    /// Bind and serve. Returns the bound address and the accept-loop task.
    pub async fn listen(
        self,
        addr: &str,
    ) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, "listening");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, remote)) => {
                        trace!(remote = %remote, "new TCP connection");
                        let handler = self.handler.clone();
                        let max = self.max_message_size;
                        tokio::spawn(async move {
                            if let Err(e) = accept_connection(socket, handler, max).await {
                                // handshake failures close silently after logging
                                debug!(remote = %remote, error = %e, "connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok((local_addr, handle))
    }
}

async fn accept_connection(
    mut socket: TcpStream,
    handler: Arc<dyn ProtocolHandler>,
    max_message_size: usize,
) -> anyhow::Result<()> {
    timeout(HANDSHAKE_TIMEOUT, read_preamble(&mut socket))
        .await
        .map_err(|_| WireError::ConnectionClosed)??;

    let mut client = Client::new(Box::new(socket), max_message_size);
    let local = handler.handshake_payload().await;
    let header = timeout(HANDSHAKE_TIMEOUT, handshake_accept(&mut client, &local))
        .await
        .map_err(|_| WireError::ConnectionClosed)??;

    let peer = handler.handle_handshake(client, header).await?;
    tokio::spawn(listen_stream(peer, handler));
    Ok(())
}

/// Accept logical streams from a peer's session until it goes away. Each
/// stream is served concurrently; excess streams beyond the accept rate
/// are dropped.
pub async fn listen_stream(peer: Arc<Peer>, handler: Arc<dyn ProtocolHandler>) {
    let limiter = Limiter::new(STREAM_ACCEPT_RATE, STREAM_ACCEPT_BURST, true);

    while let Some((id, client)) = peer.accept_stream().await {
        if !limiter.try_wait() {
            debug!(peer = %peer.address(), "dropping stream, accept rate exceeded");
            peer.remove_stream(id);
            client.close().await;
            continue;
        }

        trace!(peer = %peer.address(), total = peer.streams().stream_count(), "accepted stream");
        peer.update_seen();

        let peer = peer.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            handle_stream(&peer, &*handler, id, client).await;
        });
    }

    limiter.stop();
    debug!(peer = %peer.address(), "peer closed connection");
    handler.handle_close_connection(peer.address()).await;
}

/// Serve one logical stream: read a message, stamp its origin, route it.
/// The stream closes when the handler is done with it.
async fn handle_stream(peer: &Peer, handler: &dyn ProtocolHandler, id: u64, mut client: Client) {
    loop {
        let mut msg = match client.read_message().await {
            Ok(msg) => msg,
            Err(WireError::ConnectionClosed) => break,
            Err(e) => {
                debug!(peer = %peer.address(), error = %e, "stream read failed");
                break;
            }
        };
        msg.from = Some(*peer.address());

        if msg.header == PROTO_TERMINATE {
            break;
        }

        route_message(&msg, handler, &mut client).await;

        // one request, one stream; piece bodies finished inside the handler
        break;
    }

    peer.remove_stream(id);
    client.close().await;
}

async fn route_message(msg: &Message, handler: &dyn ProtocolHandler, client: &mut Client) {
    let result = match msg.header.as_str() {
        PROTO_PING => client
            .write_message(&Message::new(PROTO_PONG))
            .await
            .map_err(anyhow::Error::from),
        PROTO_DHT_ANNOUNCE => handler.handle_announce(msg, client).await,
        PROTO_DHT_QUERY => handler.handle_query(msg, client).await,
        PROTO_DHT_FIND_CLOSEST => handler.handle_find_closest(msg, client).await,
        PROTO_SEARCH => handler.handle_search(msg, client).await,
        PROTO_RECENT => handler.handle_recent(msg, client).await,
        PROTO_POPULAR => handler.handle_popular(msg, client).await,
        PROTO_HASH_LIST_REQUEST => handler.handle_hash_list(msg, client).await,
        PROTO_PIECE_REQUEST => handler.handle_piece(msg, client).await,
        PROTO_ADD_PEER_REQUEST => handler.handle_add_peer(msg, client).await,
        other => {
            warn!(header = other, "unknown message type");
            let _ = client.write_no("unknown message type").await;
            return;
        }
    };

    if let Err(e) = result {
        // log and tell the client; the server stays up
        warn!(header = %msg.header, error = %e, "handler failed");
        let _ = client.write_no(&e.to_string()).await;
    }
}
