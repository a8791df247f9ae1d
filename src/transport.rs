//! # Transport: Connections, Handshake and Stream Multiplexing
//!
//! One TCP connection per peer, optionally dialed through a local SOCKS5
//! proxy. Every connection starts with a 4-byte preamble (magic `0x667A`,
//! "zf", then version `0x0000`, both little-endian) followed by a mutual
//! handshake over plain protocol messages. Only then is the socket promoted
//! to a yamux session — the dialer takes the client role, the accepter the
//! server role — from which logical streams are opened and accepted.
//!
//! ## Session Actor
//!
//! The yamux connection wants a single driver, so a [`Session`] spawns a
//! task that owns it. Stream opens arrive over a command channel and
//! inbound streams are handed out through a bounded queue; closing the
//! session tears down the task, which unblocks every open stream with EOF.
//!
//! ## Handshake
//!
//! Both directions verify each other:
//!
//! 1. C writes its `cap` message (capabilities + local entry).
//! 2. S verifies the entry; on failure it writes `no` + reason and aborts.
//! 3. S replies `ok`, then sends its own `cap`.
//! 4. C verifies S's entry.
//!
//! Entry verification includes the address↔public-key binding, so a peer
//! cannot claim an address whose key it does not hold. Errors leave no
//! residue: the connection is simply dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace};

use crate::client::Client;
use crate::entry::{Entry, EntryError};
use crate::messages::{
    Message, MessageCapabilities, MessageHandshake, WireError, PROTO_CAP, PROTO_OK,
};

/// Protocol magic, "zf" little-endian.
pub const PROTO_MAGIC: u16 = 0x667A;
/// Protocol version 0.
pub const PROTO_VERSION: u16 = 0x0000;

/// Read/write deadline applied to the first I/O of a fresh stream.
pub const STREAM_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

/// Any bidirectional byte stream we can run the protocol over.
pub trait AsyncSocket: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncSocket for T {}

pub type BoxedSocket = Box<dyn AsyncSocket>;

/// A logical stream handed out by the multiplexer, adapted to tokio I/O.
pub type SessionStream = Compat<yamux::Stream>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("cannot open stream, no session")]
    NoSession,
    #[error("session closed")]
    Closed,
    #[error("there is already a {0} connected to this socket")]
    RoleConflict(SessionRole),
    #[error("multiplexer error: {0}")]
    Mux(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer rejected handshake: {0}")]
    Rejected(String),
    #[error("unexpected handshake message: {0}")]
    UnexpectedHeader(String),
    #[error("peer entry failed verification: {0}")]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Client => write!(f, "client"),
            SessionRole::Server => write!(f, "server"),
        }
    }
}

/// What a completed handshake tells us about the other end.
#[derive(Clone, Debug)]
pub struct ConnHeader {
    pub entry: Entry,
    pub capabilities: MessageCapabilities,
}

// ============================================================================
// Dialing and preamble
// ============================================================================

/// Dial a peer over plain TCP, or through the local SOCKS5 proxy when a
/// port is given.
pub async fn dial(addr: &str, socks_port: Option<u16>) -> std::io::Result<BoxedSocket> {
    match socks_port {
        Some(port) => {
            let proxy = format!("127.0.0.1:{port}");
            let stream = tokio_socks::tcp::Socks5Stream::connect(proxy.as_str(), addr)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(TcpStream::connect(addr).await?)),
    }
}

pub async fn write_preamble<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_u16_le(PROTO_MAGIC).await?;
    writer.write_u16_le(PROTO_VERSION).await?;
    writer.flush().await
}

pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), WireError> {
    if reader.read_u16_le().await? != PROTO_MAGIC {
        return Err(WireError::BadMagic);
    }
    if reader.read_u16_le().await? != PROTO_VERSION {
        return Err(WireError::BadVersion);
    }
    Ok(())
}

// ============================================================================
// Handshake
// ============================================================================

/// Connecting side of the handshake. Consumes and fills the message codec
/// bound to the raw connection.
pub async fn handshake_initiate(
    client: &mut Client,
    local: &MessageHandshake,
) -> Result<ConnHeader, HandshakeError> {
    client
        .write_message(&Message::with_payload(PROTO_CAP, local)?)
        .await?;

    let reply = client.read_message().await?;
    if reply.is_no() {
        return Err(HandshakeError::Rejected(
            reply.reason().unwrap_or_default(),
        ));
    }
    if !reply.is_ok() {
        return Err(HandshakeError::UnexpectedHeader(reply.header));
    }

    // the server knows who we are now; better check who it is
    let cap = client.read_message().await?;
    if cap.header != PROTO_CAP {
        return Err(HandshakeError::UnexpectedHeader(cap.header));
    }
    let theirs: MessageHandshake = cap.read()?;
    theirs.entry.verify()?;

    debug!(peer = %theirs.entry.address, "handshake complete");

    Ok(ConnHeader {
        entry: theirs.entry,
        capabilities: theirs.capabilities,
    })
}

/// Accepting side of the handshake.
pub async fn handshake_accept(
    client: &mut Client,
    local: &MessageHandshake,
) -> Result<ConnHeader, HandshakeError> {
    let cap = client.read_message().await?;
    if cap.header != PROTO_CAP {
        let _ = client.write_message(&Message::no("expected cap")).await;
        return Err(HandshakeError::UnexpectedHeader(cap.header));
    }

    let theirs: MessageHandshake = cap.read()?;
    if let Err(e) = theirs.entry.verify() {
        let _ = client.write_message(&Message::no(&e.to_string())).await;
        return Err(HandshakeError::Entry(e));
    }

    client.write_message(&Message::new(PROTO_OK)).await?;
    client
        .write_message(&Message::with_payload(PROTO_CAP, local)?)
        .await?;

    debug!(peer = %theirs.entry.address, "handshake accepted");

    Ok(ConnHeader {
        entry: theirs.entry,
        capabilities: theirs.capabilities,
    })
}

// ============================================================================
// Prefixed socket
// ============================================================================

/// A socket with a few already-read bytes pushed back in front. The codec
/// may have buffered past the final handshake message; those bytes belong
/// to the multiplexer.
pub struct PrefixedSocket {
    prefix: Vec<u8>,
    offset: usize,
    inner: BoxedSocket,
}

impl PrefixedSocket {
    pub fn new(prefix: Vec<u8>, inner: BoxedSocket) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedSocket {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let n = (this.prefix.len() - this.offset).min(buf.remaining());
            buf.put_slice(&this.prefix[this.offset..this.offset + n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedSocket {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Session actor
// ============================================================================

type OpenReply = oneshot::Sender<Result<SessionStream, SessionError>>;

enum SessionCommand {
    Open(OpenReply),
    Close(oneshot::Sender<()>),
}

/// How many accepted-but-unclaimed inbound streams may queue before new
/// ones are reset.
const INBOUND_STREAM_QUEUE: usize = 64;

/// A multiplexer bound to one connection, from which logical streams are
/// opened. Cheap handle; the connection itself lives in the driver task.
pub struct Session {
    commands: mpsc::Sender<SessionCommand>,
    inbound: Mutex<mpsc::Receiver<SessionStream>>,
    role: SessionRole,
}

impl Session {
    pub fn new(socket: BoxedSocket, role: SessionRole) -> Self {
        let mode = match role {
            SessionRole::Client => yamux::Mode::Client,
            SessionRole::Server => yamux::Mode::Server,
        };
        let connection = yamux::Connection::new(socket.compat(), yamux::Config::default(), mode);

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_STREAM_QUEUE);
        tokio::spawn(drive(connection, cmd_rx, in_tx));

        Self {
            commands: cmd_tx,
            inbound: Mutex::new(in_rx),
            role,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Open a new logical stream.
    pub async fn open_stream(&self) -> Result<SessionStream, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Open(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Next inbound logical stream; `None` once the session is gone.
    pub async fn accept_stream(&self) -> Option<SessionStream> {
        self.inbound.lock().await.recv().await
    }

    /// Close the session and its socket, waiting for the driver to finish.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn drive(
    mut connection: yamux::Connection<Compat<BoxedSocket>>,
    mut commands: mpsc::Receiver<SessionCommand>,
    inbound: mpsc::Sender<SessionStream>,
) {
    let mut pending_open: VecDeque<OpenReply> = VecDeque::new();
    let mut close_replies: Vec<oneshot::Sender<()>> = Vec::new();
    let mut closing = false;
    let mut commands_open = true;

    futures::future::poll_fn::<(), _>(|cx| {
        while commands_open {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(SessionCommand::Open(reply))) => pending_open.push_back(reply),
                Poll::Ready(Some(SessionCommand::Close(done))) => {
                    closing = true;
                    close_replies.push(done);
                }
                Poll::Ready(None) => {
                    // every handle dropped
                    commands_open = false;
                    closing = true;
                }
                Poll::Pending => break,
            }
        }

        if closing {
            for reply in pending_open.drain(..) {
                let _ = reply.send(Err(SessionError::Closed));
            }
            return match connection.poll_close(cx) {
                Poll::Ready(result) => {
                    if let Err(e) = result {
                        trace!(error = %e, "session close");
                    }
                    commands.close();
                    for done in close_replies.drain(..) {
                        let _ = done.send(());
                    }
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        loop {
            let mut progressed = false;

            if !pending_open.is_empty() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        if let Some(reply) = pending_open.pop_front() {
                            let _ = reply.send(Ok(stream.compat()));
                        }
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => {
                        if let Some(reply) = pending_open.pop_front() {
                            let _ = reply.send(Err(SessionError::Mux(e.to_string())));
                        }
                        progressed = true;
                    }
                    Poll::Pending => {}
                }
            }

            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound.try_send(stream.compat()).is_err() {
                        debug!("dropping inbound stream, accept queue full");
                    }
                    progressed = true;
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!(error = %e, "session failed");
                    commands.close();
                    for reply in pending_open.drain(..) {
                        let _ = reply.send(Err(SessionError::Mux(e.to_string())));
                    }
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    commands.close();
                    for reply in pending_open.drain(..) {
                        let _ = reply.send(Err(SessionError::Closed));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    })
    .await;
}

// ============================================================================
// Stream manager
// ============================================================================

/// Owns the one connection to a peer: the handshaken socket before the
/// session exists, the session afterwards, and the registry of inbound
/// streams currently being served.
pub struct StreamManager {
    socks_port: Option<u16>,
    max_message_size: usize,

    // handshaken raw connection, waiting to be promoted to a session
    conn: Mutex<Option<Client>>,
    header: RwLock<Option<ConnHeader>>,
    session: RwLock<Option<Arc<Session>>>,

    next_stream_id: AtomicU64,
    streams: std::sync::Mutex<HashMap<u64, ()>>,
}

impl StreamManager {
    pub fn new(socks_port: Option<u16>, max_message_size: usize) -> Self {
        Self {
            socks_port,
            max_message_size,
            conn: Mutex::new(None),
            header: RwLock::new(None),
            session: RwLock::new(None),
            next_stream_id: AtomicU64::new(0),
            streams: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn connection_header(&self) -> Option<ConnHeader> {
        self.header.read().await.clone()
    }

    /// Dial a peer (TCP, or SOCKS5 when enabled), write the preamble and
    /// run the connecting side of the handshake. Idempotent: an already
    /// handshaken connection is reused.
    pub async fn open_tcp(
        &self,
        addr: &str,
        local: &MessageHandshake,
    ) -> Result<ConnHeader, HandshakeError> {
        if let Some(header) = self.connection_header().await {
            return Ok(header);
        }

        let mut socket = dial(addr, self.socks_port).await.map_err(WireError::Io)?;
        write_preamble(&mut socket).await.map_err(WireError::Io)?;

        let mut client = Client::new(socket, self.max_message_size);
        let header = handshake_initiate(&mut client, local).await?;

        *self.conn.lock().await = Some(client);
        *self.header.write().await = Some(header.clone());

        Ok(header)
    }

    /// Install an already-accepted, handshaken connection (server side).
    pub async fn set_connection(&self, client: Client, header: ConnHeader) {
        *self.conn.lock().await = Some(client);
        *self.header.write().await = Some(header);
    }

    async fn connect_with_role(&self, role: SessionRole) -> Result<Arc<Session>, SessionError> {
        {
            let session = self.session.read().await;
            if let Some(session) = session.as_ref() {
                if session.role() == role {
                    return Ok(session.clone());
                }
                return Err(SessionError::RoleConflict(session.role()));
            }
        }

        let client = self
            .conn
            .lock()
            .await
            .take()
            .ok_or(SessionError::NoSession)?;

        // bytes the codec read past the handshake belong to the session
        let (socket, leftover) = client.into_parts();
        let socket: BoxedSocket = Box::new(PrefixedSocket::new(leftover, socket));

        let session = Arc::new(Session::new(socket, role));
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Promote the connection to a session in the client role (dialer).
    pub async fn connect_client(&self) -> Result<Arc<Session>, SessionError> {
        self.connect_with_role(SessionRole::Client).await
    }

    /// Promote the connection to a session in the server role (accepter).
    pub async fn connect_server(&self) -> Result<Arc<Session>, SessionError> {
        self.connect_with_role(SessionRole::Server).await
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    /// Open a new logical stream and wrap it for the message protocol.
    pub async fn open_stream(&self) -> Result<Client, SessionError> {
        let session = self.session().await.ok_or(SessionError::NoSession)?;
        let stream = session.open_stream().await?;
        Ok(Client::new(Box::new(stream), self.max_message_size))
    }

    /// Accept the next inbound logical stream, registering it. Returns the
    /// registry id alongside the wrapped stream.
    pub async fn accept_stream(&self) -> Option<(u64, Client)> {
        let session = self.session().await?;
        let stream = session.accept_stream().await?;
        let id = self.add_stream();
        Some((id, Client::new(Box::new(stream), self.max_message_size)))
    }

    pub fn add_stream(&self) -> u64 {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().expect("stream registry poisoned").insert(id, ());
        id
    }

    pub fn remove_stream(&self, id: u64) {
        self.streams.lock().expect("stream registry poisoned").remove(&id);
    }

    pub fn has_stream(&self, id: u64) -> bool {
        self.streams.lock().expect("stream registry poisoned").contains_key(&id)
    }

    /// Number of inbound streams currently being served.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("stream registry poisoned").len()
    }

    /// Close session and socket.
    pub async fn close(&self) {
        if let Some(session) = self.session.write().await.take() {
            session.close().await;
        }
        if let Some(client) = self.conn.lock().await.take() {
            drop(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn preamble_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_preamble(&mut a).await.unwrap();
        read_preamble(&mut b).await.unwrap();
    }

    #[tokio::test]
    async fn preamble_rejects_wrong_magic() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x00, 0x00, 0x00, 0x00]).await.unwrap();
        assert!(matches!(
            read_preamble(&mut b).await,
            Err(WireError::BadMagic)
        ));
    }

    #[tokio::test]
    async fn preamble_rejects_wrong_version() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x7a, 0x66, 0xff, 0x00]).await.unwrap();
        assert!(matches!(
            read_preamble(&mut b).await,
            Err(WireError::BadVersion)
        ));
    }

    #[tokio::test]
    async fn prefixed_socket_serves_prefix_first() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(b" world").await.unwrap();
        drop(b);

        let mut socket = PrefixedSocket::new(b"hello".to_vec(), Box::new(a));
        let mut out = String::new();
        socket.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn session_streams_carry_data_both_ways() {
        let (a, b) = tokio::io::duplex(64 * 1024);

        let client = Session::new(Box::new(a), SessionRole::Client);
        let server = Session::new(Box::new(b), SessionRole::Server);

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"ping over stream").await.unwrap();
        outbound.flush().await.unwrap();

        let mut accepted = server.accept_stream().await.expect("inbound stream");
        let mut buf = [0u8; 16];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over stream");

        accepted.write_all(b"pong").await.unwrap();
        accepted.flush().await.unwrap();

        let mut reply = [0u8; 4];
        outbound.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn closing_a_session_unblocks_the_peer() {
        let (a, b) = tokio::io::duplex(64 * 1024);

        let client = Session::new(Box::new(a), SessionRole::Client);
        let server = Session::new(Box::new(b), SessionRole::Server);

        let _stream = client.open_stream().await.unwrap();
        client.close().await;
        assert!(client.is_closed());

        // server sees the end of the inbound stream queue eventually
        let accepted = server.accept_stream().await;
        if let Some(mut stream) = accepted {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
            assert!(buf.is_empty());
        }
        assert!(server.accept_stream().await.is_none());
    }

    #[tokio::test]
    async fn stream_registry_counts_open_streams() {
        let sm = StreamManager::new(None, crate::messages::MAX_MESSAGE_SIZE);
        assert_eq!(sm.stream_count(), 0);

        let id = sm.add_stream();
        assert!(sm.has_stream(id));
        assert_eq!(sm.stream_count(), 1);

        sm.remove_stream(id);
        assert_eq!(sm.stream_count(), 0);
    }
}
