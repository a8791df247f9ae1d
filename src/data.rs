//! # Posts, Pieces and Collections
//!
//! The post database itself lives outside this crate, behind the
//! [`PostStore`] trait. What lives here is everything the protocol needs to
//! move posts between nodes:
//!
//! - [`Post`]: one content record as exchanged on the wire
//! - [`Piece`]: a batch of [`PIECE_SIZE`] posts with a content hash
//! - [`Collection`]: the hash list a node publishes for its pieces, whose
//!   root hash is signed into the owner's entry
//! - the gzip piece-stream codec: after a `piece.request`, posts travel as a
//!   gzip-compressed, `|`-delimited record stream directly on the logical
//!   stream, terminated by a sentinel post with `id == -1`
//!
//! Free-text fields are stripped of the delimiter before encoding, keeping
//! the legacy framing unambiguous without changing the wire format.

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::trace;

use crate::identity::Address;

/// Number of posts batched into one piece.
pub const PIECE_SIZE: usize = 1000;

/// Buffered pieces between the stream reader task and the consumer.
pub const PIECE_CHANNEL_BUFFER: usize = 100;

/// One post record as exchanged between peers.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: i64,
    pub info_hash: String,
    pub title: String,
    pub size: i64,
    pub file_count: i64,
    pub seeders: i64,
    pub leechers: i64,
    pub upload_date: i64,
    pub tags: String,
    pub meta: String,
}

impl Post {
    /// The sentinel that terminates a piece stream.
    pub fn sentinel() -> Self {
        Post {
            id: -1,
            ..Post::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == -1
    }

    /// Delimited wire form: every field followed by `|`, in fixed order.
    fn encode_delimited(&self) -> String {
        let field = |s: &str| s.replace('|', "");
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|",
            self.id,
            field(&self.info_hash),
            field(&self.title),
            self.size,
            self.file_count,
            self.seeders,
            self.leechers,
            self.upload_date,
            field(&self.tags),
            field(&self.meta),
        )
    }
}

/// A batch of posts transferred together, hashed for the collection list.
#[derive(Clone, Debug, Default)]
pub struct Piece {
    pub posts: Vec<Post>,
}

impl Piece {
    pub fn add(&mut self, post: Post) {
        self.posts.push(post);
    }

    /// Content hash of the piece, over the delimited form of its posts.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for post in &self.posts {
            hasher.update(post.encode_delimited().as_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

/// The hash list covering a node's pieces. Its root hash is what the owner
/// signs into `collection_hash`.
#[derive(Clone, Debug, Default)]
pub struct Collection {
    pub hash_list: Vec<u8>,
}

impl Collection {
    pub fn from_hash_list(hash_list: Vec<u8>) -> Self {
        Self { hash_list }
    }

    /// Number of 32-byte piece hashes in the list.
    pub fn len(&self) -> usize {
        self.hash_list.len() / 32
    }

    pub fn is_empty(&self) -> bool {
        self.hash_list.is_empty()
    }

    pub fn add_piece(&mut self, piece: &Piece) {
        self.hash_list.extend_from_slice(&piece.hash());
    }

    /// The root hash signed into the owner's entry.
    pub fn root_hash(&self) -> [u8; 32] {
        *blake3::hash(&self.hash_list).as_bytes()
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        self.hash_list.get(index * 32..index * 32 + 32)
    }

    /// Persist as raw concatenated hashes (`collection.dat`).
    pub async fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &self.hash_list).await
    }

    pub async fn load(path: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self {
            hash_list: tokio::fs::read(path).await?,
        })
    }
}

/// Interface to the local post database. The database, its full-text index
/// and pagination live outside the networking core.
#[async_trait]
pub trait PostStore: Send + Sync + 'static {
    async fn search(&self, query: &str, page: i64) -> anyhow::Result<Vec<Post>>;

    async fn query_recent(&self, page: i64) -> anyhow::Result<Vec<Post>>;

    async fn query_popular(&self, page: i64) -> anyhow::Result<Vec<Post>>;

    /// Stream the posts of `length` pieces starting at piece `since` for the
    /// given collection. `None` when that collection is not stored here.
    async fn piece_posts(
        &self,
        address: &Address,
        since: i64,
        length: i64,
    ) -> anyhow::Result<Option<mpsc::Receiver<Post>>>;

    /// Post count of a stored collection, 0 when absent.
    async fn post_count(&self, address: &Address) -> anyhow::Result<i64>;
}

/// A post store with nothing in it. Useful for pure-routing nodes and tests.
pub struct EmptyPostStore;

#[async_trait]
impl PostStore for EmptyPostStore {
    async fn search(&self, _query: &str, _page: i64) -> anyhow::Result<Vec<Post>> {
        Ok(Vec::new())
    }

    async fn query_recent(&self, _page: i64) -> anyhow::Result<Vec<Post>> {
        Ok(Vec::new())
    }

    async fn query_popular(&self, _page: i64) -> anyhow::Result<Vec<Post>> {
        Ok(Vec::new())
    }

    async fn piece_posts(
        &self,
        _address: &Address,
        _since: i64,
        _length: i64,
    ) -> anyhow::Result<Option<mpsc::Receiver<Post>>> {
        Ok(None)
    }

    async fn post_count(&self, _address: &Address) -> anyhow::Result<i64> {
        Ok(0)
    }
}

/// Write a post stream: gzip of delimited posts, terminated by the sentinel.
/// The writer is shut down so the gzip trailer is flushed.
pub async fn write_piece_stream<W, I>(writer: W, posts: I) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = Post>,
{
    let mut gz = GzipEncoder::new(writer);

    for post in posts {
        gz.write_all(post.encode_delimited().as_bytes()).await?;
    }
    gz.write_all(Post::sentinel().encode_delimited().as_bytes())
        .await?;

    gz.shutdown().await?;
    Ok(())
}

/// As [`write_piece_stream`], but draining a channel of posts.
pub async fn write_piece_channel<W>(
    writer: W,
    mut posts: mpsc::Receiver<Post>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut gz = GzipEncoder::new(writer);

    while let Some(post) = posts.recv().await {
        gz.write_all(post.encode_delimited().as_bytes()).await?;
    }
    gz.write_all(Post::sentinel().encode_delimited().as_bytes())
        .await?;

    gz.shutdown().await?;
    Ok(())
}

async fn read_field<R: AsyncRead + Unpin>(
    reader: &mut BufReader<GzipDecoder<BufReader<R>>>,
) -> std::io::Result<Option<String>> {
    let mut raw = Vec::new();
    let n = reader.read_until(b'|', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    if raw.last() == Some(&b'|') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

fn to_int(field: &str) -> i64 {
    field.parse().unwrap_or_else(|_| {
        trace!(field, "non-numeric post field, defaulting to 0");
        0
    })
}

/// Read a piece stream, batching posts into pieces of [`PIECE_SIZE`] and
/// handing them to `pieces`. Returns cleanly on the sentinel post; stops
/// early when the consumer goes away.
pub async fn read_piece_stream<R>(
    reader: R,
    pieces: mpsc::Sender<Piece>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut gz = BufReader::new(GzipDecoder::new(BufReader::new(reader)));
    let mut piece = Piece::default();

    loop {
        let Some(id_field) = read_field(&mut gz).await? else {
            // stream ended without a sentinel; deliver what we have
            break;
        };
        let id = to_int(&id_field);
        if id == -1 {
            break;
        }

        let mut fields = Vec::with_capacity(9);
        for _ in 0..9 {
            match read_field(&mut gz).await? {
                Some(f) => fields.push(f),
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "post record truncated",
                    ))
                }
            }
        }

        piece.add(Post {
            id,
            info_hash: fields[0].clone(),
            title: fields[1].clone(),
            size: to_int(&fields[2]),
            file_count: to_int(&fields[3]),
            seeders: to_int(&fields[4]),
            leechers: to_int(&fields[5]),
            upload_date: to_int(&fields[6]),
            tags: fields[7].clone(),
            meta: fields[8].clone(),
        });

        if piece.posts.len() >= PIECE_SIZE {
            if pieces.send(std::mem::take(&mut piece)).await.is_err() {
                // consumer dropped; stop producing
                return Ok(());
            }
        }
    }

    if !piece.posts.is_empty() {
        let _ = pieces.send(piece).await;
    }
    Ok(())
}
