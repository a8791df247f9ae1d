//! # NetDB: Routing Table and Entry Store
//!
//! The NetDB pairs an in-memory Kademlia routing table with a durable sqlite
//! store of directory entries.
//!
//! ## Routing Table
//!
//! 160 buckets, one per possible leading-zero count of the XOR distance to
//! our own address. Each bucket holds up to [`BUCKET_SIZE`] addresses,
//! most-recently-touched first; touching an address moves it to the front,
//! and a full bucket drops its tail. Only addresses live here — the data
//! behind them is fetched from the store. The table is persisted as a JSON
//! blob (`table.dat`) after every mutation.
//!
//! ## Store
//!
//! A single-writer sqlite database with three tables: `entry` (one row per
//! verified entry, keyed by the encoded address), `seed` (unique
//! seed/for pairs linking entries), and `ftsEntry` (an FTS5 index over
//! name and description for peer search). Entries only enter the store
//! after [`Entry::verify`] passes; rows are updated in place when they
//! change and reported as 0 affected rows when they do not.
//!
//! The two halves converge: every table entry has a row, and rows missing
//! from the table are lazily reinserted when queried — popular addresses
//! stay resident.

use std::path::PathBuf;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::entry::{sort_by_distance, Entry, EntryError};
use crate::identity::{Address, ADDRESS_BIT_SIZE};
use crate::messages::MAX_PAGE_SIZE;

/// Bucket capacity, the `k` of the k-bucket table.
pub const BUCKET_SIZE: usize = 20;

/// How many entries `query_latest` reports.
const LATEST_LIMIT: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum NetDbError {
    #[error("entry failed verification: {0}")]
    Validation(#[from] EntryError),
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("stored entry is corrupt: {0}")]
    Corrupt(String),
}

// ============================================================================
// SQL
// ============================================================================
//
// Addresses are stored base58check-encoded; it costs a little decoding but
// makes debugging the database far easier. `desc` and `for` are sqlite
// keywords and stay quoted throughout.

const SQL_CREATE_ENTRIES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS entry (
        id INTEGER PRIMARY KEY NOT NULL,
        address TEXT UNIQUE,
        name TEXT NOT NULL,
        "desc" TEXT,
        publicAddress TEXT NOT NULL,
        port INTEGER,
        publicKey BLOB NOT NULL,
        signature BLOB,
        collectionHash BLOB,
        postCount INTEGER,
        seedCount INTEGER,
        seedingCount INTEGER,
        updated INTEGER,
        seen INTEGER
    )
"#;

const SQL_CREATE_SEEDS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS seed (
        id INTEGER PRIMARY KEY NOT NULL,
        seed INTEGER NOT NULL,
        "for" INTEGER NOT NULL,
        UNIQUE(seed, "for") ON CONFLICT REPLACE
    )
"#;

const SQL_CREATE_FTS_TABLE: &str = r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS ftsEntry USING fts5(name, "desc")
"#;

const SQL_INDEX_ADDRESSES: &str = r#"
    CREATE INDEX IF NOT EXISTS addressIndex ON entry(address)
"#;

const SQL_INSERT_ENTRY: &str = r#"
    INSERT OR IGNORE INTO entry (
        address, name, "desc", publicAddress, port, publicKey, signature,
        collectionHash, postCount, seedCount, seedingCount, updated, seen
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

// The guard clause makes a byte-identical re-insert report 0 affected rows.
const SQL_UPDATE_ENTRY: &str = r#"
    UPDATE entry SET
        name = ?, "desc" = ?, publicAddress = ?, port = ?, publicKey = ?,
        signature = ?, collectionHash = ?, postCount = ?, seedCount = ?,
        seedingCount = ?, updated = ?, seen = ?
    WHERE address = ? AND (updated <> ? OR signature <> ? OR seedCount <> ?)
"#;

const SQL_QUERY_ADDRESS: &str = r#"
    SELECT * FROM entry WHERE address = ?
"#;

const SQL_QUERY_ID_BY_ADDRESS: &str = r#"
    SELECT id FROM entry WHERE address = ?
"#;

const SQL_INSERT_SEED: &str = r#"
    INSERT OR IGNORE INTO seed (seed, "for") VALUES (?, ?)
"#;

const SQL_QUERY_SEEDS: &str = r#"
    SELECT entry.address FROM entry
        JOIN seed ON entry.id = seed.seed
        WHERE seed."for" = ?
"#;

const SQL_QUERY_SEEDING: &str = r#"
    SELECT entry.address FROM entry
        JOIN seed ON entry.id = seed."for"
        WHERE seed.seed = ?
"#;

const SQL_DELETE_FTS: &str = r#"
    DELETE FROM ftsEntry WHERE rowid = ?
"#;

const SQL_INSERT_FTS: &str = r#"
    INSERT INTO ftsEntry (rowid, name, "desc") VALUES (?, ?, ?)
"#;

const SQL_SEARCH_ENTRIES: &str = r#"
    SELECT entry.address FROM entry
        JOIN ftsEntry ON ftsEntry.rowid = entry.id
        WHERE ftsEntry MATCH ?
        LIMIT ? OFFSET ?
"#;

const SQL_ENTRY_LEN: &str = r#"
    SELECT COUNT(id) FROM entry
"#;

const SQL_QUERY_LATEST: &str = r#"
    SELECT * FROM entry ORDER BY id DESC LIMIT ?
"#;

// ============================================================================
// Routing table
// ============================================================================

#[derive(Debug)]
pub struct RoutingTable {
    addr: Address,
    buckets: Vec<Vec<Address>>,
}

impl RoutingTable {
    pub fn new(addr: Address) -> Self {
        Self {
            addr,
            buckets: vec![Vec::new(); ADDRESS_BIT_SIZE],
        }
    }

    /// Bucket index of an address: leading zero bits of its distance to us,
    /// clamped for the (never inserted) self address.
    pub fn bucket_index(&self, addr: &Address) -> usize {
        self.addr.xor(addr).leading_zeros().min(ADDRESS_BIT_SIZE - 1)
    }

    /// Touch an address: move to front if present, otherwise push front,
    /// dropping the tail of a full bucket.
    pub fn insert(&mut self, addr: Address) {
        if addr == self.addr {
            return;
        }

        let index = self.bucket_index(&addr);
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.iter().position(|a| *a == addr) {
            bucket.remove(pos);
        } else if bucket.len() == BUCKET_SIZE {
            bucket.pop();
        }
        bucket.insert(0, addr);
    }

    pub fn remove(&mut self, addr: &Address) {
        let index = self.bucket_index(addr);
        self.buckets[index].retain(|a| a != addr);
    }

    pub fn bucket(&self, index: usize) -> &[Address] {
        &self.buckets[index]
    }

    pub fn buckets(&self) -> &[Vec<Address>] {
        &self.buckets
    }

    /// Total number of addresses resident across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Up to `max` candidate addresses for a target, walking outward from
    /// the target's bucket (±1, ±2, …) until enough are collected or every
    /// bucket is exhausted.
    pub fn closest(&self, target: &Address, max: usize) -> Vec<Address> {
        let index = self.bucket_index(target) as isize;
        let mut out = Vec::with_capacity(max);

        for i in 0..ADDRESS_BIT_SIZE as isize {
            if out.len() >= max {
                break;
            }
            let below = index - i;
            if below >= 0 {
                for addr in &self.buckets[below as usize] {
                    if out.len() >= max {
                        break;
                    }
                    out.push(*addr);
                }
            }
            let above = index + i;
            if i > 0 && (above as usize) < ADDRESS_BIT_SIZE {
                for addr in &self.buckets[above as usize] {
                    if out.len() >= max {
                        break;
                    }
                    out.push(*addr);
                }
            }
        }

        out
    }

    fn replace_buckets(&mut self, mut buckets: Vec<Vec<Address>>) {
        buckets.resize(ADDRESS_BIT_SIZE, Vec::new());
        for bucket in &mut buckets {
            bucket.truncate(BUCKET_SIZE);
        }
        self.buckets = buckets;
    }
}

// ============================================================================
// NetDB
// ============================================================================

pub struct NetDB {
    addr: Address,
    table: Mutex<RoutingTable>,
    pool: SqlitePool,
    table_path: PathBuf,
}

impl NetDB {
    /// Open (creating if needed) the entry store at `db_path` and load any
    /// persisted routing table from `table_path`.
    pub async fn open(
        addr: Address,
        db_path: &std::path::Path,
        table_path: PathBuf,
    ) -> Result<Self, NetDbError> {
        if let Some(parent) = db_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        // a single connection serializes all writers
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SQL_CREATE_ENTRIES_TABLE).execute(&pool).await?;
        sqlx::query(SQL_CREATE_SEEDS_TABLE).execute(&pool).await?;
        sqlx::query(SQL_CREATE_FTS_TABLE).execute(&pool).await?;
        sqlx::query(SQL_INDEX_ADDRESSES).execute(&pool).await?;

        let mut table = RoutingTable::new(addr);
        if let Ok(raw) = tokio::fs::read(&table_path).await {
            match serde_json::from_slice::<Vec<Vec<Address>>>(&raw) {
                Ok(buckets) => table.replace_buckets(buckets),
                Err(e) => warn!(error = %e, "discarding unreadable routing table"),
            }
        }

        Ok(Self {
            addr,
            table: Mutex::new(table),
            pool,
            table_path,
        })
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    /// Number of addresses resident in the in-memory table.
    pub async fn table_len(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Number of entries stored.
    pub async fn len(&self) -> Result<i64, NetDbError> {
        let row = sqlx::query(SQL_ENTRY_LEN).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>(0))
    }

    /// Touch the in-memory table and persist it.
    async fn insert_into_table(&self, addr: Address) {
        let encoded = {
            let mut table = self.table.lock().await;
            table.insert(addr);
            serde_json::to_vec(&table.buckets).ok()
        };
        if let Some(bytes) = encoded {
            if let Err(e) = tokio::fs::write(&self.table_path, bytes).await {
                warn!(error = %e, path = %self.table_path.display(), "failed to persist routing table");
            }
        }
    }

    async fn update_row(&self, entry: &Entry) -> Result<u64, NetDbError> {
        let address = entry.address.to_base58();
        let result = sqlx::query(SQL_UPDATE_ENTRY)
            .bind(&entry.name)
            .bind(&entry.desc)
            .bind(&entry.public_address)
            .bind(entry.port as i64)
            .bind(&entry.public_key)
            .bind(&entry.signature)
            .bind(&entry.collection_hash)
            .bind(entry.post_count)
            .bind(entry.seeds.len() as i64)
            .bind(entry.seeding.len() as i64)
            .bind(entry.updated as i64)
            .bind(entry.seen)
            .bind(&address)
            .bind(entry.updated as i64)
            .bind(&entry.signature)
            .bind(entry.seeds.len() as i64)
            .execute(&self.pool)
            .await?;

        let affected = result.rows_affected();
        if affected > 0 {
            if let Some(id) = self.id_by_address(&entry.address).await? {
                self.index_fts(id, entry).await?;
            }
        }
        Ok(affected)
    }

    async fn insert_row(&self, entry: &Entry) -> Result<u64, NetDbError> {
        let address = entry.address.to_base58();
        let result = sqlx::query(SQL_INSERT_ENTRY)
            .bind(&address)
            .bind(&entry.name)
            .bind(&entry.desc)
            .bind(&entry.public_address)
            .bind(entry.port as i64)
            .bind(&entry.public_key)
            .bind(&entry.signature)
            .bind(&entry.collection_hash)
            .bind(entry.post_count)
            .bind(entry.seeds.len() as i64)
            .bind(entry.seeding.len() as i64)
            .bind(entry.updated as i64)
            .bind(entry.seen)
            .execute(&self.pool)
            .await?;

        let affected = result.rows_affected();
        if affected > 0 {
            self.index_fts(result.last_insert_rowid(), entry).await?;
        }
        Ok(affected)
    }

    async fn index_fts(&self, id: i64, entry: &Entry) -> Result<(), NetDbError> {
        sqlx::query(SQL_DELETE_FTS)
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query(SQL_INSERT_FTS)
            .bind(id)
            .bind(&entry.name)
            .bind(&entry.desc)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn id_by_address(&self, addr: &Address) -> Result<Option<i64>, NetDbError> {
        let row = sqlx::query(SQL_QUERY_ID_BY_ADDRESS)
            .bind(addr.to_base58())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)))
    }

    /// Register the seed relations an entry carries: who seeds it, and who
    /// it seeds. Pairs touching addresses we have no row for yet are
    /// skipped; they reappear once those entries arrive.
    async fn insert_entry_seeds(&self, entry: &Entry) -> Result<(), NetDbError> {
        for seeding in &entry.seeding {
            if let Err(e) = self.insert_seed(seeding, &entry.address).await {
                trace!(error = %e, "skipping unresolvable seeding relation");
            }
        }
        for seed in &entry.seeds {
            if let Err(e) = self.insert_seed(&entry.address, seed).await {
                trace!(error = %e, "skipping unresolvable seed relation");
            }
        }
        Ok(())
    }

    /// Record that `seed` seeds `for_addr`. Duplicate pairs replace
    /// silently.
    pub async fn insert_seed(
        &self,
        for_addr: &Address,
        seed: &Address,
    ) -> Result<(), NetDbError> {
        let for_id = self
            .id_by_address(for_addr)
            .await?
            .ok_or_else(|| NetDbError::Corrupt(format!("no entry for {}", for_addr)))?;
        let seed_id = self
            .id_by_address(seed)
            .await?
            .ok_or_else(|| NetDbError::Corrupt(format!("no entry for {}", seed)))?;

        sqlx::query(SQL_INSERT_SEED)
            .bind(seed_id)
            .bind(for_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert an entry into both the routing table and the store. Returns
    /// the number of affected rows: 1 for a fresh or changed entry, 0 when
    /// the stored row is already identical.
    pub async fn insert(&self, entry: &Entry) -> Result<u64, NetDbError> {
        entry.verify()?;

        debug!(peer = %entry.address, "inserting into NetDB");

        self.insert_into_table(entry.address).await;

        // update if the row exists, insert otherwise
        let mut affected = self.update_row(entry).await?;
        if affected == 0 {
            affected = self.insert_row(entry).await?;
        }

        self.insert_entry_seeds(entry).await?;

        Ok(affected)
    }

    /// Update an existing row only. Returns 0 when no row matched (or the
    /// row is unchanged).
    pub async fn update(&self, entry: &Entry) -> Result<u64, NetDbError> {
        entry.verify()?;
        self.update_row(entry).await
    }

    fn entry_from_row(&self, row: &SqliteRow) -> Result<(i64, Entry), NetDbError> {
        let id: i64 = row.get("id");
        let address: String = row.get("address");
        let address = Address::from_base58(&address)
            .map_err(|e| NetDbError::Corrupt(format!("bad stored address: {e}")))?;

        let entry = Entry {
            address,
            name: row.get("name"),
            desc: row.get("desc"),
            public_address: row.get("publicAddress"),
            port: row.get::<i64, _>("port") as u16,
            public_key: row.get("publicKey"),
            signature: row.get("signature"),
            collection_hash: row.get("collectionHash"),
            post_count: row.get("postCount"),
            updated: row.get::<i64, _>("updated") as u64,
            seen: row.get("seen"),
            seeds: Vec::new(),
            seeding: Vec::new(),
        };

        Ok((id, entry))
    }

    async fn addresses_for(&self, sql: &str, id: i64) -> Result<Vec<Address>, NetDbError> {
        let rows = sqlx::query(sql).bind(id).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let encoded: String = row.get(0);
            out.push(
                Address::from_base58(&encoded)
                    .map_err(|e| NetDbError::Corrupt(format!("bad stored address: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn materialize(&self, id: i64, entry: &mut Entry) -> Result<(), NetDbError> {
        entry.seeds = self.addresses_for(SQL_QUERY_SEEDS, id).await?;
        entry.seeding = self.addresses_for(SQL_QUERY_SEEDING, id).await?;
        Ok(())
    }

    /// Fetch the full entry for an address, seeds and seeding included.
    /// Queried addresses are re-touched in the table so popular entries
    /// stay easy to reach.
    pub async fn query(&self, addr: &Address) -> Result<Option<Entry>, NetDbError> {
        let Some(row) = sqlx::query(SQL_QUERY_ADDRESS)
            .bind(addr.to_base58())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let (id, mut entry) = self.entry_from_row(&row)?;
        self.materialize(id, &mut entry).await?;

        self.insert_into_table(entry.address).await;

        Ok(Some(entry))
    }

    /// The seeds registered for an address.
    pub async fn query_seeds(&self, addr: &Address) -> Result<Vec<Address>, NetDbError> {
        match self.id_by_address(addr).await? {
            Some(id) => self.addresses_for(SQL_QUERY_SEEDS, id).await,
            None => Ok(Vec::new()),
        }
    }

    /// The addresses an entry is seeding.
    pub async fn query_seeding(&self, addr: &Address) -> Result<Vec<Address>, NetDbError> {
        match self.id_by_address(addr).await? {
            Some(id) => self.addresses_for(SQL_QUERY_SEEDING, id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Up to k stored entries closest to the target, strictly ordered by
    /// XOR distance.
    pub async fn find_closest(&self, target: &Address) -> Result<Vec<Entry>, NetDbError> {
        let candidates = {
            let table = self.table.lock().await;
            table.closest(target, BUCKET_SIZE)
        };

        let mut entries = Vec::with_capacity(candidates.len());
        for addr in candidates {
            match self.query(&addr).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => trace!(peer = %addr, "table address without a stored row"),
                Err(e) => debug!(peer = %addr, error = %e, "skipping unreadable entry"),
            }
        }

        sort_by_distance(&mut entries, target);
        entries.truncate(BUCKET_SIZE);
        Ok(entries)
    }

    /// The most recently inserted entries, newest first.
    pub async fn query_latest(&self) -> Result<Vec<Entry>, NetDbError> {
        let rows = sqlx::query(SQL_QUERY_LATEST)
            .bind(LATEST_LIMIT)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, mut entry) = self.entry_from_row(&row)?;
            self.materialize(id, &mut entry).await?;
            out.push(entry);
        }
        Ok(out)
    }

    /// Full-text search over entry names and descriptions, 25 per page.
    pub async fn search_peer(
        &self,
        name: &str,
        desc: &str,
        page: i64,
    ) -> Result<Vec<Address>, NetDbError> {
        // quoting keeps user input out of the MATCH grammar
        let quote = |s: &str| format!("\"{}\"", s.replace('"', ""));
        let query = if desc.is_empty() {
            quote(name)
        } else {
            format!("{} OR {}", quote(name), quote(desc))
        };

        let rows = sqlx::query(SQL_SEARCH_ENTRIES)
            .bind(query)
            .bind(MAX_PAGE_SIZE as i64)
            .bind(page * MAX_PAGE_SIZE as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let encoded: String = row.get(0);
            out.push(
                Address::from_base58(&encoded)
                    .map_err(|e| NetDbError::Corrupt(format!("bad stored address: {e}")))?,
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn test_entry(name: &str) -> (Keypair, Entry) {
        let kp = Keypair::generate();
        let mut entry = kp.new_entry(name, &format!("node called {name}"));
        entry.public_address = "203.0.113.1".into();
        entry.port = 5050;
        kp.sign_entry(&mut entry);
        (kp, entry)
    }

    async fn test_db(addr: Address) -> (tempfile::TempDir, NetDB) {
        let dir = tempfile::tempdir().unwrap();
        let db = NetDB::open(
            addr,
            &dir.path().join("netdb.sqlite3"),
            dir.path().join("table.dat"),
        )
        .await
        .unwrap();
        (dir, db)
    }

    // ------------------------------------------------------------------
    // Routing table
    // ------------------------------------------------------------------

    #[test]
    fn bucket_index_matches_distance() {
        let me = Keypair::generate().address();
        let table = RoutingTable::new(me);

        for _ in 0..100 {
            let other = Keypair::generate().address();
            assert_eq!(table.bucket_index(&other), me.xor(&other).leading_zeros());
        }
    }

    #[test]
    fn touch_moves_to_front_without_duplicates() {
        let me = Address::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(me);

        let mut a = [0u8; 20];
        a[0] = 0x80;
        let mut b = [0u8; 20];
        b[0] = 0x81;
        let a = Address::from_bytes(a);
        let b = Address::from_bytes(b);

        table.insert(a);
        table.insert(b);
        table.insert(a); // touch

        let bucket = table.bucket(0);
        assert_eq!(bucket, &[a, b][..]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn full_bucket_drops_the_tail() {
        let me = Address::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(me);

        // all in bucket 0 (high bit set)
        let addr = |i: u8| {
            let mut raw = [0u8; 20];
            raw[0] = 0x80;
            raw[19] = i;
            Address::from_bytes(raw)
        };

        for i in 0..BUCKET_SIZE as u8 {
            table.insert(addr(i));
        }
        let oldest = addr(0);
        assert!(table.bucket(0).contains(&oldest));

        table.insert(addr(BUCKET_SIZE as u8));
        assert_eq!(table.bucket(0).len(), BUCKET_SIZE);
        assert!(!table.bucket(0).contains(&oldest));
        assert_eq!(table.bucket(0)[0], addr(BUCKET_SIZE as u8));
    }

    #[test]
    fn self_is_never_inserted() {
        let me = Keypair::generate().address();
        let mut table = RoutingTable::new(me);
        table.insert(me);
        assert!(table.is_empty());
    }

    #[test]
    fn no_bucket_exceeds_capacity_and_no_duplicates() {
        let me = Keypair::generate().address();
        let mut table = RoutingTable::new(me);

        for _ in 0..500 {
            table.insert(Keypair::generate().address());
        }
        // touch a few again
        for bucket in 0..ADDRESS_BIT_SIZE {
            if let Some(addr) = table.bucket(bucket).first().copied() {
                table.insert(addr);
            }
        }

        for bucket in table.buckets() {
            assert!(bucket.len() <= BUCKET_SIZE);
            let mut seen = std::collections::HashSet::new();
            for addr in bucket {
                assert!(seen.insert(*addr), "duplicate address in bucket");
            }
        }
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn insert_then_query_roundtrips() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let (_, entry) = test_entry("alice");
        assert_eq!(db.insert(&entry).await.unwrap(), 1);

        let got = db.query(&entry.address).await.unwrap().expect("stored entry");
        assert_eq!(got, entry);
        assert_eq!(db.len().await.unwrap(), 1);
        assert!(db.table_len().await >= 1);
    }

    #[tokio::test]
    async fn identical_reinsert_reports_zero_affected_rows() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let (_, entry) = test_entry("alice");
        assert_eq!(db.insert(&entry).await.unwrap(), 1);
        assert_eq!(db.insert(&entry).await.unwrap(), 0);

        // a re-signed entry counts as a change again
        let (kp, mut entry2) = test_entry("bob");
        db.insert(&entry2).await.unwrap();
        entry2.desc = "a different description".into();
        kp.sign_entry(&mut entry2);
        assert_eq!(db.insert(&entry2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unverifiable_entries_never_land() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let (_, mut entry) = test_entry("mallory");
        entry.name = "not what was signed".into();

        assert!(matches!(
            db.insert(&entry).await,
            Err(NetDbError::Validation(_))
        ));
        assert_eq!(db.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_without_row_affects_nothing() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let (_, entry) = test_entry("ghost");
        assert_eq!(db.update(&entry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_closest_is_sorted_and_bounded() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        for i in 0..30 {
            let (_, entry) = test_entry(&format!("peer{i}"));
            db.insert(&entry).await.unwrap();
        }

        let target = Keypair::generate().address();
        let closest = db.find_closest(&target).await.unwrap();

        assert!(!closest.is_empty());
        assert!(closest.len() <= BUCKET_SIZE);
        for pair in closest.windows(2) {
            assert!(
                pair[0].address.xor(&target) <= pair[1].address.xor(&target),
                "entries not ordered by distance"
            );
        }
        for entry in &closest {
            assert_eq!(entry.verify(), Ok(()));
        }
    }

    #[tokio::test]
    async fn seed_relations_materialize_both_ways() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let (_, alice) = test_entry("alice");
        let (_, bob) = test_entry("bob");
        db.insert(&alice).await.unwrap();
        db.insert(&bob).await.unwrap();

        // bob seeds alice
        db.insert_seed(&alice.address, &bob.address).await.unwrap();
        // duplicates replace silently
        db.insert_seed(&alice.address, &bob.address).await.unwrap();

        let got = db.query(&alice.address).await.unwrap().unwrap();
        assert_eq!(got.seeds, vec![bob.address]);

        assert_eq!(db.query_seeds(&alice.address).await.unwrap(), vec![bob.address]);
        assert_eq!(db.query_seeding(&bob.address).await.unwrap(), vec![alice.address]);
    }

    #[tokio::test]
    async fn search_peer_finds_by_name_and_desc() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let kp = Keypair::generate();
        let mut entry = kp.new_entry("zebra", "stripes and posts");
        entry.public_address = "203.0.113.9".into();
        entry.port = 5050;
        kp.sign_entry(&mut entry);
        db.insert(&entry).await.unwrap();

        let by_name = db.search_peer("zebra", "", 0).await.unwrap();
        assert_eq!(by_name, vec![entry.address]);

        let by_desc = db.search_peer("nomatch", "stripes", 0).await.unwrap();
        assert_eq!(by_desc, vec![entry.address]);

        let miss = db.search_peer("aardvark", "", 0).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn query_latest_is_newest_first() {
        let me = Keypair::generate().address();
        let (_dir, db) = test_db(me).await;

        let (_, first) = test_entry("first");
        let (_, second) = test_entry("second");
        db.insert(&first).await.unwrap();
        db.insert(&second).await.unwrap();

        let latest = db.query_latest().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].address, second.address);
        assert_eq!(latest[1].address, first.address);
    }

    #[tokio::test]
    async fn routing_table_survives_reopen() {
        let me = Keypair::generate().address();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("netdb.sqlite3");
        let table_path = dir.path().join("table.dat");

        let (_, entry) = test_entry("alice");
        {
            let db = NetDB::open(me, &db_path, table_path.clone()).await.unwrap();
            db.insert(&entry).await.unwrap();
            assert_eq!(db.table_len().await, 1);
        }

        let db = NetDB::open(me, &db_path, table_path).await.unwrap();
        assert_eq!(db.table_len().await, 1);
        let closest = db.find_closest(&entry.address).await.unwrap();
        assert_eq!(closest[0].address, entry.address);
    }
}
