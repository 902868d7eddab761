//! # txbtree
//!
//! A single-file, disk-resident, transactional key/value store: a
//! B+tree of fixed 4 KiB pages with an in-memory buffer pool, a
//! record-level lock manager with deadlock detection, and a
//! write-ahead log with ARIES-style restart recovery.
//!
//! ## Architecture
//!
//! The engine is composed of layered, separately testable components:
//!
//! - **Page Layer** (`page`): fixed 128-byte header, slotted leaves
//!   with backward-packed values, fixed-arity internal pages
//! - **Storage Layer** (`storage`): per-table files, on-disk free
//!   list, file doubling
//! - **Buffer Pool** (`buffer`): LRU page cache with pinning, dirty
//!   tracking and log-before-page write-back
//! - **Write-Ahead Log** (`wal`): length-prefixed records, durable
//!   commit, analysis/redo/undo recovery
//! - **Lock Manager** (`lock`): shared/exclusive record locks with
//!   wait-for-graph deadlock detection
//! - **Transactions** (`trx`): strict two-phase locking,
//!   compensation-logged rollback
//! - **B+Tree** (`btree`): insert/find/update/delete with
//!   split/merge/redistribute
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txbtree::{Config, Db};
//!
//! let db = Db::open(Config::new("data/wal", "data/wal.trace"))?;
//! let table = db.open_table("data/accounts.db")?;
//!
//! db.insert(table, 7, b"opening balance")?;
//!
//! let trx = db.begin();
//! let value = db.find(table, 7, trx)?;
//! db.update(table, 7, b"updated balance!", trx)?;
//! db.commit(trx)?;
//!
//! db.shutdown()?;
//! ```

pub mod btree;
pub mod buffer;
pub mod error;
pub mod lock;
pub mod page;
pub mod storage;
pub mod trx;
pub mod types;
pub mod wal;

pub use error::{Result, StorageError};
pub use types::{PageId, TableId, TrxId};
pub use wal::recovery::RecoveryMode;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use btree::BTree;
use buffer::BufferPool;
use lock::LockManager;
use storage::DiskManager;
use trx::TrxManager;
use wal::LogManager;

/// Database configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the write-ahead log file
    pub log_path: PathBuf,
    /// Path the recovery trace is appended to
    pub logmsg_path: PathBuf,
    /// Buffer pool size in frames (default: 64)
    pub num_buf: usize,
    /// How far restart recovery runs (default: full)
    pub recovery: RecoveryMode,
}

impl Config {
    /// Create a configuration with default settings
    pub fn new(log_path: impl Into<PathBuf>, logmsg_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            logmsg_path: logmsg_path.into(),
            num_buf: 64,
            recovery: RecoveryMode::Full,
        }
    }

    /// Set the buffer pool size in frames
    pub fn num_buf(mut self, num_buf: usize) -> Self {
        self.num_buf = num_buf;
        self
    }

    /// Select a diagnostic recovery mode by its numeric flag
    /// (0 = full, 1 = stop after redo, 2 = stop after `log_num`
    /// replayed records)
    pub fn recovery_flag(mut self, flag: i32, log_num: usize) -> Self {
        self.recovery = RecoveryMode::from_flag(flag, log_num);
        self
    }
}

/// Main database handle wiring the subsystems together.
///
/// Opening the database runs restart recovery over the log; dropping
/// the handle without calling [`Db::shutdown`] abandons every unflushed
/// buffer frame, which is exactly the crash model the recovery tests
/// rely on.
pub struct Db {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    wal: Arc<LogManager>,
    trxs: Arc<TrxManager>,
    tree: BTree,
}

impl Db {
    /// Initialize the engine and run restart recovery
    pub fn open(config: Config) -> Result<Self> {
        let wal = Arc::new(LogManager::open(&config.log_path)?);

        let mut catalog_path = config.log_path.as_os_str().to_os_string();
        catalog_path.push(".tables");
        let disk = Arc::new(DiskManager::new(PathBuf::from(catalog_path))?);

        let pool = Arc::new(BufferPool::new(
            Arc::clone(&disk),
            Arc::clone(&wal),
            config.num_buf,
        ));
        let locks = Arc::new(LockManager::new());
        let trxs = Arc::new(TrxManager::new(Arc::clone(&wal), Arc::clone(&locks)));

        wal::recovery::run(&wal, &pool, &trxs, config.recovery, &config.logmsg_path)?;

        let tree = BTree::new(
            Arc::clone(&pool),
            Arc::clone(&disk),
            Arc::clone(&locks),
            Arc::clone(&trxs),
        );
        Ok(Self {
            disk,
            pool,
            wal,
            trxs,
            tree,
        })
    }

    /// Open or create a table file, returning its id
    pub fn open_table(&self, path: impl AsRef<Path>) -> Result<TableId> {
        self.disk.open_table(path)
    }

    /// Insert a key/value record (autocommit). Fails with `Duplicate`
    /// if the key exists.
    pub fn insert(&self, table: TableId, key: i64, value: &[u8]) -> Result<()> {
        self.tree.insert(table, key, value)
    }

    /// Read a record under a shared lock held by `trx`; `Ok(None)` for
    /// an absent key
    pub fn find(&self, table: TableId, key: i64, trx: TrxId) -> Result<Option<Vec<u8>>> {
        self.tree.find(table, key, trx)
    }

    /// Overwrite a record in place (same size) under an exclusive lock
    /// held by `trx`; returns the stored size
    pub fn update(&self, table: TableId, key: i64, value: &[u8], trx: TrxId) -> Result<u16> {
        self.tree.update(table, key, value, trx)
    }

    /// Delete a record (autocommit), returning whether it existed
    pub fn delete(&self, table: TableId, key: i64) -> Result<bool> {
        self.tree.delete(table, key)
    }

    /// Start a transaction
    pub fn begin(&self) -> TrxId {
        self.trxs.begin()
    }

    /// Commit: durable once this returns
    pub fn commit(&self, trx: TrxId) -> Result<()> {
        self.trxs.commit(trx)
    }

    /// Roll the transaction back and release its locks
    pub fn abort(&self, trx: TrxId) -> Result<()> {
        self.trxs.abort(trx, &self.pool)
    }

    /// Flush every dirty page (log first) and sync the table files
    pub fn shutdown(self) -> Result<()> {
        self.wal.flush_all()?;
        self.pool.shutdown()
    }
}
