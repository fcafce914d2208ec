//! SQLite-backed messaging core for Murmur.
//!
//! Every exported mutation runs as one `IMMEDIATE` transaction on the single
//! writer connection; multi-statement queries run inside one read
//! transaction on a pooled read-only connection. Operations take the acting
//! user's id explicitly; resolving a token subject to a user is the job of
//! [`Database::resolve_current_user`].

pub mod clock;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod projection;
pub mod typing;
pub mod users;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ChatError, Result};

use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const READER_POOL_SIZE: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
    writer: Mutex<Connection>,
    /// Empty for in-memory databases, which can only be seen through the writer.
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
            clock,
        })
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&writer)?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            reader_idx: AtomicUsize::new(0),
            clock,
        })
    }

    /// Current time in milliseconds since the epoch, from the injected clock.
    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Run `f` inside a read transaction so multi-statement queries see one
    /// snapshot. Any writes `f` attempts are rolled back.
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            let conn = self
                .writer
                .lock()
                .map_err(|e| ChatError::LockPoisoned(e.to_string()))?;
            let tx = conn.unchecked_transaction()?;
            return f(&tx);
        }

        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|e| ChatError::LockPoisoned(e.to_string()))?;
        let tx = conn.unchecked_transaction()?;
        f(&tx)
    }

    /// Run `f` inside an immediate write transaction. The transaction commits
    /// only if `f` returns `Ok`.
    pub(crate) fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|e| ChatError::LockPoisoned(e.to_string()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
