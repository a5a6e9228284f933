//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The engine and the aggregator call `Session` methods; they never
//! execute SQL directly.
//!
//! RULE: Every write that moves money happens inside `unit_of_work`.
//! `Session::append_entries` refuses to run anywhere else.

use crate::error::{EngineError, EngineResult};
use rusqlite::{Connection, TransactionBehavior};
use std::{sync::Mutex, time::Duration};

mod event;
mod ledger;
mod request;
mod stats;

pub struct SettlementStore {
    conn: Mutex<Connection>,
}

/// Borrowed view of the connection for the duration of one call.
/// Inside `unit_of_work` it wraps the open transaction.
pub struct Session<'c> {
    conn: &'c Connection,
}

impl SettlementStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        Self::open_with_timeout(path, Duration::from_secs(5))
    }

    pub fn open_with_timeout(path: &str, busy_timeout: Duration) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.session(|s| {
            s.conn
                .execute_batch(include_str!("../../../migrations/001_requests_and_ledger.sql"))?;
            s.conn
                .execute_batch(include_str!("../../../migrations/002_stats.sql"))?;
            Ok(())
        })
    }

    /// Run `work` against the connection without opening a transaction.
    /// Reads, and stats writes that need no atomicity with the ledger.
    pub fn session<T>(&self, work: impl FnOnce(&Session<'_>) -> EngineResult<T>) -> EngineResult<T> {
        let guard = self.conn.lock().map_err(|_| EngineError::LockPoisoned("store connection"))?;
        work(&Session { conn: &guard })
    }

    /// Run `work` as one atomic unit. Commits only if `work` returns Ok;
    /// any error rolls back every write it made.
    ///
    /// `after_commit` runs once the commit has succeeded, while the
    /// connection is still held, so hooks see outcomes in commit order.
    pub fn unit_of_work<T>(
        &self,
        work:         impl FnOnce(&Session<'_>) -> EngineResult<T>,
        after_commit: impl FnOnce(&T),
    ) -> EngineResult<T> {
        let mut guard = self.conn.lock().map_err(|_| EngineError::LockPoisoned("store connection"))?;
        // IMMEDIATE takes the SQLite write lock up front, so two
        // processes sharing a file cannot interleave decisions.
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = work(&Session { conn: &tx })?;
        tx.commit()?;
        after_commit(&out);
        Ok(out)
    }
}

impl Session<'_> {
    /// True while a unit of work is open on this session.
    pub fn in_unit_of_work(&self) -> bool {
        !self.conn.is_autocommit()
    }
}
