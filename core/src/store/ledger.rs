use super::Session;
use crate::{
    error::{EngineError, EngineResult},
    ledger::{fold_balance, Balance, EntryKind, LedgerEntry},
    types::{from_millis, to_millis},
};
use rusqlite::{params, Row};

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind: String = row.get(3)?;
    let kind = EntryKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown entry kind '{kind}'").into(),
        )
    })?;
    Ok(LedgerEntry {
        entry_id:   row.get(0)?,
        request_id: row.get(1)?,
        account_id: row.get(2)?,
        kind,
        amount:     row.get(4)?,
        created_at: from_millis(row.get(5)?),
    })
}

impl Session<'_> {
    // ── Ledger ────────────────────────────────────────────────────

    /// Append `entries` as one multi-row write.
    ///
    /// Fails with `LedgerWriteConflict` outside a unit of work: a ledger
    /// write that could commit on its own is a programming defect.
    pub fn append_entries(&self, entries: &[LedgerEntry]) -> EngineResult<()> {
        if !self.in_unit_of_work() {
            log::error!(
                "ledger append of {} entries attempted outside a unit of work",
                entries.len()
            );
            return Err(EngineError::LedgerWriteConflict);
        }
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO ledger_entry (entry_id, request_id, account_id, kind, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for e in entries {
            stmt.execute(params![
                &e.entry_id,
                &e.request_id,
                &e.account_id,
                e.kind.as_str(),
                e.amount,
                to_millis(e.created_at),
            ])?;
        }
        Ok(())
    }

    pub fn entries_for_request(&self, request_id: &str) -> EngineResult<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT entry_id, request_id, account_id, kind, amount, created_at
             FROM ledger_entry WHERE request_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![request_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn entries_for_account(&self, account_id: &str) -> EngineResult<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT entry_id, request_id, account_id, kind, amount, created_at
             FROM ledger_entry WHERE account_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn balance_of(&self, account_id: &str) -> EngineResult<Balance> {
        Ok(fold_balance(account_id, &self.entries_for_account(account_id)?))
    }

    // ── Test / summary helpers ────────────────────────────────────

    pub fn ledger_entry_count(&self) -> EngineResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entry", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Test support only: runs one raw statement, bypassing every rule
    /// of the store. Tests use it to tamper with rows, prove the
    /// immutability triggers fire and inject write faults. Not part of
    /// the engine's surface; nothing in the crate calls it.
    #[doc(hidden)]
    pub fn execute_raw(&self, sql: &str) -> EngineResult<usize> {
        Ok(self.conn.execute(sql, [])?)
    }
}
