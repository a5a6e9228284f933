use super::Session;
use crate::{
    error::EngineResult,
    event::EventLogEntry,
    types::{from_millis, to_millis},
};
use rusqlite::{params, Row};

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventLogEntry> {
    Ok(EventLogEntry {
        seq:        Some(row.get(0)?),
        request_id: row.get(1)?,
        event_type: row.get(2)?,
        payload:    row.get(3)?,
        created_at: from_millis(row.get(4)?),
    })
}

impl Session<'_> {
    // ── Event log ─────────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO event_log (request_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &entry.request_id,
                &entry.event_type,
                &entry.payload,
                to_millis(entry.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn events_for_request(&self, request_id: &str) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, request_id, event_type, payload, created_at
             FROM event_log WHERE request_id = ?1
             ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map(params![request_id], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Events with `seq` greater than `after`, oldest first.
    pub fn events_since(&self, after: i64, limit: usize) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, request_id, event_type, payload, created_at
             FROM event_log WHERE seq > ?1
             ORDER BY seq ASC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![after, limit as i64], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Position of the newest committed event, 0 for an empty log.
    pub fn last_event_seq(&self) -> EngineResult<i64> {
        let seq: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM event_log", [], |row| row.get(0))?;
        Ok(seq)
    }
}
