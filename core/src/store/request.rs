use super::Session;
use crate::{
    error::{EngineError, EngineResult},
    request::{Request, RequestStatus, SongRef},
    types::{from_millis, to_millis},
};
use rusqlite::{params, OptionalExtension, Row};

const REQUEST_COLUMNS: &str = "request_id, requester_id, dj_id, song_title, song_artist,
    song_external_id, amount, message, status, created_at, decided_at, version";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<Request> {
    let status: String = row.get(8)?;
    let status = RequestStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown request status '{status}'").into(),
        )
    })?;
    Ok(Request {
        request_id:   row.get(0)?,
        requester_id: row.get(1)?,
        dj_id:        row.get(2)?,
        song: SongRef {
            title:       row.get(3)?,
            artist:      row.get(4)?,
            external_id: row.get(5)?,
        },
        amount:       row.get(6)?,
        message:      row.get(7)?,
        status,
        created_at:   from_millis(row.get(9)?),
        decided_at:   row.get::<_, Option<i64>>(10)?.map(from_millis),
        version:      row.get(11)?,
    })
}

impl Session<'_> {
    // ── Request ───────────────────────────────────────────────────

    pub fn insert_request(&self, r: &Request) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO song_request (
                request_id, requester_id, dj_id, song_title, song_artist, song_external_id,
                amount, message, status, created_at, decided_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &r.request_id,
                &r.requester_id,
                &r.dj_id,
                &r.song.title,
                &r.song.artist,
                &r.song.external_id,
                r.amount,
                &r.message,
                r.status.as_str(),
                to_millis(r.created_at),
                r.decided_at.map(to_millis),
                r.version,
            ],
        )?;
        Ok(())
    }

    pub fn find_request(&self, request_id: &str) -> EngineResult<Option<Request>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM song_request WHERE request_id = ?1");
        let request = self
            .conn
            .query_row(&sql, params![request_id], request_from_row)
            .optional()?;
        Ok(request)
    }

    pub fn load_request(&self, request_id: &str) -> EngineResult<Request> {
        self.find_request(request_id)?.ok_or_else(|| EngineError::NotFound {
            request_id: request_id.to_string(),
        })
    }

    /// Persist a transition. `next.version` must be exactly one past the
    /// stored version; otherwise somebody else wrote first.
    pub fn update_request_status(&self, next: &Request) -> EngineResult<()> {
        let expected = next.version - 1;
        let changed = self.conn.execute(
            "UPDATE song_request
             SET status = ?1, decided_at = ?2, version = ?3
             WHERE request_id = ?4 AND version = ?5",
            params![
                next.status.as_str(),
                next.decided_at.map(to_millis),
                next.version,
                &next.request_id,
                expected,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::StaleVersion {
                request_id: next.request_id.clone(),
                expected,
            });
        }
        Ok(())
    }

    /// A DJ's requests, oldest first, optionally restricted to one status.
    pub fn requests_for_dj(
        &self,
        dj_id:  &str,
        status: Option<RequestStatus>,
    ) -> EngineResult<Vec<Request>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM song_request
             WHERE dj_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![dj_id, status.map(|s| s.as_str())], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn requests_for_fan(&self, fan_id: &str) -> EngineResult<Vec<Request>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM song_request
             WHERE requester_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![fan_id], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every request in insertion order. Used by the conservation audit.
    pub fn all_requests(&self) -> EngineResult<Vec<Request>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM song_request ORDER BY rowid ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn request_count(&self) -> EngineResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM song_request", [], |row| row.get(0))?;
        Ok(count)
    }
}
