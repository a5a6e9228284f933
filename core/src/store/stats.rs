use super::Session;
use crate::{
    error::EngineResult,
    request::RequestStatus,
    stats::{AccountStats, DjDelta, DjStat, FanDelta, FanQuery, FanSort, FanStat},
    types::{from_millis, to_millis, Timestamp},
};
use rusqlite::{params, OptionalExtension, Row};

const FAN_COLUMNS: &str = "dj_id, fan_id, total_requests, pending_count, accepted_count,
    rejected_count, cancelled_count, total_spent, last_active_at, vip, blocked, archived";

const DJ_COLUMNS: &str = "dj_id, total_requests, pending_count, accepted_count, rejected_count,
    cancelled_count, total_earnings, total_paid_out, last_active_at, archived";

fn fan_from_row(row: &Row<'_>) -> rusqlite::Result<FanStat> {
    Ok(FanStat {
        dj_id:           row.get(0)?,
        fan_id:          row.get(1)?,
        total_requests:  row.get(2)?,
        pending_count:   row.get(3)?,
        accepted_count:  row.get(4)?,
        rejected_count:  row.get(5)?,
        cancelled_count: row.get(6)?,
        total_spent:     row.get(7)?,
        last_active_at:  row.get::<_, Option<i64>>(8)?.map(from_millis),
        vip:             row.get::<_, i32>(9)? != 0,
        blocked:         row.get::<_, i32>(10)? != 0,
        archived:        row.get::<_, i32>(11)? != 0,
    })
}

fn dj_from_row(row: &Row<'_>) -> rusqlite::Result<DjStat> {
    Ok(DjStat {
        dj_id:           row.get(0)?,
        total_requests:  row.get(1)?,
        pending_count:   row.get(2)?,
        accepted_count:  row.get(3)?,
        rejected_count:  row.get(4)?,
        cancelled_count: row.get(5)?,
        total_earnings:  row.get(6)?,
        total_paid_out:  row.get(7)?,
        last_active_at:  row.get::<_, Option<i64>>(8)?.map(from_millis),
        archived:        row.get::<_, i32>(9)? != 0,
    })
}

fn latest(a: Option<i64>, b: Option<i64>) -> Option<Timestamp> {
    a.max(b).map(from_millis)
}

impl Session<'_> {
    // ── Incremental updates ───────────────────────────────────────
    //
    // `seq` is the event_log position of the commit the delta describes.
    // A row rebuilt through that position already counts it, so the
    // upsert leaves it alone.

    pub fn apply_fan_delta(&self, d: &FanDelta, seq: i64) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO fan_stat (
                dj_id, fan_id, total_requests, pending_count, accepted_count,
                rejected_count, cancelled_count, total_spent, last_active_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (dj_id, fan_id) DO UPDATE SET
                total_requests  = total_requests  + excluded.total_requests,
                pending_count   = pending_count   + excluded.pending_count,
                accepted_count  = accepted_count  + excluded.accepted_count,
                rejected_count  = rejected_count  + excluded.rejected_count,
                cancelled_count = cancelled_count + excluded.cancelled_count,
                total_spent     = total_spent     + excluded.total_spent,
                last_active_at  = CASE
                    WHEN excluded.last_active_at IS NULL THEN last_active_at
                    WHEN last_active_at IS NULL THEN excluded.last_active_at
                    ELSE MAX(last_active_at, excluded.last_active_at)
                END
            WHERE fan_stat.rebuilt_through_seq < ?10",
            params![
                &d.dj_id,
                &d.fan_id,
                d.requests,
                d.pending,
                d.accepted,
                d.rejected,
                d.cancelled,
                d.spent,
                d.active_at.map(to_millis),
                seq,
            ],
        )?;
        Ok(())
    }

    pub fn apply_dj_delta(&self, d: &DjDelta, seq: i64) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO dj_stat (
                dj_id, total_requests, pending_count, accepted_count, rejected_count,
                cancelled_count, total_earnings, total_paid_out, last_active_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (dj_id) DO UPDATE SET
                total_requests  = total_requests  + excluded.total_requests,
                pending_count   = pending_count   + excluded.pending_count,
                accepted_count  = accepted_count  + excluded.accepted_count,
                rejected_count  = rejected_count  + excluded.rejected_count,
                cancelled_count = cancelled_count + excluded.cancelled_count,
                total_earnings  = total_earnings  + excluded.total_earnings,
                total_paid_out  = total_paid_out  + excluded.total_paid_out,
                last_active_at  = CASE
                    WHEN excluded.last_active_at IS NULL THEN last_active_at
                    WHEN last_active_at IS NULL THEN excluded.last_active_at
                    ELSE MAX(last_active_at, excluded.last_active_at)
                END
            WHERE dj_stat.rebuilt_through_seq < ?10",
            params![
                &d.dj_id,
                d.requests,
                d.pending,
                d.accepted,
                d.rejected,
                d.cancelled,
                d.earnings,
                d.paid_out,
                d.active_at.map(to_millis),
                seq,
            ],
        )?;
        Ok(())
    }

    // ── Rebuild ───────────────────────────────────────────────────

    /// Fan rows derived from history, flags left at false.
    pub fn compute_fan_stats(&self, account_id: &str) -> EngineResult<Vec<FanStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.dj_id, r.requester_id,
                    COUNT(*),
                    SUM(r.status = 'pending'),
                    SUM(r.status = 'accepted'),
                    SUM(r.status = 'rejected'),
                    SUM(r.status = 'cancelled'),
                    COALESCE(SUM(c.spent), 0),
                    MAX(r.created_at),
                    MAX(CASE WHEN r.status = 'cancelled' THEN r.decided_at END)
             FROM song_request r
             LEFT JOIN (
                 SELECT request_id, account_id, -SUM(amount) AS spent
                 FROM ledger_entry WHERE kind = 'capture'
                 GROUP BY request_id, account_id
             ) c ON c.request_id = r.request_id AND c.account_id = r.requester_id
             WHERE r.requester_id = ?1 OR r.dj_id = ?1
             GROUP BY r.dj_id, r.requester_id
             ORDER BY r.dj_id, r.requester_id",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok(FanStat {
                    dj_id:           row.get(0)?,
                    fan_id:          row.get(1)?,
                    total_requests:  row.get(2)?,
                    pending_count:   row.get(3)?,
                    accepted_count:  row.get(4)?,
                    rejected_count:  row.get(5)?,
                    cancelled_count: row.get(6)?,
                    total_spent:     row.get(7)?,
                    last_active_at:  latest(row.get(8)?, row.get(9)?),
                    ..FanStat::default()
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// DJ row derived from history. None if the account never received
    /// a request and never took a payout.
    pub fn compute_dj_stat(&self, dj_id: &str) -> EngineResult<Option<DjStat>> {
        let (requests, pending, accepted, rejected, cancelled, decided_max): (
            i64, Option<i64>, Option<i64>, Option<i64>, Option<i64>, Option<i64>,
        ) = self.conn.query_row(
            "SELECT COUNT(*),
                    SUM(status = 'pending'),
                    SUM(status = 'accepted'),
                    SUM(status = 'rejected'),
                    SUM(status = 'cancelled'),
                    MAX(CASE WHEN status IN ('accepted', 'rejected') THEN decided_at END)
             FROM song_request WHERE dj_id = ?1",
            params![dj_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
        )?;

        let earnings: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(l.amount), 0)
             FROM ledger_entry l JOIN song_request r ON r.request_id = l.request_id
             WHERE l.kind = 'capture' AND l.account_id = ?1 AND r.dj_id = ?1",
            params![dj_id],
            |row| row.get(0),
        )?;

        let (payouts, paid_out, payout_max): (i64, i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(-SUM(amount), 0), MAX(created_at)
             FROM ledger_entry WHERE account_id = ?1 AND kind = 'payout'",
            params![dj_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if requests == 0 && payouts == 0 {
            return Ok(None);
        }
        Ok(Some(DjStat {
            dj_id:           dj_id.to_string(),
            total_requests:  requests,
            pending_count:   pending.unwrap_or(0),
            accepted_count:  accepted.unwrap_or(0),
            rejected_count:  rejected.unwrap_or(0),
            cancelled_count: cancelled.unwrap_or(0),
            total_earnings:  earnings,
            total_paid_out:  paid_out,
            last_active_at:  latest(decided_max, payout_max),
            archived:        false,
        }))
    }

    /// Overwrite counters and flags. `through_seq` is the last event
    /// the recomputed row reflects.
    pub fn write_fan_stat(&self, f: &FanStat, through_seq: i64) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO fan_stat (
                dj_id, fan_id, total_requests, pending_count, accepted_count, rejected_count,
                cancelled_count, total_spent, last_active_at, vip, blocked, archived,
                rebuilt_through_seq
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (dj_id, fan_id) DO UPDATE SET
                total_requests  = excluded.total_requests,
                pending_count   = excluded.pending_count,
                accepted_count  = excluded.accepted_count,
                rejected_count  = excluded.rejected_count,
                cancelled_count = excluded.cancelled_count,
                total_spent     = excluded.total_spent,
                last_active_at  = excluded.last_active_at,
                vip             = excluded.vip,
                blocked         = excluded.blocked,
                archived        = excluded.archived,
                rebuilt_through_seq = excluded.rebuilt_through_seq",
            params![
                &f.dj_id,
                &f.fan_id,
                f.total_requests,
                f.pending_count,
                f.accepted_count,
                f.rejected_count,
                f.cancelled_count,
                f.total_spent,
                f.last_active_at.map(to_millis),
                f.vip as i32,
                f.blocked as i32,
                f.archived as i32,
                through_seq,
            ],
        )?;
        Ok(())
    }

    pub fn write_dj_stat(&self, d: &DjStat, through_seq: i64) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO dj_stat (
                dj_id, total_requests, pending_count, accepted_count, rejected_count,
                cancelled_count, total_earnings, total_paid_out, last_active_at, archived,
                rebuilt_through_seq
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (dj_id) DO UPDATE SET
                total_requests  = excluded.total_requests,
                pending_count   = excluded.pending_count,
                accepted_count  = excluded.accepted_count,
                rejected_count  = excluded.rejected_count,
                cancelled_count = excluded.cancelled_count,
                total_earnings  = excluded.total_earnings,
                total_paid_out  = excluded.total_paid_out,
                last_active_at  = excluded.last_active_at,
                archived        = excluded.archived,
                rebuilt_through_seq = excluded.rebuilt_through_seq",
            params![
                &d.dj_id,
                d.total_requests,
                d.pending_count,
                d.accepted_count,
                d.rejected_count,
                d.cancelled_count,
                d.total_earnings,
                d.total_paid_out,
                d.last_active_at.map(to_millis),
                d.archived as i32,
                through_seq,
            ],
        )?;
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn stats_touching(&self, account_id: &str) -> EngineResult<AccountStats> {
        let sql = format!(
            "SELECT {FAN_COLUMNS} FROM fan_stat
             WHERE fan_id = ?1 OR dj_id = ?1
             ORDER BY dj_id, fan_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let fans = stmt
            .query_map(params![account_id], fan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AccountStats { dj: self.dj_stat(account_id)?, fans })
    }

    pub fn fan_stat(&self, dj_id: &str, fan_id: &str) -> EngineResult<Option<FanStat>> {
        let sql = format!("SELECT {FAN_COLUMNS} FROM fan_stat WHERE dj_id = ?1 AND fan_id = ?2");
        let stat = self
            .conn
            .query_row(&sql, params![dj_id, fan_id], fan_from_row)
            .optional()?;
        Ok(stat)
    }

    pub fn fan_stats_for_fan(&self, fan_id: &str) -> EngineResult<Vec<FanStat>> {
        let sql = format!("SELECT {FAN_COLUMNS} FROM fan_stat WHERE fan_id = ?1 ORDER BY dj_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![fan_id], fan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn dj_stat(&self, dj_id: &str) -> EngineResult<Option<DjStat>> {
        let sql = format!("SELECT {DJ_COLUMNS} FROM dj_stat WHERE dj_id = ?1");
        let stat = self
            .conn
            .query_row(&sql, params![dj_id], dj_from_row)
            .optional()?;
        Ok(stat)
    }

    pub fn query_fans(&self, dj_id: &str, q: &FanQuery) -> EngineResult<Vec<FanStat>> {
        // Column names come from fixed match arms, never from input.
        let status_column = q.status.map(|status| match status {
            RequestStatus::Pending   => "pending_count",
            RequestStatus::Accepted  => "accepted_count",
            RequestStatus::Rejected  => "rejected_count",
            RequestStatus::Cancelled => "cancelled_count",
        });
        let order = match q.sort {
            FanSort::Spend      => "total_spent DESC, accepted_count DESC",
            FanSort::LastActive => "last_active_at DESC",
            FanSort::Requests   => "total_requests DESC, total_spent DESC",
        };

        let mut sql = format!(
            "SELECT {FAN_COLUMNS} FROM fan_stat
             WHERE dj_id = ?1
               AND (?2 IS NULL OR vip = ?2)
               AND (?3 IS NULL OR blocked = ?3)
               AND (?4 OR archived = 0)"
        );
        if let Some(column) = status_column {
            sql.push_str(&format!(" AND {column} > 0"));
        }
        sql.push_str(&format!(" ORDER BY {order}, fan_id ASC LIMIT ?5"));

        let limit = q.limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    dj_id,
                    q.vip.map(|v| v as i32),
                    q.blocked.map(|b| b as i32),
                    q.include_archived,
                    limit,
                ],
                fan_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Annotations ───────────────────────────────────────────────

    /// Set any of the DJ-owned flags, creating the row if needed.
    pub fn set_fan_flags(
        &self,
        dj_id:    &str,
        fan_id:   &str,
        vip:      Option<bool>,
        blocked:  Option<bool>,
        archived: Option<bool>,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO fan_stat (dj_id, fan_id, vip, blocked, archived)
             VALUES (?1, ?2, COALESCE(?3, 0), COALESCE(?4, 0), COALESCE(?5, 0))
             ON CONFLICT (dj_id, fan_id) DO UPDATE SET
                vip      = COALESCE(?3, vip),
                blocked  = COALESCE(?4, blocked),
                archived = COALESCE(?5, archived)",
            params![
                dj_id,
                fan_id,
                vip.map(|v| v as i32),
                blocked.map(|b| b as i32),
                archived.map(|a| a as i32),
            ],
        )?;
        Ok(())
    }

    pub fn archive_dj(&self, dj_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO dj_stat (dj_id, archived) VALUES (?1, 1)
             ON CONFLICT (dj_id) DO UPDATE SET archived = 1",
            params![dj_id],
        )?;
        Ok(())
    }
}
