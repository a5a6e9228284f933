//! Statistics aggregator: fan and DJ summaries.
//!
//! RULE: The stat tables are a cache. The ledger and the request table
//! are the truth; `rebuild` can regenerate every counter from them at
//! any time, and must agree with the incremental path.
//!
//! RULE: Only the dispatcher thread applies incremental updates, in
//! commit order. Reads may happen from anywhere.
//!
//! RULE: Every incremental update carries the event-log seq of its
//! commit. A rebuild stamps each row it writes with the newest seq it
//! saw, and updates at or below that stamp are skipped, so a rebuild
//! may run while updates for the same rows are still queued.
//!
//! Derived definitions (both paths):
//!   fan last_active = max(created_at of its requests to the DJ,
//!                         decided_at of the ones it cancelled)
//!   dj  last_active = max(decided_at of accepted/rejected requests,
//!                         created_at of its payouts)

use crate::{
    engine::SettlementResult,
    error::EngineResult,
    ledger::LedgerEntry,
    request::{Request, RequestStatus},
    store::{Session, SettlementStore},
    types::{AccountId, MinorUnits, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanStat {
    pub dj_id:           AccountId,
    pub fan_id:          AccountId,
    pub total_requests:  i64,
    pub pending_count:   i64,
    pub accepted_count:  i64,
    pub rejected_count:  i64,
    pub cancelled_count: i64,
    pub total_spent:     MinorUnits,
    pub last_active_at:  Option<Timestamp>,
    pub vip:             bool,
    pub blocked:         bool,
    pub archived:        bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DjStat {
    pub dj_id:           AccountId,
    pub total_requests:  i64,
    pub pending_count:   i64,
    pub accepted_count:  i64,
    pub rejected_count:  i64,
    pub cancelled_count: i64,
    pub total_earnings:  MinorUnits,
    pub total_paid_out:  MinorUnits,
    pub last_active_at:  Option<Timestamp>,
    pub archived:        bool,
}

/// Every stat row that touches one account: its DJ row, if it has
/// ever acted as a DJ, and each (dj, fan) row where it is either side.
/// `fans` is ordered by (dj_id, fan_id).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStats {
    pub dj:   Option<DjStat>,
    pub fans: Vec<FanStat>,
}

/// Signed change to one `fan_stat` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanDelta {
    pub dj_id:     AccountId,
    pub fan_id:    AccountId,
    pub requests:  i64,
    pub pending:   i64,
    pub accepted:  i64,
    pub rejected:  i64,
    pub cancelled: i64,
    pub spent:     MinorUnits,
    pub active_at: Option<Timestamp>,
}

/// Signed change to one `dj_stat` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DjDelta {
    pub dj_id:     AccountId,
    pub requests:  i64,
    pub pending:   i64,
    pub accepted:  i64,
    pub rejected:  i64,
    pub cancelled: i64,
    pub earnings:  MinorUnits,
    pub paid_out:  MinorUnits,
    pub active_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FanSort {
    #[default]
    Spend,
    LastActive,
    Requests,
}

/// Read-side filter over one DJ's fans. `None` means "don't care".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanQuery {
    /// Only fans with at least one request in this status.
    #[serde(default)]
    pub status:           Option<RequestStatus>,
    #[serde(default)]
    pub vip:              Option<bool>,
    #[serde(default)]
    pub blocked:          Option<bool>,
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default)]
    pub sort:             FanSort,
    #[serde(default)]
    pub limit:            Option<usize>,
}

fn status_deltas(status: RequestStatus) -> (i64, i64, i64) {
    match status {
        RequestStatus::Accepted  => (1, 0, 0),
        RequestStatus::Rejected  => (0, 1, 0),
        RequestStatus::Cancelled => (0, 0, 1),
        RequestStatus::Pending   => (0, 0, 0),
    }
}

/// Deltas for a freshly created (PENDING) request.
pub fn deltas_for_created(request: &Request) -> (FanDelta, DjDelta) {
    (
        FanDelta {
            dj_id:     request.dj_id.clone(),
            fan_id:    request.requester_id.clone(),
            requests:  1,
            pending:   1,
            active_at: Some(request.created_at),
            ..FanDelta::default()
        },
        DjDelta {
            dj_id:    request.dj_id.clone(),
            requests: 1,
            pending:  1,
            ..DjDelta::default()
        },
    )
}

/// Deltas for a committed (non-replayed) settlement.
pub fn deltas_for_settlement(result: &SettlementResult) -> (FanDelta, DjDelta) {
    let request = &result.request;
    let (accepted, rejected, cancelled) = status_deltas(request.status);
    let captured = if request.status == RequestStatus::Accepted { request.amount } else { 0 };
    let fan_active = match request.status {
        RequestStatus::Cancelled => request.decided_at,
        _ => None,
    };
    let dj_active = match request.status {
        RequestStatus::Accepted | RequestStatus::Rejected => request.decided_at,
        _ => None,
    };
    (
        FanDelta {
            dj_id:     request.dj_id.clone(),
            fan_id:    request.requester_id.clone(),
            pending:   -1,
            accepted,
            rejected,
            cancelled,
            spent:     captured,
            active_at: fan_active,
            ..FanDelta::default()
        },
        DjDelta {
            dj_id:     request.dj_id.clone(),
            pending:   -1,
            accepted,
            rejected,
            cancelled,
            earnings:  captured,
            active_at: dj_active,
            ..DjDelta::default()
        },
    )
}

/// Delta for a committed payout entry.
pub fn delta_for_payout(entry: &LedgerEntry) -> DjDelta {
    DjDelta {
        dj_id:     entry.account_id.clone(),
        paid_out:  -entry.amount,
        active_at: Some(entry.created_at),
        ..DjDelta::default()
    }
}

pub struct StatsAggregator {
    store: Arc<SettlementStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<SettlementStore>) -> Self {
        Self { store }
    }

    // ── Incremental path ──────────────────────────────────────────

    pub fn on_created(&self, request: &Request, seq: i64) -> EngineResult<()> {
        let (fan, dj) = deltas_for_created(request);
        self.apply(&fan, &dj, seq)
    }

    pub fn on_settlement(&self, result: &SettlementResult, seq: i64) -> EngineResult<()> {
        if result.replayed {
            return Ok(());
        }
        let (fan, dj) = deltas_for_settlement(result);
        self.apply(&fan, &dj, seq)
    }

    pub fn on_payout(&self, entry: &LedgerEntry, seq: i64) -> EngineResult<()> {
        let dj = delta_for_payout(entry);
        self.store.unit_of_work(|s| s.apply_dj_delta(&dj, seq), |_| {})
    }

    /// Both rows change together or not at all, so a retried update
    /// never double-counts one side.
    fn apply(&self, fan: &FanDelta, dj: &DjDelta, seq: i64) -> EngineResult<()> {
        self.store.unit_of_work(
            |s| {
                s.apply_fan_delta(fan, seq)?;
                s.apply_dj_delta(dj, seq)
            },
            |_| {},
        )
    }

    // ── Rebuild path ──────────────────────────────────────────────

    /// Recompute every row touching `account_id` from requests and
    /// ledger, without writing. Flags come from the stored rows.
    pub fn compute(&self, account_id: &str) -> EngineResult<AccountStats> {
        self.store.session(|s| recompute(s, account_id))
    }

    /// Recompute and overwrite every row touching `account_id`. Read and
    /// write share one transaction, so no incremental update lands between.
    /// Updates still queued for commits the rebuild already saw are
    /// skipped when the dispatcher reaches them.
    pub fn rebuild(&self, account_id: &str) -> EngineResult<AccountStats> {
        let (stats, through) = self.store.unit_of_work(
            |s| {
                let through = s.last_event_seq()?;
                let stats = recompute(s, account_id)?;
                for fan in &stats.fans {
                    s.write_fan_stat(fan, through)?;
                }
                if let Some(dj) = &stats.dj {
                    s.write_dj_stat(dj, through)?;
                }
                Ok((stats, through))
            },
            |_| {},
        )?;
        log::debug!(
            "rebuilt stats for {account_id} through event {through}: {} fan rows, dj row: {}",
            stats.fans.len(),
            stats.dj.is_some()
        );
        Ok(stats)
    }

    /// Rows as currently stored, same shape as `compute`.
    pub fn stored(&self, account_id: &str) -> EngineResult<AccountStats> {
        self.store.session(|s| s.stats_touching(account_id))
    }

    /// Drift check: true when the stored rows match a fresh recompute.
    pub fn verify(&self, account_id: &str) -> EngineResult<bool> {
        let stored = self.stored(account_id)?;
        let computed = self.compute(account_id)?;
        if stored != computed {
            log::warn!("stat drift detected for {account_id}");
            return Ok(false);
        }
        Ok(true)
    }

    // ── Read side ─────────────────────────────────────────────────

    /// One row per DJ the fan has bid on.
    pub fn fan_stats(&self, fan_id: &str) -> EngineResult<Vec<FanStat>> {
        self.store.session(|s| s.fan_stats_for_fan(fan_id))
    }

    pub fn fan_stat(&self, dj_id: &str, fan_id: &str) -> EngineResult<Option<FanStat>> {
        self.store.session(|s| s.fan_stat(dj_id, fan_id))
    }

    pub fn dj_stat(&self, dj_id: &str) -> EngineResult<Option<DjStat>> {
        self.store.session(|s| s.dj_stat(dj_id))
    }

    pub fn query_fans(&self, dj_id: &str, query: &FanQuery) -> EngineResult<Vec<FanStat>> {
        self.store.session(|s| s.query_fans(dj_id, query))
    }

    /// Biggest spenders first; ties broken by accepted count, then id.
    /// Fans who never had a request accepted are left out.
    pub fn top_fans(&self, dj_id: &str, limit: usize) -> EngineResult<Vec<FanStat>> {
        let query = FanQuery { sort: FanSort::Spend, ..FanQuery::default() };
        let mut fans = self.query_fans(dj_id, &query)?;
        fans.retain(|f| f.total_spent > 0);
        fans.truncate(limit);
        Ok(fans)
    }

    // ── DJ annotations ────────────────────────────────────────────

    pub fn set_fan_flags(
        &self,
        dj_id:   &str,
        fan_id:  &str,
        vip:     Option<bool>,
        blocked: Option<bool>,
    ) -> EngineResult<FanStat> {
        self.store.session(|s| {
            s.set_fan_flags(dj_id, fan_id, vip, blocked, None)?;
            Ok(s.fan_stat(dj_id, fan_id)?.unwrap_or_default())
        })
    }

    pub fn archive_fan(&self, dj_id: &str, fan_id: &str) -> EngineResult<()> {
        self.store.session(|s| s.set_fan_flags(dj_id, fan_id, None, None, Some(true)))
    }

    pub fn archive_dj(&self, dj_id: &str) -> EngineResult<()> {
        self.store.session(|s| s.archive_dj(dj_id))
    }

    pub fn is_blocked(&self, dj_id: &str, fan_id: &str) -> EngineResult<bool> {
        Ok(self.fan_stat(dj_id, fan_id)?.is_some_and(|f| f.blocked))
    }
}

fn recompute(s: &Session<'_>, account_id: &str) -> EngineResult<AccountStats> {
    let stored = s.stats_touching(account_id)?;
    let mut fans = s.compute_fan_stats(account_id)?;
    for fan in &mut fans {
        if let Some(prev) = stored
            .fans
            .iter()
            .find(|p| p.dj_id == fan.dj_id && p.fan_id == fan.fan_id)
        {
            fan.vip = prev.vip;
            fan.blocked = prev.blocked;
            fan.archived = prev.archived;
        }
    }
    // Annotation-only rows (e.g. blocked before any bid) have no
    // history behind them; they recompute to zero counters.
    for prev in &stored.fans {
        if !fans.iter().any(|f| f.dj_id == prev.dj_id && f.fan_id == prev.fan_id) {
            fans.push(FanStat {
                dj_id:    prev.dj_id.clone(),
                fan_id:   prev.fan_id.clone(),
                vip:      prev.vip,
                blocked:  prev.blocked,
                archived: prev.archived,
                ..FanStat::default()
            });
        }
    }
    fans.sort_by(|a, b| (&a.dj_id, &a.fan_id).cmp(&(&b.dj_id, &b.fan_id)));

    let dj = match s.compute_dj_stat(account_id)? {
        Some(mut dj) => {
            if let Some(prev) = &stored.dj {
                dj.archived = prev.archived;
            }
            Some(dj)
        }
        None => stored.dj.map(|prev| DjStat {
            dj_id:    prev.dj_id,
            archived: prev.archived,
            ..DjStat::default()
        }),
    };
    Ok(AccountStats { dj, fans })
}
