//! Settlement engine: the one place where money moves.
//!
//! RULES:
//!   - Every state change commits as one unit of work: request row,
//!     ledger entries and event row together, or none of them.
//!   - A decision holds the per-request lock for its whole duration and
//!     writes the status behind an optimistic version check.
//!   - Stats and notifications never run inside the unit of work. They
//!     are handed to the dispatcher after commit, and replays hand over
//!     nothing.
//!   - Collaborators (clock, funding source, emitter) are injected.

use crate::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    dispatcher::{Dispatcher, Job, PostCommit},
    error::{EngineError, EngineResult},
    event::{EngineEvent, EventLogEntry},
    funding::{Authorization, FundingSource, OpenFunding},
    ledger::{check_conservation, Balance, EntryKind, LedgerEntry},
    locks::KeyedLocks,
    notification::{LogEmitter, NotificationEmitter},
    request::{self, Action, NewRequest, Request, RequestStatus, Transition},
    stats::StatsAggregator,
    store::SettlementStore,
    types::{MinorUnits, RequestId},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Outcome of `settle`. For a replay, `ledger_entries` are the entries
/// the original decision wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementResult {
    pub request:        Request,
    pub ledger_entries: Vec<LedgerEntry>,
    pub replayed:       bool,
}

/// The event describing `request` in its current status.
fn event_for(request: &Request) -> EngineEvent {
    let request_id = request.request_id.clone();
    let requester_id = request.requester_id.clone();
    let dj_id = request.dj_id.clone();
    let amount = request.amount;
    match request.status {
        RequestStatus::Pending   => EngineEvent::RequestCreated { request_id, requester_id, dj_id, amount },
        RequestStatus::Accepted  => EngineEvent::RequestAccepted { request_id, requester_id, dj_id, amount },
        RequestStatus::Rejected  => EngineEvent::RequestRejected { request_id, requester_id, dj_id, amount },
        RequestStatus::Cancelled => EngineEvent::RequestCancelled { request_id, requester_id, dj_id, amount },
    }
}

// ── Builder ───────────────────────────────────────────────────────

pub struct EngineBuilder {
    store:   Arc<SettlementStore>,
    config:  EngineConfig,
    clock:   Arc<dyn Clock>,
    funding: Arc<dyn FundingSource>,
    emitter: Arc<dyn NotificationEmitter>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn funding(mut self, funding: Arc<dyn FundingSource>) -> Self {
        self.funding = funding;
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn NotificationEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Wire the aggregator and start the dispatcher thread. The store
    /// must already be migrated.
    pub fn build(self) -> EngineResult<SettlementEngine> {
        self.config.validate()?;
        let stats = Arc::new(StatsAggregator::new(self.store.clone()));
        let dispatcher = Dispatcher::spawn(stats.clone(), self.emitter, &self.config)?;
        Ok(SettlementEngine {
            store:   self.store,
            locks:   KeyedLocks::new(),
            clock:   self.clock,
            funding: self.funding,
            stats,
            dispatcher,
            config:  self.config,
        })
    }
}

// ── Engine ────────────────────────────────────────────────────────

pub struct SettlementEngine {
    store:      Arc<SettlementStore>,
    locks:      KeyedLocks,
    clock:      Arc<dyn Clock>,
    funding:    Arc<dyn FundingSource>,
    stats:      Arc<StatsAggregator>,
    dispatcher: Dispatcher,
    config:     EngineConfig,
}

impl SettlementEngine {
    /// Start from defaults: system clock, open funding, log emitter.
    pub fn builder(store: Arc<SettlementStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            config:  EngineConfig::default(),
            clock:   Arc::new(SystemClock),
            funding: Arc::new(OpenFunding),
            emitter: Arc::new(LogEmitter),
        }
    }

    /// In-memory, migrated, retry delays zeroed. Used by tests.
    pub fn build_test() -> EngineResult<Self> {
        Self::test_builder()?.build()
    }

    /// As `build_test`, leaving collaborators open for overriding.
    pub fn test_builder() -> EngineResult<EngineBuilder> {
        let store = SettlementStore::in_memory()?;
        store.migrate()?;
        Ok(Self::builder(Arc::new(store)).config(EngineConfig::default_test()))
    }

    // ── Create ────────────────────────────────────────────────────

    /// Open a PENDING request and place its HOLD.
    pub fn create(&self, new: NewRequest) -> EngineResult<Request> {
        new.validate(self.config.max_bid_amount)?;
        if self.stats.is_blocked(&new.dj_id, &new.requester_id)? {
            return Err(EngineError::Blocked {
                dj_id:  new.dj_id,
                fan_id: new.requester_id,
            });
        }
        if let Authorization::Declined { reason } =
            self.funding.authorize(&new.requester_id, new.amount)?
        {
            log::info!("bid of {} by {} declined: {reason}", new.amount, new.requester_id);
            return Err(EngineError::PaymentDeclined {
                account_id: new.requester_id,
                reason,
            });
        }

        let now = self.clock.now();
        let pending = request::open(new, Uuid::new_v4().to_string(), now)?;
        let event = event_for(&pending);

        let (created, _) = self.store.unit_of_work(
            |s| {
                s.insert_request(&pending)?;
                s.append_entries(&[LedgerEntry::hold(&pending, now)])?;
                let seq = s.append_event(&EventLogEntry::from_event(&event, now)?)?;
                Ok((pending, seq))
            },
            |(created, seq)| {
                self.dispatcher.enqueue(Job {
                    work:  PostCommit::Created(created.clone()),
                    event: event.clone(),
                    seq:   *seq,
                })
            },
        )?;
        log::debug!(
            "request {} created: {} -> {} for {}",
            created.request_id,
            created.requester_id,
            created.dj_id,
            created.amount
        );
        Ok(created)
    }

    // ── Settle ────────────────────────────────────────────────────

    pub fn settle(
        &self,
        request_id: &str,
        actor_id:   &str,
        action:     Action,
    ) -> EngineResult<SettlementResult> {
        self.locks.with_lock(request_id, || {
            let mut attempt = 0;
            loop {
                match self.decide(request_id, actor_id, action) {
                    Err(EngineError::StaleVersion { expected, .. })
                        if attempt < self.config.max_stale_retries =>
                    {
                        attempt += 1;
                        log::warn!(
                            "{action} on {request_id} lost version {expected}; re-running (attempt {attempt})"
                        );
                    }
                    outcome => return outcome,
                }
            }
        })
    }

    pub fn accept(&self, request_id: &str, dj_id: &str) -> EngineResult<SettlementResult> {
        self.settle(request_id, dj_id, Action::Accept)
    }

    pub fn reject(&self, request_id: &str, dj_id: &str) -> EngineResult<SettlementResult> {
        self.settle(request_id, dj_id, Action::Reject)
    }

    pub fn cancel(&self, request_id: &str, requester_id: &str) -> EngineResult<SettlementResult> {
        self.settle(request_id, requester_id, Action::Cancel)
    }

    /// One attempt at a decision, as a single unit of work.
    fn decide(
        &self,
        request_id: &str,
        actor_id:   &str,
        action:     Action,
    ) -> EngineResult<SettlementResult> {
        let (result, _) = self.store.unit_of_work(
            |s| {
                let current = s.load_request(request_id)?;
                let now = self.clock.now();
                match request::transition(&current, actor_id, action, now)? {
                    Transition::Replay => {
                        let ledger_entries = s
                            .entries_for_request(request_id)?
                            .into_iter()
                            .filter(|e| e.kind != EntryKind::Hold)
                            .collect();
                        let replay = SettlementResult { request: current, ledger_entries, replayed: true };
                        Ok((replay, None))
                    }
                    Transition::Apply(next) => {
                        s.update_request_status(&next)?;
                        let ledger_entries = match action {
                            Action::Accept => LedgerEntry::capture_pair(&next, now).to_vec(),
                            Action::Reject | Action::Cancel => vec![LedgerEntry::release(&next, now)],
                        };
                        s.append_entries(&ledger_entries)?;
                        let seq = s.append_event(&EventLogEntry::from_event(&event_for(&next), now)?)?;
                        let applied = SettlementResult { request: next, ledger_entries, replayed: false };
                        Ok((applied, Some(seq)))
                    }
                }
            },
            |(result, seq)| {
                let Some(seq) = *seq else {
                    log::debug!("{action} on {request_id} replayed");
                    return;
                };
                log::debug!("request {request_id} settled as {}", result.request.status);
                self.dispatcher.enqueue(Job {
                    work:  PostCommit::Settled(result.clone()),
                    event: event_for(&result.request),
                    seq,
                });
            },
        )?;
        Ok(result)
    }

    // ── Payout ────────────────────────────────────────────────────

    /// Withdraw `amount` from a DJ's available balance.
    pub fn payout(&self, dj_id: &str, amount: MinorUnits) -> EngineResult<LedgerEntry> {
        if amount <= 0 {
            return Err(EngineError::InvalidAmount {
                amount,
                reason: "payout must be greater than zero".into(),
            });
        }
        let event = EngineEvent::PayoutIssued { account_id: dj_id.to_string(), amount };
        self.locks.with_lock(&format!("payout:{dj_id}"), || {
            self.store.unit_of_work(
                |s| {
                    let balance = s.balance_of(dj_id)?;
                    if amount > balance.available {
                        return Err(EngineError::InsufficientFunds {
                            account_id: dj_id.to_string(),
                            available:  balance.available,
                            requested:  amount,
                        });
                    }
                    let now = self.clock.now();
                    let entry = LedgerEntry::payout(dj_id, amount, now);
                    s.append_entries(std::slice::from_ref(&entry))?;
                    let seq = s.append_event(&EventLogEntry::from_event(&event, now)?)?;
                    Ok((entry, seq))
                },
                |(entry, seq)| {
                    log::debug!("payout of {amount} to {dj_id} committed");
                    self.dispatcher.enqueue(Job {
                        work:  PostCommit::PaidOut(entry.clone()),
                        event: event.clone(),
                        seq:   *seq,
                    });
                },
            )
        })
        .map(|(entry, _)| entry)
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn request(&self, request_id: &str) -> EngineResult<Request> {
        self.store.session(|s| s.load_request(request_id))
    }

    /// A DJ's requests, oldest first.
    pub fn inbox(&self, dj_id: &str, status: Option<RequestStatus>) -> EngineResult<Vec<Request>> {
        self.store.session(|s| s.requests_for_dj(dj_id, status))
    }

    pub fn requests_by_fan(&self, fan_id: &str) -> EngineResult<Vec<Request>> {
        self.store.session(|s| s.requests_for_fan(fan_id))
    }

    pub fn ledger_for_request(&self, request_id: &str) -> EngineResult<Vec<LedgerEntry>> {
        self.store.session(|s| {
            s.load_request(request_id)?;
            s.entries_for_request(request_id)
        })
    }

    pub fn balance_of(&self, account_id: &str) -> EngineResult<Balance> {
        self.store.session(|s| s.balance_of(account_id))
    }

    pub fn events_for_request(&self, request_id: &str) -> EngineResult<Vec<EngineEvent>> {
        self.store.session(|s| {
            s.events_for_request(request_id)?
                .iter()
                .map(|entry| entry.event().map_err(EngineError::from))
                .collect()
        })
    }

    /// Committed events after log position `after`, oldest first. Lets
    /// a consumer that missed notifications catch up from the log.
    pub fn events_since(&self, after: i64, limit: usize) -> EngineResult<Vec<EventLogEntry>> {
        self.store.session(|s| s.events_since(after, limit))
    }

    /// Requests whose ledger entries break conservation. Empty when healthy.
    pub fn audit(&self) -> EngineResult<Vec<RequestId>> {
        let violations = self.store.session(|s| {
            let mut violations = Vec::new();
            for request in s.all_requests()? {
                let entries = s.entries_for_request(&request.request_id)?;
                if !check_conservation(&request, &entries) {
                    violations.push(request.request_id);
                }
            }
            Ok(violations)
        })?;
        for request_id in &violations {
            log::error!("conservation violated for request {request_id}");
        }
        Ok(violations)
    }

    // ── Plumbing ──────────────────────────────────────────────────

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn store(&self) -> &Arc<SettlementStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Block until every committed outcome has had its side effects.
    pub fn flush(&self) {
        self.dispatcher.flush();
    }

    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        self.dispatcher.flush_timeout(timeout)
    }

    /// Post-commit jobs not yet processed: the bound on stats lag.
    pub fn queue_depth(&self) -> usize {
        self.dispatcher.depth()
    }
}
