//! Ledger entries and the balance fold.
//!
//! RULE: Entries are immutable. Balances are never stored; they are
//! always folded from the entries of one account.
//!
//! Fold rules for one account:
//!   - HOLD with a CAPTURE for the same request  → consumed, counts 0
//!   - HOLD with a RELEASE for the same request  → counts toward available
//!                                                 (the RELEASE offsets it)
//!   - open HOLD                                 → counts toward available,
//!                                                 magnitude counts as held
//!   - CAPTURE, RELEASE, PAYOUT                  → count toward available

use crate::{
    request::{Request, RequestStatus},
    types::{AccountId, MinorUnits, RequestId, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Hold,
    Capture,
    Release,
    Payout,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hold    => "hold",
            Self::Capture => "capture",
            Self::Release => "release",
            Self::Payout  => "payout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Hold, Self::Capture, Self::Release, Self::Payout]
            .into_iter()
            .find(|kind| kind.as_str() == s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_id:   String,
    pub request_id: Option<RequestId>,
    pub account_id: AccountId,
    pub kind:       EntryKind,
    pub amount:     MinorUnits,
    pub created_at: Timestamp,
}

impl LedgerEntry {
    fn new(
        request_id: Option<&str>,
        account_id: &str,
        kind:       EntryKind,
        amount:     MinorUnits,
        at:         Timestamp,
    ) -> Self {
        Self {
            entry_id:   Uuid::new_v4().to_string(),
            request_id: request_id.map(str::to_string),
            account_id: account_id.to_string(),
            kind,
            amount,
            created_at: at,
        }
    }

    /// Reserve the bid on the requester's side.
    pub fn hold(request: &Request, at: Timestamp) -> Self {
        Self::new(
            Some(&request.request_id),
            &request.requester_id,
            EntryKind::Hold,
            -request.amount,
            at,
        )
    }

    /// Consume the hold and credit the DJ. Requester side first.
    pub fn capture_pair(request: &Request, at: Timestamp) -> [Self; 2] {
        [
            Self::new(
                Some(&request.request_id),
                &request.requester_id,
                EntryKind::Capture,
                -request.amount,
                at,
            ),
            Self::new(
                Some(&request.request_id),
                &request.dj_id,
                EntryKind::Capture,
                request.amount,
                at,
            ),
        ]
    }

    /// Reverse the hold back to the requester.
    pub fn release(request: &Request, at: Timestamp) -> Self {
        Self::new(
            Some(&request.request_id),
            &request.requester_id,
            EntryKind::Release,
            request.amount,
            at,
        )
    }

    /// Withdraw `amount` of earnings from a DJ account.
    pub fn payout(account_id: &str, amount: MinorUnits, at: Timestamp) -> Self {
        Self::new(None, account_id, EntryKind::Payout, -amount, at)
    }
}

/// Derived view of one account.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    pub available: MinorUnits,
    pub held:      MinorUnits,
}

/// Requests whose HOLD on `account_id` has been closed by `kind`.
fn closed_by(entries: &[LedgerEntry], account_id: &str, kind: EntryKind) -> HashSet<String> {
    entries
        .iter()
        .filter(|e| e.account_id == account_id && e.kind == kind)
        .filter_map(|e| e.request_id.clone())
        .collect()
}

/// Fold every entry belonging to `account_id` into a balance.
/// Entries for other accounts are ignored.
pub fn fold_balance(account_id: &str, entries: &[LedgerEntry]) -> Balance {
    let captured = closed_by(entries, account_id, EntryKind::Capture);
    let released = closed_by(entries, account_id, EntryKind::Release);

    let mut balance = Balance::default();
    for entry in entries.iter().filter(|e| e.account_id == account_id) {
        match entry.kind {
            EntryKind::Hold => {
                let request = entry.request_id.as_deref().unwrap_or_default();
                if captured.contains(request) {
                    continue;
                }
                balance.available += entry.amount;
                if !released.contains(request) {
                    balance.held -= entry.amount;
                }
            }
            EntryKind::Capture | EntryKind::Release | EntryKind::Payout => {
                balance.available += entry.amount;
            }
        }
    }
    balance
}

/// Net effect of one request's entries per account, with consumed
/// HOLDs counted as zero.
pub fn net_by_account(entries: &[LedgerEntry]) -> BTreeMap<AccountId, MinorUnits> {
    let mut net = BTreeMap::new();
    for entry in entries {
        let consumed = entry.kind == EntryKind::Hold
            && entries.iter().any(|other| {
                other.kind == EntryKind::Capture
                    && other.account_id == entry.account_id
                    && other.request_id == entry.request_id
            });
        let amount = if consumed { 0 } else { entry.amount };
        *net.entry(entry.account_id.clone()).or_insert(0) += amount;
    }
    net
}

/// Check the conservation invariant for one request.
///
/// Pending: requester −amount (the open hold). Accepted: requester
/// −amount, DJ +amount. Rejected or cancelled: both sides zero.
pub fn check_conservation(request: &Request, entries: &[LedgerEntry]) -> bool {
    if entries
        .iter()
        .any(|e| e.request_id.as_deref() != Some(request.request_id.as_str()))
    {
        return false;
    }

    let holds = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Hold && e.account_id == request.requester_id)
        .count();
    if holds != 1 {
        return false;
    }

    let net = net_by_account(entries);
    let requester = net.get(&request.requester_id).copied().unwrap_or(0);
    let dj = net.get(&request.dj_id).copied().unwrap_or(0);
    let others_touched = net
        .keys()
        .any(|account| account != &request.requester_id && account != &request.dj_id);
    if others_touched {
        return false;
    }

    match request.status {
        RequestStatus::Pending => requester == -request.amount && dj == 0,
        RequestStatus::Accepted => requester == -request.amount && dj == request.amount,
        RequestStatus::Rejected | RequestStatus::Cancelled => requester == 0 && dj == 0,
    }
}
