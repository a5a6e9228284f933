//! Integration tests for the ledger store.
//!
//! Covers:
//! 1. Ledger writes outside a unit of work are refused
//! 2. Entries are immutable at the schema level
//! 3. A failed unit of work leaves nothing behind
//! 4. Payouts respect the available balance
//! 5. The conservation audit catches tampering

use songbid_core::{
    clock::{Clock, ManualClock},
    engine::SettlementEngine,
    error::EngineError,
    ledger::{Balance, EntryKind, LedgerEntry},
    request::{NewRequest, SongRef},
};
use std::cell::Cell;

fn build() -> SettlementEngine {
    SettlementEngine::build_test().expect("build_test failed")
}

fn bid(fan: &str, dj: &str, amount: i64) -> NewRequest {
    NewRequest {
        requester_id: fan.into(),
        dj_id:        dj.into(),
        song:         SongRef::new("Music Sounds Better With You", "Stardust"),
        amount,
        message:      None,
    }
}

fn entry_count(engine: &SettlementEngine) -> i64 {
    engine.store().session(|s| s.ledger_entry_count()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: LedgerWriteConflict
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn append_outside_unit_of_work_is_a_conflict() {
    let engine = build();
    let now = ManualClock::at_epoch().now();
    let entry = LedgerEntry::payout("dj-d", 100, now);

    let err = engine
        .store()
        .session(|s| s.append_entries(&[entry.clone()]))
        .unwrap_err();
    assert!(matches!(err, EngineError::LedgerWriteConflict));
    assert_eq!(err.code(), "internal");
    assert_eq!(entry_count(&engine), 0);

    // The same append inside a unit of work goes through.
    engine
        .store()
        .unit_of_work(|s| s.append_entries(&[entry]), |_| {})
        .unwrap();
    assert_eq!(entry_count(&engine), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: immutability
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn entries_cannot_be_updated_or_deleted() {
    let engine = build();
    engine.create(bid("fan-r", "dj-d", 500)).unwrap();

    let update = engine
        .store()
        .unit_of_work(|s| s.execute_raw("UPDATE ledger_entry SET amount = 1"), |_| {});
    assert!(matches!(update, Err(EngineError::Database(_))), "got {update:?}");

    let delete = engine
        .store()
        .unit_of_work(|s| s.execute_raw("DELETE FROM ledger_entry"), |_| {});
    assert!(matches!(delete, Err(EngineError::Database(_))), "got {delete:?}");

    assert_eq!(entry_count(&engine), 1);
    assert_eq!(engine.balance_of("fan-r").unwrap().held, 500);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: atomicity
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn failed_unit_of_work_rolls_back_and_skips_after_commit() {
    let engine = build();
    let now = ManualClock::at_epoch().now();
    let hook_ran = Cell::new(false);

    let outcome: Result<(), EngineError> = engine.store().unit_of_work(
        |s| {
            s.append_entries(&[LedgerEntry::payout("dj-d", 100, now)])?;
            Err(EngineError::InvalidInput("abort after write".into()))
        },
        |_| hook_ran.set(true),
    );

    assert!(outcome.is_err());
    assert!(!hook_ran.get());
    assert_eq!(entry_count(&engine), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: payouts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn payout_draws_down_available_earnings() {
    let engine = build();
    let r = engine.create(bid("fan-r", "dj-d", 800)).unwrap();
    engine.accept(&r.request_id, "dj-d").unwrap();

    let entry = engine.payout("dj-d", 300).unwrap();
    assert_eq!(entry.kind, EntryKind::Payout);
    assert_eq!(entry.amount, -300);
    assert!(entry.request_id.is_none());

    assert_eq!(engine.balance_of("dj-d").unwrap(), Balance { available: 500, held: 0 });
}

#[test]
fn payout_beyond_available_is_refused() {
    let engine = build();
    let r = engine.create(bid("fan-r", "dj-d", 800)).unwrap();
    engine.accept(&r.request_id, "dj-d").unwrap();

    let err = engine.payout("dj-d", 801).unwrap_err();
    assert!(
        matches!(err, EngineError::InsufficientFunds { available: 800, requested: 801, .. }),
        "got {err:?}"
    );
    assert_eq!(engine.balance_of("dj-d").unwrap().available, 800);

    let err = engine.payout("dj-d", 0).unwrap_err();
    assert_eq!(err.code(), "invalid_amount");
}

#[test]
fn pending_bids_are_not_payable() {
    let engine = build();
    engine.create(bid("fan-r", "dj-d", 800)).unwrap();
    let err = engine.payout("dj-d", 1).unwrap_err();
    assert_eq!(err.code(), "insufficient_funds");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: audit
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn audit_is_clean_for_engine_written_history() {
    let engine = build();
    let a = engine.create(bid("fan-1", "dj-d", 100)).unwrap();
    let b = engine.create(bid("fan-2", "dj-d", 200)).unwrap();
    let c = engine.create(bid("fan-1", "dj-d", 300)).unwrap();
    engine.create(bid("fan-2", "dj-d", 400)).unwrap();
    engine.accept(&a.request_id, "dj-d").unwrap();
    engine.reject(&b.request_id, "dj-d").unwrap();
    engine.cancel(&c.request_id, "fan-1").unwrap();
    engine.payout("dj-d", 50).unwrap();

    assert!(engine.audit().unwrap().is_empty());
}

#[test]
fn audit_flags_a_request_with_an_extra_entry() {
    let engine = build();
    engine.create(bid("fan-1", "dj-d", 100)).unwrap();
    let bad = engine.create(bid("fan-2", "dj-d", 200)).unwrap();
    let now = ManualClock::at_epoch().now();

    // A release for a still-pending request, written behind the engine's back.
    let request = engine.request(&bad.request_id).unwrap();
    engine
        .store()
        .unit_of_work(|s| s.append_entries(&[LedgerEntry::release(&request, now)]), |_| {})
        .unwrap();

    assert_eq!(engine.audit().unwrap(), vec![bad.request_id]);
}
