//! Integration tests for the statistics aggregator.
//!
//! Covers:
//! 1. Incremental counters after each kind of outcome
//! 2. Rebuild reproduces the incremental rows for a random history
//! 3. Drift is detected and repaired
//! 4. DJ flags survive a rebuild; blocked fans cannot bid
//! 5. Ranking and filtering
//! 6. Rebuilds while post-commit updates are still queued

use chrono::Duration;
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use songbid_core::{
    clock::{Clock, ManualClock},
    engine::SettlementEngine,
    notification::{Notification, NotificationEmitter},
    request::{NewRequest, RequestStatus, SongRef},
    stats::{FanQuery, FanSort},
};
use std::sync::{Arc, Condvar, Mutex};

fn build_with_clock() -> (SettlementEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let engine = SettlementEngine::test_builder()
        .unwrap()
        .clock(clock.clone())
        .build()
        .unwrap();
    (engine, clock)
}

fn bid(fan: &str, dj: &str, amount: i64) -> NewRequest {
    NewRequest {
        requester_id: fan.into(),
        dj_id:        dj.into(),
        song:         SongRef::new("Levels", "Avicii"),
        amount,
        message:      None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: incremental counters
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn counters_follow_each_outcome() {
    let (engine, clock) = build_with_clock();
    let a = engine.create(bid("fan-1", "dj-d", 500)).unwrap();
    let b = engine.create(bid("fan-1", "dj-d", 200)).unwrap();
    let c = engine.create(bid("fan-1", "dj-d", 100)).unwrap();
    engine.create(bid("fan-1", "dj-d", 50)).unwrap();

    clock.advance(Duration::seconds(30));
    engine.accept(&a.request_id, "dj-d").unwrap();
    engine.reject(&b.request_id, "dj-d").unwrap();
    clock.advance(Duration::seconds(30));
    engine.cancel(&c.request_id, "fan-1").unwrap();
    engine.accept(&a.request_id, "dj-d").unwrap(); // replay: no double count
    engine.flush();

    let fan = engine.stats().fan_stat("dj-d", "fan-1").unwrap().unwrap();
    assert_eq!(fan.total_requests, 4);
    assert_eq!(fan.pending_count, 1);
    assert_eq!(fan.accepted_count, 1);
    assert_eq!(fan.rejected_count, 1);
    assert_eq!(fan.cancelled_count, 1);
    assert_eq!(fan.total_spent, 500);
    assert_eq!(fan.last_active_at, Some(clock.now()));

    let dj = engine.stats().dj_stat("dj-d").unwrap().unwrap();
    assert_eq!(dj.total_requests, 4);
    assert_eq!(dj.pending_count, 1);
    assert_eq!(dj.accepted_count, 1);
    assert_eq!(dj.rejected_count, 1);
    assert_eq!(dj.cancelled_count, 1);
    assert_eq!(dj.total_earnings, 500);
    assert_eq!(dj.total_paid_out, 0);

    clock.advance(Duration::seconds(5));
    engine.payout("dj-d", 120).unwrap();
    engine.flush();
    let dj = engine.stats().dj_stat("dj-d").unwrap().unwrap();
    assert_eq!(dj.total_paid_out, 120);
    assert_eq!(dj.last_active_at, Some(clock.now()));
}

#[test]
fn fan_stats_list_one_row_per_dj() {
    let (engine, _clock) = build_with_clock();
    engine.create(bid("fan-1", "dj-a", 100)).unwrap();
    engine.create(bid("fan-1", "dj-b", 100)).unwrap();
    engine.create(bid("fan-1", "dj-b", 100)).unwrap();
    engine.flush();

    let rows = engine.stats().fan_stats("fan-1").unwrap();
    let summary: Vec<(&str, i64)> = rows.iter().map(|r| (r.dj_id.as_str(), r.total_requests)).collect();
    assert_eq!(summary, vec![("dj-a", 1), ("dj-b", 2)]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: rebuild equivalence
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rebuild_matches_incremental_for_random_history() {
    for seed in [1u128, 7, 42, 1337] {
        let (engine, clock) = build_with_clock();
        let mut rng = Pcg64Mcg::new(seed);
        let fans = ["fan-0", "fan-1", "fan-2", "fan-3"];
        let djs = ["dj-a", "dj-b"];
        let mut pending: Vec<(String, String, String)> = Vec::new();

        for _ in 0..80 {
            clock.advance(Duration::milliseconds(rng.gen_range(1..5_000)));
            let roll: f64 = rng.gen();
            if roll < 0.45 || pending.is_empty() {
                let fan = fans[rng.gen_range(0..fans.len())];
                let dj = djs[rng.gen_range(0..djs.len())];
                let r = engine.create(bid(fan, dj, rng.gen_range(1..100) * 25)).unwrap();
                pending.push((r.request_id, fan.to_string(), dj.to_string()));
            } else if roll < 0.9 {
                let (id, fan, dj) = pending.swap_remove(rng.gen_range(0..pending.len()));
                match rng.gen_range(0..3) {
                    0 => engine.accept(&id, &dj).unwrap(),
                    1 => engine.reject(&id, &dj).unwrap(),
                    _ => engine.cancel(&id, &fan).unwrap(),
                };
            } else {
                let dj = djs[rng.gen_range(0..djs.len())];
                let available = engine.balance_of(dj).unwrap().available;
                if available > 0 {
                    engine.payout(dj, rng.gen_range(1..=available)).unwrap();
                }
            }
            if rng.gen_bool(0.05) {
                let fan = fans[rng.gen_range(0..fans.len())];
                engine.stats().set_fan_flags(djs[0], fan, Some(true), None).unwrap();
            }
        }
        engine.flush();

        for account in fans.iter().chain(djs.iter()) {
            let stored = engine.stats().stored(account).unwrap();
            let computed = engine.stats().compute(account).unwrap();
            assert_eq!(stored, computed, "seed {seed}, account {account}");
            assert_eq!(engine.stats().rebuild(account).unwrap(), stored);
            assert!(engine.stats().verify(account).unwrap());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: drift
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn verify_detects_drift_and_rebuild_repairs_it() {
    let (engine, _clock) = build_with_clock();
    let r = engine.create(bid("fan-1", "dj-d", 900)).unwrap();
    engine.accept(&r.request_id, "dj-d").unwrap();
    engine.flush();
    assert!(engine.stats().verify("dj-d").unwrap());

    engine
        .store()
        .session(|s| s.execute_raw("UPDATE fan_stat SET total_spent = 0, accepted_count = 7"))
        .unwrap();
    assert!(!engine.stats().verify("dj-d").unwrap());

    let rebuilt = engine.stats().rebuild("fan-1").unwrap();
    assert_eq!(rebuilt.fans[0].total_spent, 900);
    assert_eq!(rebuilt.fans[0].accepted_count, 1);
    assert!(engine.stats().verify("dj-d").unwrap());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: flags
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn flags_survive_rebuild() {
    let (engine, _clock) = build_with_clock();
    engine.create(bid("fan-1", "dj-d", 100)).unwrap();
    engine.flush();

    engine.stats().set_fan_flags("dj-d", "fan-1", Some(true), None).unwrap();
    engine.stats().set_fan_flags("dj-d", "fan-quiet", None, Some(true)).unwrap();
    engine.stats().archive_fan("dj-d", "fan-1").unwrap();
    engine.stats().archive_dj("dj-d").unwrap();

    let rebuilt = engine.stats().rebuild("dj-d").unwrap();
    let fan = rebuilt.fans.iter().find(|f| f.fan_id == "fan-1").unwrap();
    assert!(fan.vip && fan.archived && !fan.blocked);
    assert_eq!(fan.total_requests, 1);

    let quiet = rebuilt.fans.iter().find(|f| f.fan_id == "fan-quiet").unwrap();
    assert!(quiet.blocked);
    assert_eq!(quiet.total_requests, 0);

    assert!(rebuilt.dj.unwrap().archived);
    assert!(engine.stats().verify("dj-d").unwrap());
}

#[test]
fn blocked_fan_cannot_bid() {
    let (engine, _clock) = build_with_clock();
    engine.stats().set_fan_flags("dj-d", "fan-troll", None, Some(true)).unwrap();

    let err = engine.create(bid("fan-troll", "dj-d", 100)).unwrap_err();
    assert_eq!(err.code(), "forbidden");
    assert_eq!(engine.store().session(|s| s.ledger_entry_count()).unwrap(), 0);

    // Other DJs are unaffected, and unblocking restores access.
    assert!(engine.create(bid("fan-troll", "dj-other", 100)).is_ok());
    engine.stats().set_fan_flags("dj-d", "fan-troll", None, Some(false)).unwrap();
    assert!(engine.create(bid("fan-troll", "dj-d", 100)).is_ok());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: ranking and filters
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn top_fans_rank_by_spend_then_accepted_count() {
    let (engine, _clock) = build_with_clock();
    let spend = |fan: &str, amounts: &[i64]| {
        for &amount in amounts {
            let r = engine.create(bid(fan, "dj-d", amount)).unwrap();
            engine.accept(&r.request_id, "dj-d").unwrap();
        }
    };
    spend("fan-big", &[1_000]);
    spend("fan-steady", &[250, 250, 250, 250]);
    spend("fan-small", &[100]);
    engine.create(bid("fan-pending", "dj-d", 5_000)).unwrap();
    engine.flush();

    let top = engine.stats().top_fans("dj-d", 10).unwrap();
    let order: Vec<&str> = top.iter().map(|f| f.fan_id.as_str()).collect();
    // Equal spend: more accepted requests ranks higher. No spend, no rank.
    assert_eq!(order, vec!["fan-steady", "fan-big", "fan-small"]);

    let top2 = engine.stats().top_fans("dj-d", 2).unwrap();
    assert_eq!(top2.len(), 2);
}

#[test]
fn query_fans_filters_and_sorts() {
    let (engine, clock) = build_with_clock();
    for fan in ["fan-1", "fan-2", "fan-3"] {
        clock.advance(Duration::seconds(1));
        engine.create(bid(fan, "dj-d", 100)).unwrap();
    }
    let r = engine.create(bid("fan-1", "dj-d", 100)).unwrap();
    engine.reject(&r.request_id, "dj-d").unwrap();
    engine.flush();
    engine.stats().set_fan_flags("dj-d", "fan-2", Some(true), None).unwrap();
    engine.stats().archive_fan("dj-d", "fan-3").unwrap();

    let stats = engine.stats();
    let ids = |q: FanQuery| -> Vec<String> {
        stats.query_fans("dj-d", &q).unwrap().into_iter().map(|f| f.fan_id).collect()
    };

    assert_eq!(ids(FanQuery::default()), vec!["fan-1", "fan-2"]);
    assert_eq!(
        ids(FanQuery { include_archived: true, ..FanQuery::default() }).len(),
        3
    );
    assert_eq!(ids(FanQuery { vip: Some(true), ..FanQuery::default() }), vec!["fan-2"]);
    assert_eq!(
        ids(FanQuery { status: Some(RequestStatus::Rejected), ..FanQuery::default() }),
        vec!["fan-1"]
    );
    assert_eq!(
        ids(FanQuery {
            sort: FanSort::LastActive,
            include_archived: true,
            ..FanQuery::default()
        }),
        vec!["fan-1", "fan-3", "fan-2"]
    );
    assert_eq!(
        ids(FanQuery { sort: FanSort::Requests, limit: Some(1), ..FanQuery::default() }),
        vec!["fan-1"]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: rebuild vs queued updates
// ─────────────────────────────────────────────────────────────────────────────

/// Parks the dispatcher inside its first notification until opened,
/// so every later post-commit job stays queued.
#[derive(Default)]
struct Gate {
    open:    Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }
}

impl NotificationEmitter for Gate {
    fn emit(&self, _n: &Notification) -> anyhow::Result<()> {
        let open = self.open.lock().unwrap();
        let _open = self.changed.wait_while(open, |open| !*open).unwrap();
        Ok(())
    }
}

fn build_gated() -> (SettlementEngine, Arc<Gate>) {
    let gate = Arc::new(Gate::default());
    let engine = SettlementEngine::test_builder()
        .unwrap()
        .emitter(gate.clone())
        .build()
        .unwrap();
    (engine, gate)
}

#[test]
fn rebuild_with_updates_queued_counts_each_commit_once() {
    let (engine, gate) = build_gated();
    let a = engine.create(bid("fan-1", "dj-d", 400)).unwrap();
    engine.create(bid("fan-2", "dj-d", 250)).unwrap();
    engine.accept(&a.request_id, "dj-d").unwrap();
    engine.payout("dj-d", 100).unwrap();
    let queued = engine.queue_depth();

    let rebuilt = engine.stats().rebuild("dj-d").unwrap();
    gate.open();
    engine.flush();

    assert_eq!(queued, 4);
    assert_eq!(rebuilt.dj.as_ref().unwrap().total_requests, 2);

    let dj = engine.stats().dj_stat("dj-d").unwrap().unwrap();
    assert_eq!(dj.total_requests, 2);
    assert_eq!(dj.pending_count, 1);
    assert_eq!(dj.accepted_count, 1);
    assert_eq!(dj.total_earnings, 400);
    assert_eq!(dj.total_paid_out, 100);

    let fan = engine.stats().fan_stat("dj-d", "fan-1").unwrap().unwrap();
    assert_eq!(fan.total_requests, 1);
    assert_eq!(fan.total_spent, 400);

    for account in ["dj-d", "fan-1", "fan-2"] {
        assert!(engine.stats().verify(account).unwrap(), "{account}");
    }
}

#[test]
fn rebuilding_one_fan_leaves_queued_dj_updates_to_apply() {
    let (engine, gate) = build_gated();
    let a = engine.create(bid("fan-1", "dj-d", 300)).unwrap();
    engine.accept(&a.request_id, "dj-d").unwrap();
    engine.create(bid("fan-2", "dj-d", 200)).unwrap();

    // Only the (dj-d, fan-1) row is rebuilt; the DJ row still depends
    // on the queue.
    engine.stats().rebuild("fan-1").unwrap();
    gate.open();
    engine.flush();

    let dj = engine.stats().dj_stat("dj-d").unwrap().unwrap();
    assert_eq!(dj.total_requests, 2);
    assert_eq!(dj.accepted_count, 1);
    assert_eq!(dj.total_earnings, 300);

    let fan = engine.stats().fan_stat("dj-d", "fan-1").unwrap().unwrap();
    assert_eq!(fan.total_requests, 1);
    assert_eq!(fan.accepted_count, 1);
    assert_eq!(fan.pending_count, 0);
    assert!(engine.stats().verify("dj-d").unwrap());
}

#[test]
fn stats_update_that_keeps_failing_is_repaired_by_rebuild() {
    let (engine, gate) = build_gated();
    let a = engine.create(bid("fan-1", "dj-d", 500)).unwrap();
    engine.accept(&a.request_id, "dj-d").unwrap();

    // Incremental writes never move rebuilt_through_seq; a rebuild
    // always does. So from here on every incremental update of an
    // existing DJ row fails and only the rebuild can write it.
    engine
        .store()
        .session(|s| {
            s.execute_raw(
                "CREATE TRIGGER dj_stat_incremental_fails BEFORE UPDATE ON dj_stat
                 WHEN NEW.rebuilt_through_seq = OLD.rebuilt_through_seq
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
            )
        })
        .unwrap();
    engine.create(bid("fan-2", "dj-d", 300)).unwrap();

    gate.open();
    engine.flush();

    let dj = engine.stats().dj_stat("dj-d").unwrap().unwrap();
    assert_eq!(dj.total_requests, 2);
    assert_eq!(dj.pending_count, 1);
    assert_eq!(dj.accepted_count, 1);
    assert_eq!(dj.total_earnings, 500);

    let fan = engine.stats().fan_stat("dj-d", "fan-1").unwrap().unwrap();
    assert_eq!(fan.accepted_count, 1);
    assert_eq!(fan.total_spent, 500);

    // The settlement itself was never in question.
    assert_eq!(engine.balance_of("dj-d").unwrap().available, 500);
    for account in ["dj-d", "fan-1", "fan-2"] {
        assert!(engine.stats().verify(account).unwrap(), "{account}");
    }
}
