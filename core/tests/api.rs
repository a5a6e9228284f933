//! Integration tests for the operation envelope.

use serde_json::{json, Value};
use songbid_core::{
    api::{self, ApiResponse},
    engine::SettlementEngine,
};

fn build() -> SettlementEngine {
    SettlementEngine::build_test().expect("build_test failed")
}

fn call(engine: &SettlementEngine, command: Value) -> ApiResponse {
    api::handle_line(engine, &command.to_string())
}

fn create(engine: &SettlementEngine, fan: &str, amount: i64) -> String {
    let response = call(
        engine,
        json!({
            "op": "request.create",
            "requester_id": fan,
            "dj_id": "dj-d",
            "song": { "title": "Go", "artist": "Moby" },
            "amount": amount,
        }),
    );
    assert!(response.ok, "create failed: {response:?}");
    response.data.unwrap()["request_id"].as_str().unwrap().to_string()
}

#[test]
fn create_and_accept_return_data_envelopes() {
    let engine = build();
    let id = create(&engine, "fan-r", 500);

    let accepted = call(&engine, json!({ "op": "request.accept", "request_id": id, "actor_id": "dj-d" }));
    assert!(accepted.ok);
    assert!(accepted.error.is_none());
    let data = accepted.data.unwrap();
    assert_eq!(data["request"]["status"], "accepted");
    assert_eq!(data["replayed"], false);
    assert_eq!(data["ledger_entries"].as_array().unwrap().len(), 2);

    let again = call(&engine, json!({ "op": "request.accept", "request_id": id, "actor_id": "dj-d" }));
    assert_eq!(again.data.unwrap()["replayed"], true);

    let balance = call(&engine, json!({ "op": "account.balance", "id": "dj-d" }));
    assert_eq!(balance.data.unwrap(), json!({ "available": 500, "held": 0 }));
}

#[test]
fn errors_map_to_stable_codes() {
    let engine = build();
    let id = create(&engine, "fan-r", 500);

    let cases = [
        (
            json!({ "op": "request.create", "requester_id": "fan-r", "dj_id": "dj-d",
                    "song": { "title": "Go", "artist": "Moby" }, "amount": 0 }),
            "invalid_amount",
        ),
        (json!({ "op": "request.accept", "request_id": "missing", "actor_id": "dj-d" }), "not_found"),
        (json!({ "op": "request.accept", "request_id": id, "actor_id": "fan-r" }), "forbidden"),
        (json!({ "op": "account.payout", "dj_id": "dj-d", "amount": 10 }), "insufficient_funds"),
        (json!({ "op": "request.teleport" }), "invalid_input"),
    ];
    for (command, code) in cases {
        let response = call(&engine, command.clone());
        assert!(!response.ok, "{command} should fail");
        assert!(response.data.is_none());
        assert_eq!(response.error_code(), Some(code), "{command}");
    }

    call(&engine, json!({ "op": "request.reject", "request_id": id, "actor_id": "dj-d" }));
    let late = call(&engine, json!({ "op": "request.cancel", "request_id": id, "actor_id": "fan-r" }));
    assert_eq!(late.error_code(), Some("invalid_transition"));
}

#[test]
fn malformed_json_is_invalid_input() {
    let engine = build();
    let response = api::handle_line(&engine, "{ not json");
    assert_eq!(response.error_code(), Some("invalid_input"));
}

#[test]
fn stats_operations_read_after_flush() {
    let engine = build();
    for (fan, amount) in [("fan-1", 300), ("fan-2", 700)] {
        let id = create(&engine, fan, amount);
        call(&engine, json!({ "op": "request.accept", "request_id": id, "actor_id": "dj-d" }));
    }
    engine.flush();

    let dj = call(&engine, json!({ "op": "stats.dj", "id": "dj-d" })).data.unwrap();
    assert_eq!(dj["accepted_count"], 2);
    assert_eq!(dj["total_earnings"], 1_000);

    let fan = call(&engine, json!({ "op": "stats.fan", "id": "fan-2" })).data.unwrap();
    assert_eq!(fan[0]["total_spent"], 700);

    let top = call(&engine, json!({ "op": "stats.top_fans", "dj_id": "dj-d", "limit": 1 })).data.unwrap();
    assert_eq!(top.as_array().unwrap().len(), 1);
    assert_eq!(top[0]["fan_id"], "fan-2");

    let rebuilt = call(&engine, json!({ "op": "stats.rebuild", "id": "dj-d" })).data.unwrap();
    assert_eq!(rebuilt["dj"]["total_earnings"], 1_000);

    let audit = call(&engine, json!({ "op": "ledger.audit" })).data.unwrap();
    assert_eq!(audit, json!([]));
}

#[test]
fn envelope_serializes_without_empty_fields() {
    let ok = serde_json::to_value(ApiResponse::success(json!(1))).unwrap();
    assert_eq!(ok, json!({ "ok": true, "data": 1 }));

    let err = serde_json::to_value(ApiResponse::failure("not_found", "nope")).unwrap();
    assert_eq!(err, json!({ "ok": false, "error": { "code": "not_found", "message": "nope" } }));
}

#[test]
fn event_feed_pages_through_the_log() {
    let engine = build();
    let id = create(&engine, "fan-r", 500);
    call(&engine, json!({ "op": "request.accept", "request_id": id, "actor_id": "dj-d" }));

    let page = call(&engine, json!({ "op": "events.since", "after": 0, "limit": 1 })).data.unwrap();
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["event_type"], "request_created");

    let cursor = page[0]["seq"].as_i64().unwrap();
    let rest = call(&engine, json!({ "op": "events.since", "after": cursor })).data.unwrap();
    assert_eq!(rest.as_array().unwrap().len(), 1);
    assert_eq!(rest[0]["event_type"], "request_accepted");
}
