//! Operation surface: one tagged command in, one envelope out.
//!
//! RULE: Framing is the caller's business. This module only maps
//! commands to engine calls and errors to stable codes.
//! Variants are append-only; renaming an `op` breaks clients.

use crate::{
    engine::SettlementEngine,
    error::{EngineError, EngineResult},
    request::{NewRequest, RequestStatus},
    stats::FanQuery,
    types::{AccountId, MinorUnits, RequestId},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ApiCommand {
    // ── Requests ──────────────────────────────────
    #[serde(rename = "request.create")]
    CreateRequest(NewRequest),
    #[serde(rename = "request.accept")]
    AcceptRequest { request_id: RequestId, actor_id: AccountId },
    #[serde(rename = "request.reject")]
    RejectRequest { request_id: RequestId, actor_id: AccountId },
    #[serde(rename = "request.cancel")]
    CancelRequest { request_id: RequestId, actor_id: AccountId },
    #[serde(rename = "request.get")]
    GetRequest { request_id: RequestId },
    #[serde(rename = "request.inbox")]
    Inbox {
        dj_id:  AccountId,
        #[serde(default)]
        status: Option<RequestStatus>,
    },

    // ── Stats ─────────────────────────────────────
    #[serde(rename = "stats.fan")]
    FanStats { id: AccountId },
    #[serde(rename = "stats.dj")]
    DjStats { id: AccountId },
    #[serde(rename = "stats.top_fans")]
    TopFans {
        dj_id: AccountId,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    #[serde(rename = "stats.query_fans")]
    QueryFans {
        dj_id: AccountId,
        #[serde(default)]
        query: FanQuery,
    },
    #[serde(rename = "stats.set_fan_flags")]
    SetFanFlags {
        dj_id:   AccountId,
        fan_id:  AccountId,
        #[serde(default)]
        vip:     Option<bool>,
        #[serde(default)]
        blocked: Option<bool>,
    },
    #[serde(rename = "stats.rebuild")]
    RebuildStats { id: AccountId },

    // ── Accounts ──────────────────────────────────
    #[serde(rename = "account.balance")]
    Balance { id: AccountId },
    #[serde(rename = "account.payout")]
    Payout { dj_id: AccountId, amount: MinorUnits },
    #[serde(rename = "ledger.audit")]
    Audit,
    #[serde(rename = "events.since")]
    EventsSince {
        #[serde(default)]
        after: i64,
        #[serde(default = "default_limit")]
        limit: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub code:    String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub ok:    bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data:  Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    pub fn success(data: Value) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok:    false,
            data:  None,
            error: Some(ApiError { code: code.to_string(), message: message.into() }),
        }
    }

    /// Internal failures are logged in full and reported without detail.
    pub fn from_error(err: &EngineError) -> Self {
        if err.is_user_facing() {
            return Self::failure(err.code(), err.to_string());
        }
        log::error!("internal error: {err}");
        Self::failure(err.code(), "internal error")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Parse one JSON command and run it.
pub fn handle_line(engine: &SettlementEngine, line: &str) -> ApiResponse {
    match serde_json::from_str::<ApiCommand>(line) {
        Ok(command) => handle(engine, command),
        Err(e) => ApiResponse::failure("invalid_input", format!("malformed command: {e}")),
    }
}

pub fn handle(engine: &SettlementEngine, command: ApiCommand) -> ApiResponse {
    match dispatch(engine, command) {
        Ok(data) => ApiResponse::success(data),
        Err(err) => ApiResponse::from_error(&err),
    }
}

fn dispatch(engine: &SettlementEngine, command: ApiCommand) -> EngineResult<Value> {
    let data = match command {
        ApiCommand::CreateRequest(new) => serde_json::to_value(engine.create(new)?)?,
        ApiCommand::AcceptRequest { request_id, actor_id } => {
            serde_json::to_value(engine.accept(&request_id, &actor_id)?)?
        }
        ApiCommand::RejectRequest { request_id, actor_id } => {
            serde_json::to_value(engine.reject(&request_id, &actor_id)?)?
        }
        ApiCommand::CancelRequest { request_id, actor_id } => {
            serde_json::to_value(engine.cancel(&request_id, &actor_id)?)?
        }
        ApiCommand::GetRequest { request_id } => serde_json::to_value(engine.request(&request_id)?)?,
        ApiCommand::Inbox { dj_id, status } => serde_json::to_value(engine.inbox(&dj_id, status)?)?,
        ApiCommand::FanStats { id } => serde_json::to_value(engine.stats().fan_stats(&id)?)?,
        ApiCommand::DjStats { id } => serde_json::to_value(engine.stats().dj_stat(&id)?)?,
        ApiCommand::TopFans { dj_id, limit } => {
            serde_json::to_value(engine.stats().top_fans(&dj_id, limit)?)?
        }
        ApiCommand::QueryFans { dj_id, query } => {
            serde_json::to_value(engine.stats().query_fans(&dj_id, &query)?)?
        }
        ApiCommand::SetFanFlags { dj_id, fan_id, vip, blocked } => {
            serde_json::to_value(engine.stats().set_fan_flags(&dj_id, &fan_id, vip, blocked)?)?
        }
        ApiCommand::RebuildStats { id } => serde_json::to_value(engine.stats().rebuild(&id)?)?,
        ApiCommand::Balance { id } => serde_json::to_value(engine.balance_of(&id)?)?,
        ApiCommand::Payout { dj_id, amount } => serde_json::to_value(engine.payout(&dj_id, amount)?)?,
        ApiCommand::Audit => serde_json::to_value(engine.audit()?)?,
        ApiCommand::EventsSince { after, limit } => {
            serde_json::to_value(engine.events_since(after, limit)?)?
        }
    };
    Ok(data)
}
