//! Notification emitter: the outbound collaborator.
//!
//! RULE: Emitters are only ever called after commit, from the
//! dispatcher thread. A failed emit is retried and then dropped;
//! it never touches the settlement that produced it.

use crate::{
    event::EngineEvent,
    types::{AccountId, RequestId},
};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub event_type:  String,
    pub request_id:  Option<RequestId>,
    pub account_ids: Vec<AccountId>,
}

impl From<&EngineEvent> for Notification {
    fn from(event: &EngineEvent) -> Self {
        Self {
            event_type:  event.type_name().to_string(),
            request_id:  event.request_id().map(str::to_string),
            account_ids: event.account_ids(),
        }
    }
}

pub trait NotificationEmitter: Send + Sync {
    fn emit(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes each notification to the log. Default for the runner.
#[derive(Debug, Default)]
pub struct LogEmitter;

impl NotificationEmitter for LogEmitter {
    fn emit(&self, n: &Notification) -> anyhow::Result<()> {
        log::info!(
            "notify {} request={} accounts={}",
            n.event_type,
            n.request_id.as_deref().unwrap_or("-"),
            n.account_ids.join(",")
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopEmitter;

impl NotificationEmitter for NoopEmitter {
    fn emit(&self, _notification: &Notification) -> anyhow::Result<()> {
        Ok(())
    }
}
