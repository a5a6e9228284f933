//! Engine events: the audit trail of every committed outcome.
//!
//! RULE: An event row is written in the same unit of work as the
//! state change it describes. No event exists for a rolled-back change.
//! Variants are append-only.

use crate::types::{AccountId, MinorUnits, RequestId, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RequestCreated {
        request_id:   RequestId,
        requester_id: AccountId,
        dj_id:        AccountId,
        amount:       MinorUnits,
    },
    RequestAccepted {
        request_id:   RequestId,
        requester_id: AccountId,
        dj_id:        AccountId,
        amount:       MinorUnits,
    },
    RequestRejected {
        request_id:   RequestId,
        requester_id: AccountId,
        dj_id:        AccountId,
        amount:       MinorUnits,
    },
    RequestCancelled {
        request_id:   RequestId,
        requester_id: AccountId,
        dj_id:        AccountId,
        amount:       MinorUnits,
    },
    PayoutIssued {
        account_id: AccountId,
        amount:     MinorUnits,
    },
}

impl EngineEvent {
    /// Stable name for the `event_type` column and for notifications.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. }   => "request_created",
            Self::RequestAccepted { .. }  => "request_accepted",
            Self::RequestRejected { .. }  => "request_rejected",
            Self::RequestCancelled { .. } => "request_cancelled",
            Self::PayoutIssued { .. }     => "payout_issued",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestCreated { request_id, .. }
            | Self::RequestAccepted { request_id, .. }
            | Self::RequestRejected { request_id, .. }
            | Self::RequestCancelled { request_id, .. } => Some(request_id),
            Self::PayoutIssued { .. } => None,
        }
    }

    /// Every account the event concerns, requester first.
    pub fn account_ids(&self) -> Vec<AccountId> {
        match self {
            Self::RequestCreated { requester_id, dj_id, .. }
            | Self::RequestAccepted { requester_id, dj_id, .. }
            | Self::RequestRejected { requester_id, dj_id, .. }
            | Self::RequestCancelled { requester_id, dj_id, .. } => {
                vec![requester_id.clone(), dj_id.clone()]
            }
            Self::PayoutIssued { account_id, .. } => vec![account_id.clone()],
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub seq:        Option<i64>,
    pub request_id: Option<RequestId>,
    pub event_type: String,
    pub payload:    String, // JSON-serialized EngineEvent
    pub created_at: Timestamp,
}

impl EventLogEntry {
    pub fn from_event(event: &EngineEvent, at: Timestamp) -> serde_json::Result<Self> {
        Ok(Self {
            seq:        None,
            request_id: event.request_id().map(str::to_string),
            event_type: event.type_name().to_string(),
            payload:    serde_json::to_string(event)?,
            created_at: at,
        })
    }

    pub fn event(&self) -> serde_json::Result<EngineEvent> {
        serde_json::from_str(&self.payload)
    }
}
