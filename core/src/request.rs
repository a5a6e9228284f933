//! Song request lifecycle.
//!
//! PENDING ──ACCEPT (dj)──────▶ ACCEPTED
//!    │ ────REJECT (dj)──────▶ REJECTED
//!    └─────CANCEL (requester)▶ CANCELLED
//!
//! RULE: No other edges exist. Terminal states never change.
//! Everything in this module is pure; persistence and fund movement
//! live in the engine.

use crate::{
    error::{EngineError, EngineResult},
    types::{AccountId, MinorUnits, RequestId, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        Self::Pending,
        Self::Accepted,
        Self::Rejected,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending   => "pending",
            Self::Accepted  => "accepted",
            Self::Rejected  => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Accept,
    Reject,
    Cancel,
}

impl Action {
    /// The terminal status this action leads to from PENDING.
    pub fn target(&self) -> RequestStatus {
        match self {
            Self::Accept => RequestStatus::Accepted,
            Self::Reject => RequestStatus::Rejected,
            Self::Cancel => RequestStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was requested. Catalog lookup is somebody else's problem;
/// the core only carries the reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SongRef {
    pub title:       String,
    pub artist:      String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl SongRef {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title:       title.into(),
            artist:      artist.into(),
            external_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub request_id:   RequestId,
    pub requester_id: AccountId,
    pub dj_id:        AccountId,
    pub song:         SongRef,
    pub amount:       MinorUnits,
    pub message:      Option<String>,
    pub status:       RequestStatus,
    pub created_at:   Timestamp,
    pub decided_at:   Option<Timestamp>,
    /// Bumped on every status write; used as the optimistic lock.
    pub version:      i64,
}

impl Request {
    /// The account that owns the right to perform `action`.
    pub fn authorized_actor(&self, action: Action) -> &str {
        match action {
            Action::Accept | Action::Reject => &self.dj_id,
            Action::Cancel                  => &self.requester_id,
        }
    }

    /// Apply an already-validated transition.
    fn apply(&mut self, to: RequestStatus, at: Timestamp) {
        self.status = to;
        self.decided_at = Some(at);
        self.version += 1;
    }
}

/// Input for a new bid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub requester_id: AccountId,
    pub dj_id:        AccountId,
    pub song:         SongRef,
    pub amount:       MinorUnits,
    #[serde(default)]
    pub message:      Option<String>,
}

impl NewRequest {
    /// Reject bad input before anything touches the store.
    pub fn validate(&self, max_bid: Option<MinorUnits>) -> EngineResult<()> {
        if self.amount <= 0 {
            return Err(EngineError::InvalidAmount {
                amount: self.amount,
                reason: "bid must be greater than zero".into(),
            });
        }
        if let Some(max) = max_bid {
            if self.amount > max {
                return Err(EngineError::InvalidAmount {
                    amount: self.amount,
                    reason: format!("bid exceeds the maximum of {max}"),
                });
            }
        }
        if self.requester_id.is_empty() || self.dj_id.is_empty() {
            return Err(EngineError::InvalidInput("requester and dj ids are required".into()));
        }
        if self.requester_id == self.dj_id {
            return Err(EngineError::InvalidInput("a DJ cannot bid on their own set".into()));
        }
        if self.song.title.trim().is_empty() {
            return Err(EngineError::InvalidInput("song title is required".into()));
        }
        Ok(())
    }
}

/// Build a PENDING request. The caller is responsible for writing the
/// matching HOLD in the same unit of work.
pub fn open(new: NewRequest, request_id: RequestId, now: Timestamp) -> EngineResult<Request> {
    new.validate(None)?;
    Ok(Request {
        request_id,
        requester_id: new.requester_id,
        dj_id:        new.dj_id,
        song:         new.song,
        amount:       new.amount,
        message:      new.message,
        status:       RequestStatus::Pending,
        created_at:   now,
        decided_at:   None,
        version:      0,
    })
}

/// Outcome of validating an action against a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The edge is legal; the request has moved to `request.status`.
    Apply(Request),
    /// The request already sits in the state this action leads to.
    Replay,
}

/// Validate `action` by `actor_id` against `request` and, if legal,
/// return the updated request.
///
/// Authorization is checked before state, so an unauthorized actor
/// always gets `Forbidden`, even on a terminal request.
pub fn transition(
    request:  &Request,
    actor_id: &str,
    action:   Action,
    now:      Timestamp,
) -> EngineResult<Transition> {
    if request.authorized_actor(action) != actor_id {
        return Err(EngineError::Forbidden {
            request_id: request.request_id.clone(),
            actor_id:   actor_id.to_string(),
            action,
        });
    }

    match request.status {
        RequestStatus::Pending => {
            let mut next = request.clone();
            next.apply(action.target(), now);
            Ok(Transition::Apply(next))
        }
        status if status == action.target() => Ok(Transition::Replay),
        status => Err(EngineError::InvalidTransition {
            request_id: request.request_id.clone(),
            status,
            action,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn pending() -> Request {
        let clock = ManualClock::at_epoch();
        open(
            NewRequest {
                requester_id: "fan-1".into(),
                dj_id:        "dj-1".into(),
                song:         SongRef::new("Blue Monday", "New Order"),
                amount:       500,
                message:      None,
            },
            "req-1".into(),
            clock.now(),
        )
        .unwrap()
    }

    #[test]
    fn every_action_leads_from_pending_to_its_target() {
        for (action, actor) in [
            (Action::Accept, "dj-1"),
            (Action::Reject, "dj-1"),
            (Action::Cancel, "fan-1"),
        ] {
            let req = pending();
            let now = req.created_at;
            match transition(&req, actor, action, now).unwrap() {
                Transition::Apply(next) => {
                    assert_eq!(next.status, action.target());
                    assert_eq!(next.decided_at, Some(now));
                    assert_eq!(next.version, 1);
                }
                Transition::Replay => panic!("pending request cannot replay"),
            }
        }
    }

    #[test]
    fn wrong_actor_is_forbidden() {
        let req = pending();
        let now = req.created_at;
        assert!(matches!(
            transition(&req, "fan-1", Action::Accept, now),
            Err(EngineError::Forbidden { .. })
        ));
        assert!(matches!(
            transition(&req, "dj-1", Action::Cancel, now),
            Err(EngineError::Forbidden { .. })
        ));
    }

    #[test]
    fn terminal_state_replays_same_action_and_rejects_others() {
        let req = pending();
        let now = req.created_at;
        let accepted = match transition(&req, "dj-1", Action::Accept, now).unwrap() {
            Transition::Apply(next) => next,
            Transition::Replay => unreachable!(),
        };

        assert_eq!(
            transition(&accepted, "dj-1", Action::Accept, now).unwrap(),
            Transition::Replay
        );
        assert!(matches!(
            transition(&accepted, "dj-1", Action::Reject, now),
            Err(EngineError::InvalidTransition { status: RequestStatus::Accepted, .. })
        ));
        assert!(matches!(
            transition(&accepted, "fan-1", Action::Cancel, now),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        for amount in [0, -1, -500] {
            let new = NewRequest {
                requester_id: "fan-1".into(),
                dj_id:        "dj-1".into(),
                song:         SongRef::new("Song", "Artist"),
                amount,
                message:      None,
            };
            assert!(matches!(new.validate(None), Err(EngineError::InvalidAmount { .. })));
        }
    }

    #[test]
    fn max_bid_is_enforced() {
        let new = NewRequest {
            requester_id: "fan-1".into(),
            dj_id:        "dj-1".into(),
            song:         SongRef::new("Song", "Artist"),
            amount:       10_001,
            message:      None,
        };
        assert!(new.validate(Some(10_000)).is_err());
        assert!(new.validate(Some(10_001)).is_ok());
    }

    #[test]
    fn dj_cannot_bid_on_own_set() {
        let new = NewRequest {
            requester_id: "dj-1".into(),
            dj_id:        "dj-1".into(),
            song:         SongRef::new("Song", "Artist"),
            amount:       100,
            message:      None,
        };
        assert!(matches!(new.validate(None), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn status_round_trips_through_its_storage_name() {
        for status in RequestStatus::ALL {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("settled"), None);
    }
}
