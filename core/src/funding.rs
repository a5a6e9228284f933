//! Funding source: the payment-gateway collaborator.
//!
//! Consulted once per bid, before the unit of work opens, so a slow
//! or failing gateway never holds a database transaction.

use crate::types::{AccountId, MinorUnits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Approved,
    Declined { reason: String },
}

pub trait FundingSource: Send + Sync {
    fn authorize(&self, account_id: &AccountId, amount: MinorUnits) -> anyhow::Result<Authorization>;
}

/// Approves everything. Used when no gateway is wired in.
#[derive(Debug, Default)]
pub struct OpenFunding;

impl FundingSource for OpenFunding {
    fn authorize(&self, _account_id: &AccountId, _amount: MinorUnits) -> anyhow::Result<Authorization> {
        Ok(Authorization::Approved)
    }
}
