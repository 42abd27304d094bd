//! Read-only seam onto loan state (§4.6, §4.7, §4.8). The loan aggregate
//! itself — balances, status, payment policy flags — is owned by the
//! broader servicing platform, out of scope for this engine (§1); this
//! trait is the minimal read view the validation consumer, classifier, and
//! allocation consumer need from it.

use async_trait::async_trait;

use crate::policy::{LoanContext, LoanStatus};

/// Balances the allocation waterfall draws against, as last known by the
/// servicing platform (escrow balances are owned here instead, in
/// `loanserve-storage::escrow`, since escrow is part of this engine's model).
#[derive(Debug, Clone, Copy, Default)]
pub struct LoanBalances {
    pub late_fee_balance: i64,
    pub accrued_interest: i64,
    pub principal_balance: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LoanSnapshot {
    pub status: LoanStatus,
    pub days_past_due: i64,
    pub balances: LoanBalances,
    pub accept_partial_payments: bool,
}

impl LoanSnapshot {
    pub fn context(&self) -> LoanContext {
        LoanContext {
            status: self.status,
            days_past_due: self.days_past_due,
        }
    }

    pub fn accepts_payments(&self) -> bool {
        !matches!(self.status, LoanStatus::PaidOff | LoanStatus::ChargedOff)
    }
}

#[async_trait]
pub trait LoanDirectory: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn lookup(&self, loan_id: &str) -> Result<Option<LoanSnapshot>, Self::Error>;
}
