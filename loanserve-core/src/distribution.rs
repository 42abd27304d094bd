//! Distribution engine math (C9, §4.9).
//!
//! Pro-rata investor split with largest-remainder rounding, applied
//! independently to the distributable amount and to the servicing fee pool.
//! Pure function; `loanserve-worker` is responsible for loading the
//! effective investor position set and persisting the resulting rows.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SERVICING_BPS: i64 = 25;
const BPS_DENOMINATOR: i64 = 10_000;

/// `(loan_id, investor_id, pct_bps, effective_from)` — §3 Investor position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestorPosition {
    pub investor_id: String,
    pub pct_bps: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestorShare {
    pub investor_id: String,
    pub amount_cents: i64,
    pub servicing_fee_cents: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistributionError {
    #[error("investor positions must sum to 10000 bps, got {0}")]
    PositionsDoNotSumToWhole(i64),
    #[error("interest or principal must be >= 0 (interest={interest}, principal={principal})")]
    NegativeComponent { interest: i64, principal: i64 },
}

/// `servicing_fee = floor(interest * servicing_bps / 10_000)` (§4.9).
pub fn servicing_fee(interest_cents: i64, servicing_bps: i64) -> i64 {
    (interest_cents * servicing_bps) / BPS_DENOMINATOR
}

/// Largest-remainder apportionment of `total` cents across `weights_bps`
/// (which must sum to 10000), tie-broken by the caller-supplied order
/// (investor_id lexicographic, per §4.9's determinism requirement).
///
/// Returns one amount per input position, summing exactly to `total`.
fn apportion(total: i64, weights_bps: &[i64]) -> Vec<i64> {
    if total == 0 || weights_bps.is_empty() {
        return vec![0; weights_bps.len()];
    }

    let mut floors = Vec::with_capacity(weights_bps.len());
    let mut remainders = Vec::with_capacity(weights_bps.len());
    for &bps in weights_bps {
        let exact_numerator = total * bps;
        let floor = exact_numerator / BPS_DENOMINATOR;
        let remainder = exact_numerator % BPS_DENOMINATOR;
        floors.push(floor);
        remainders.push(remainder);
    }

    let distributed: i64 = floors.iter().sum();
    let mut shortfall = total - distributed;

    // Rank indices by remainder descending; ties keep the caller's original
    // (already investor_id-sorted) order since `sort_by_key` is stable.
    let mut order: Vec<usize> = (0..weights_bps.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(remainders[i]));

    let mut amounts = floors;
    for &i in order.iter() {
        if shortfall == 0 {
            break;
        }
        amounts[i] += 1;
        shortfall -= 1;
    }
    amounts
}

/// Compute each investor's distribution + servicing fee share for a posted
/// payment (§4.9). `positions` must already be the effective set for
/// `effective_date` (latest `effective_from <= date` per investor) and must
/// be sorted by `investor_id` ascending for deterministic tie-breaks.
pub fn distribute(
    interest_cents: i64,
    principal_cents: i64,
    positions: &[InvestorPosition],
    servicing_bps: i64,
) -> Result<Vec<InvestorShare>, DistributionError> {
    if interest_cents < 0 || principal_cents < 0 {
        return Err(DistributionError::NegativeComponent {
            interest: interest_cents,
            principal: principal_cents,
        });
    }

    let total_bps: i64 = positions.iter().map(|p| p.pct_bps).sum();
    if !positions.is_empty() && total_bps != BPS_DENOMINATOR {
        return Err(DistributionError::PositionsDoNotSumToWhole(total_bps));
    }

    let distributable = interest_cents + principal_cents;
    let fee_total = servicing_fee(interest_cents, servicing_bps);
    let distributable_after_fee = distributable - fee_total;

    let weights: Vec<i64> = positions.iter().map(|p| p.pct_bps).collect();
    let amounts = apportion(distributable_after_fee, &weights);
    let fees = apportion(fee_total, &weights);

    Ok(positions
        .iter()
        .zip(amounts)
        .zip(fees)
        .map(|((position, amount), fee)| InvestorShare {
            investor_id: position.investor_id.clone(),
            amount_cents: amount,
            servicing_fee_cents: fee,
        })
        .collect())
}

pub fn total_amount(shares: &[InvestorShare]) -> i64 {
    shares.iter().map(|s| s.amount_cents).sum()
}

pub fn total_servicing_fee(shares: &[InvestorShare]) -> i64 {
    shares.iter().map(|s| s.servicing_fee_cents).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(id: &str, bps: i64) -> InvestorPosition {
        InvestorPosition {
            investor_id: id.to_string(),
            pct_bps: bps,
        }
    }

    /// §8 scenario 3: distributable_after_fee = 10001, weights
    /// 3334/3333/3333 -> final {3334, 3334, 3333}.
    #[test]
    fn scenario_largest_remainder_distribution() {
        // interest + principal - fee must equal 10001; use interest=0 so
        // fee is 0 and distributable_after_fee == principal.
        let positions = vec![
            position("INV-A", 3334),
            position("INV-B", 3333),
            position("INV-C", 3333),
        ];
        let shares = distribute(0, 10_001, &positions, DEFAULT_SERVICING_BPS).unwrap();
        let amounts: Vec<i64> = shares.iter().map(|s| s.amount_cents).collect();
        assert_eq!(amounts, vec![3334, 3334, 3333]);
        assert_eq!(total_amount(&shares), 10_001);
    }

    /// §8 scenario 1: distributable 30000, fee floor(10000*25/10000)=25.
    #[test]
    fn scenario_current_policy_distribution_and_fee() {
        assert_eq!(servicing_fee(10_000, DEFAULT_SERVICING_BPS), 25);
        let positions = vec![position("INV-ONLY", 10_000)];
        let shares = distribute(10_000, 20_000, &positions, DEFAULT_SERVICING_BPS).unwrap();
        assert_eq!(shares[0].amount_cents, 30_000 - 25);
        assert_eq!(shares[0].servicing_fee_cents, 25);
    }

    #[test]
    fn rejects_positions_not_summing_to_whole() {
        let positions = vec![position("INV-A", 4000), position("INV-B", 4000)];
        let err = distribute(0, 1000, &positions, 0).unwrap_err();
        assert_eq!(err, DistributionError::PositionsDoNotSumToWhole(8000));
    }

    #[test]
    fn empty_positions_short_circuits_without_dividing_by_zero() {
        let shares = distribute(0, 1000, &[], 0).unwrap();
        assert!(shares.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn apportionment_always_sums_to_total(total in 0i64..1_000_000, a in 1i64..9998, b in 1i64..9998) {
            let c = BPS_DENOMINATOR - a - b;
            proptest::prop_assume!(c > 0);
            let weights = vec![a, b, c];
            let amounts = super::apportion(total, &weights);
            let sum: i64 = amounts.iter().sum();
            proptest::prop_assert_eq!(sum, total);
        }
    }
}
