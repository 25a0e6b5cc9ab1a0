//! Lock evaluation: pure sums over eligible deposits.
//!
//! A side is *locked* when its eligible deposits cover trade + commission.
//! Eligibility is confirmations ≥ threshold (inclusive), block time ≤
//! deadline (inclusive), and not orphaned. Commission is funded from the
//! surplus above the trade amount when both are in the same asset; it is
//! never deducted from the amount owed to the counterparty.

use swapx_core::deposit::Deposit;
use swapx_core::types::{Asset, Timestamp};
use swapx_core::Amount;

/// Outcome of evaluating one side.
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub trade_locked: bool,
    pub commission_locked: bool,
    /// Eligible total in the trade asset.
    pub trade_total: Amount,
    /// Eligible total in the commission asset (equals `trade_total` when the
    /// assets coincide).
    pub commission_total: Amount,
    /// Remainder above trade + commission, payback to the depositor.
    /// Carried in the trade asset; a distinct commission asset contributes
    /// its own remainder above the commission amount.
    pub surplus: Amount,
}

impl LockStatus {
    pub fn locked(&self) -> bool {
        self.trade_locked && self.commission_locked
    }
}

/// A deposit counts when it is confirmed deep enough, landed before the
/// deadline, and is not sitting on an orphaned branch.
pub fn is_eligible(dep: &Deposit, min_confirms: u32, deadline: Option<Timestamp>) -> bool {
    if dep.is_orphaned() {
        return false;
    }
    if dep.confirms < min_confirms as i64 {
        return false;
    }
    match (deadline, dep.block_time) {
        (Some(deadline), Some(bt)) => bt <= deadline,
        // No deadline to enforce: eligible.
        (None, _) => true,
        // Deadline but unknown block time: not provably inside the window.
        (Some(_), None) => false,
    }
}

/// Deposits from `deposits` that pass [`is_eligible`].
pub fn eligible_deposits<'a>(
    deposits: &'a [Deposit],
    min_confirms: u32,
    deadline: Option<Timestamp>,
) -> Vec<&'a Deposit> {
    deposits
        .iter()
        .filter(|d| is_eligible(d, min_confirms, deadline))
        .collect()
}

/// Evaluate one side of a deal.
pub fn evaluate_lock(
    deposits: &[Deposit],
    trade_asset: &Asset,
    trade_amount: &Amount,
    commission_asset: &Asset,
    commission_amount: &Amount,
    min_confirms: u32,
    deadline: Option<Timestamp>,
) -> LockStatus {
    let eligible = eligible_deposits(deposits, min_confirms, deadline);

    let trade_total = Amount::sum(
        eligible
            .iter()
            .filter(|d| d.asset == *trade_asset)
            .map(|d| &d.amount),
    );

    let trade_locked = trade_total >= *trade_amount;

    if commission_asset == trade_asset {
        // Commission comes out of the surplus above the trade amount.
        let required = trade_amount.plus(commission_amount);
        let commission_locked = trade_total >= required;
        let surplus = trade_total.saturating_minus(&required);
        LockStatus {
            trade_locked,
            commission_locked,
            commission_total: trade_total.clone(),
            trade_total,
            surplus,
        }
    } else {
        let commission_total = Amount::sum(
            eligible
                .iter()
                .filter(|d| d.asset == *commission_asset)
                .map(|d| &d.amount),
        );
        let commission_locked = commission_total >= *commission_amount;
        let surplus = trade_total.saturating_minus(trade_amount);
        LockStatus {
            trade_locked,
            commission_locked,
            trade_total,
            commission_total,
            surplus,
        }
    }
}
