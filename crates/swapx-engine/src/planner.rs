//! Distribution and refund planning (pure).
//!
//! A plan is a list of [`PlannedItem`]s plus the deposit keys it consumes.
//! The planner holds the central payout invariant: the counterparty receives
//! the trade amount *exactly*; commission and surplus are carved from what
//! was deposited on top, never subtracted from the trade leg.

use swapx_core::deal::{Deal, EscrowRef};
use swapx_core::deposit::Deposit;
use swapx_core::queue::{Phase, PlannedItem, Purpose};
use swapx_core::types::Party;
use swapx_core::{Amount, SwapxError};

/// A computed plan: what to enqueue and which deposits it settles.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub items: Vec<PlannedItem>,
    pub consumed: Vec<(String, u32)>,
}

fn consumed_keys(deposits: &[&Deposit]) -> Vec<(String, u32)> {
    deposits.iter().map(|d| (d.txid.clone(), d.index)).collect()
}

/// Swap distribution for one side, built from that side's eligible deposits.
///
/// Produces up to three items from the side's escrow:
/// 1. SWAP_PAYOUT of exactly the trade amount to the counterparty's
///    recipient address;
/// 2. OP_COMMISSION of the frozen commission to the operator;
/// 3. a surplus refund back to this side's payback address.
///
/// `phased` (UTXO chains) tags the items 1/2/3 so the worker serializes them
/// deal-wide; account chains rely on nonce order instead.
pub fn plan_swap_side(
    deal: &Deal,
    party: Party,
    escrow: &EscrowRef,
    eligible: &[&Deposit],
    operator_address: &str,
    phased: bool,
) -> Result<Plan, SwapxError> {
    let leg = deal.leg(party);
    let commission = deal.commission(party);
    let counterparty = deal
        .details(party.other())
        .ok_or_else(|| SwapxError::InvalidInput("counterparty details missing".into()))?;
    let own = deal
        .details(party)
        .ok_or_else(|| SwapxError::InvalidInput("party details missing".into()))?;

    let deposited_trade = Amount::sum(
        eligible
            .iter()
            .filter(|d| d.asset == leg.asset)
            .map(|d| &d.amount),
    );

    let mut items = Vec::new();

    items.push(PlannedItem {
        deal_id: deal.id.clone(),
        chain_id: escrow.chain_id.clone(),
        from: escrow.address.clone(),
        to: counterparty.recipient_address.clone(),
        asset: leg.asset.clone(),
        // The invariant: the recipient gets the trade amount verbatim.
        amount: leg.amount.clone(),
        purpose: Purpose::SwapPayout,
        phase: phased.then_some(Phase::Phase1Swap),
        dedup_key: format!("swap:{}", escrow.address),
    });

    if commission.amount.is_positive() {
        items.push(PlannedItem {
            deal_id: deal.id.clone(),
            chain_id: escrow.chain_id.clone(),
            from: escrow.address.clone(),
            to: operator_address.to_string(),
            asset: commission.asset.clone(),
            amount: commission.amount.clone(),
            purpose: Purpose::OpCommission,
            phase: phased.then_some(Phase::Phase2Commission),
            dedup_key: format!("comm:{}", escrow.address),
        });
    }

    // Surplus in the trade asset above trade (+ commission when same-asset).
    let mut consumed_by_plan = leg.amount.clone();
    if commission.asset == leg.asset {
        consumed_by_plan = consumed_by_plan.plus(&commission.amount);
    }
    let surplus = deposited_trade.saturating_minus(&consumed_by_plan);
    if surplus.is_positive() {
        items.push(PlannedItem {
            deal_id: deal.id.clone(),
            chain_id: escrow.chain_id.clone(),
            from: escrow.address.clone(),
            to: own.payback_address.clone(),
            asset: leg.asset.clone(),
            amount: surplus,
            purpose: Purpose::PostCloseRefund,
            phase: phased.then_some(Phase::Phase3Refund),
            dedup_key: format!("surplus:{}", escrow.address),
        });
    }

    // A commission funded in a distinct asset leaves its own remainder.
    if commission.asset != leg.asset {
        let deposited_commission = Amount::sum(
            eligible
                .iter()
                .filter(|d| d.asset == commission.asset)
                .map(|d| &d.amount),
        );
        let rest = deposited_commission.saturating_minus(&commission.amount);
        if rest.is_positive() {
            items.push(PlannedItem {
                deal_id: deal.id.clone(),
                chain_id: escrow.chain_id.clone(),
                from: escrow.address.clone(),
                to: own.payback_address.clone(),
                asset: commission.asset.clone(),
                amount: rest,
                purpose: Purpose::PostCloseRefund,
                phase: phased.then_some(Phase::Phase3Refund),
                dedup_key: format!("surplus-comm:{}", escrow.address),
            });
        }
    }

    Ok(Plan {
        items,
        consumed: consumed_keys(eligible),
    })
}

/// Timeout refund for one side: every confirmed deposit goes back to the
/// payback address in full. Commission is waived on refund.
pub fn plan_refund_side(
    deal: &Deal,
    party: Party,
    escrow: &EscrowRef,
    confirmed: &[&Deposit],
) -> Result<Plan, SwapxError> {
    let own = deal
        .details(party)
        .ok_or_else(|| SwapxError::InvalidInput("party details missing".into()))?;

    let mut items = Vec::new();
    for dep in confirmed {
        items.push(PlannedItem {
            deal_id: deal.id.clone(),
            chain_id: escrow.chain_id.clone(),
            from: escrow.address.clone(),
            to: own.payback_address.clone(),
            asset: dep.asset.clone(),
            amount: dep.amount.clone(),
            purpose: Purpose::TimeoutRefund,
            phase: None,
            dedup_key: format!("refund:{}:{}", dep.txid, dep.index),
        });
    }
    Ok(Plan {
        items,
        consumed: consumed_keys(confirmed),
    })
}

/// Post-close refund: deposits that confirmed after the deal closed (or were
/// never part of the settled set) go back in full. No commission is levied.
pub fn plan_post_close_side(
    deal: &Deal,
    party: Party,
    escrow: &EscrowRef,
    late: &[&Deposit],
) -> Result<Plan, SwapxError> {
    let own = deal
        .details(party)
        .ok_or_else(|| SwapxError::InvalidInput("party details missing".into()))?;

    let mut items = Vec::new();
    for dep in late {
        items.push(PlannedItem {
            deal_id: deal.id.clone(),
            chain_id: escrow.chain_id.clone(),
            from: escrow.address.clone(),
            to: own.payback_address.clone(),
            asset: dep.asset.clone(),
            amount: dep.amount.clone(),
            purpose: Purpose::PostCloseRefund,
            phase: None,
            dedup_key: format!("postclose:{}:{}", dep.txid, dep.index),
        });
    }
    Ok(Plan {
        items,
        consumed: consumed_keys(late),
    })
}
