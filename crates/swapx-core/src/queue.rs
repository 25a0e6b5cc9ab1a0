//! Outbound queue items.
//!
//! A [`QueueItem`] is one intended transfer out of an escrow (or the tank
//! wallet). Items are created by state-machine transitions, retired by the
//! queue worker, and ordered strictly by `seq` within a `(deal_id, from)`
//! sender identity. UTXO-side swap plans additionally carry a [`Phase`] tag
//! imposing a barrier across all senders of the same deal.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::types::{Asset, ChainId, DealId, Timestamp};

// ── Purpose / Phase / Status ─────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Purpose {
    SwapPayout,
    OpCommission,
    TimeoutRefund,
    PostCloseRefund,
    GasFund,
    Erc20Approve,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::SwapPayout => "SWAP_PAYOUT",
            Purpose::OpCommission => "OP_COMMISSION",
            Purpose::TimeoutRefund => "TIMEOUT_REFUND",
            Purpose::PostCloseRefund => "POST_CLOSE_REFUND",
            Purpose::GasFund => "GAS_FUND",
            Purpose::Erc20Approve => "ERC20_APPROVE",
        }
    }
}

/// Ordering tag for UTXO swap distribution. Lower phases must fully complete
/// (deal-wide) before higher phases dispatch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Phase {
    Phase1Swap,
    Phase2Commission,
    Phase3Refund,
}

impl Phase {
    /// The phase that must be deal-wide COMPLETED before this one dispatches.
    pub fn prerequisite(self) -> Option<Phase> {
        match self {
            Phase::Phase1Swap => None,
            Phase::Phase2Commission => Some(Phase::Phase1Swap),
            Phase::Phase3Refund => Some(Phase::Phase2Commission),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Phase1Swap => "PHASE_1_SWAP",
            Phase::Phase2Commission => "PHASE_2_COMMISSION",
            Phase::Phase3Refund => "PHASE_3_REFUND",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Submitted => "SUBMITTED",
            QueueStatus::Completed => "COMPLETED",
            QueueStatus::Failed => "FAILED",
        }
    }
}

// ── Submitted transaction record ─────────────────────────────────────────────

/// Chain-agnostic record of a broadcast: account chains carry the nonce,
/// UTXO chains carry the consumed inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NonceOrInputs {
    Nonce(u64),
    Inputs(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmittedTx {
    pub txid: String,
    pub submitted_at: Timestamp,
    pub nonce_or_inputs: NonceOrInputs,
    #[serde(default)]
    pub gas_price: Option<u128>,
    /// Extra txids produced by adapter-side batching (e.g. a broker-contract
    /// call settling several logical items at once).
    #[serde(default)]
    pub additional_txids: Vec<String>,
}

impl SubmittedTx {
    pub fn nonce(&self) -> Option<u64> {
        match &self.nonce_or_inputs {
            NonceOrInputs::Nonce(n) => Some(*n),
            NonceOrInputs::Inputs(_) => None,
        }
    }
}

// ── QueueItem ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueItem {
    /// Global item id, allocated by the ledger at enqueue.
    pub id: u64,
    pub deal_id: DealId,
    pub chain_id: ChainId,
    /// Sending escrow (or tank wallet) address.
    pub from: String,
    pub to: String,
    pub asset: Asset,
    pub amount: Amount,

    pub purpose: Purpose,
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Deterministic idempotency key within the deal (e.g. `swap:<from>` or
    /// `refund:<txid>:<index>`). Re-applying a plan after a crash hits the
    /// same keys and becomes a no-op.
    pub dedup_key: String,
    /// Monotonically increasing, contiguous from 1, per `(deal_id, from)`.
    pub seq: u64,

    pub status: QueueStatus,
    #[serde(default)]
    pub submitted_tx: Option<SubmittedTx>,

    // Retry metadata (account-based chains).
    #[serde(default)]
    pub last_submit_at: Option<Timestamp>,
    #[serde(default)]
    pub original_nonce: Option<u64>,
    #[serde(default)]
    pub last_gas_price: Option<u128>,
    #[serde(default)]
    pub gas_bump_attempts: u32,
}

impl QueueItem {
    /// Anything not COMPLETED still owns its nonce / inputs.
    pub fn is_open(&self) -> bool {
        self.status != QueueStatus::Completed
    }

    /// Sender identity for ordering and nonce accounting.
    pub fn sender_key(&self) -> (DealId, String) {
        (self.deal_id.clone(), self.from.clone())
    }
}

/// What the planner hands to the ledger: a [`QueueItem`] minus the fields the
/// ledger assigns (`id`, `seq`, `status`).
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedItem {
    pub deal_id: DealId,
    pub chain_id: ChainId,
    pub from: String,
    pub to: String,
    pub asset: Asset,
    pub amount: Amount,
    pub purpose: Purpose,
    pub phase: Option<Phase>,
    pub dedup_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_prerequisite_chain() {
        assert_eq!(Phase::Phase1Swap.prerequisite(), None);
        assert_eq!(Phase::Phase2Commission.prerequisite(), Some(Phase::Phase1Swap));
        assert_eq!(Phase::Phase3Refund.prerequisite(), Some(Phase::Phase2Commission));
    }

    #[test]
    fn submitted_tx_nonce_accessor() {
        let acct = SubmittedTx {
            txid: "t".into(),
            submitted_at: 1,
            nonce_or_inputs: NonceOrInputs::Nonce(7),
            gas_price: Some(100),
            additional_txids: vec![],
        };
        assert_eq!(acct.nonce(), Some(7));

        let utxo = SubmittedTx {
            txid: "t".into(),
            submitted_at: 1,
            nonce_or_inputs: NonceOrInputs::Inputs(vec!["tx:0".into()]),
            gas_price: None,
            additional_txids: vec![],
        };
        assert_eq!(utxo.nonce(), None);
    }
}
