use thiserror::Error;

use crate::types::Timestamp;

#[derive(Debug, Error)]
pub enum SwapxError {
    // ── Transient I/O ────────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("chain adapter error on {chain}: {message}")]
    Adapter { chain: String, message: String },

    #[error("no usable price quote for {chain} native currency")]
    QuoteUnavailable { chain: String },

    // ── Deal lifecycle ───────────────────────────────────────────────────────
    #[error("deal not found: {0}")]
    DealNotFound(String),

    #[error("operation not valid in stage {stage} (deal {deal_id})")]
    WrongStage { deal_id: String, stage: String },

    #[error("deal {0} already has details for this party")]
    DetailsAlreadyFilled(String),

    #[error("deal {deal_id} cannot be cancelled: {reason}")]
    NotCancellable { deal_id: String, reason: String },

    #[error("invalid access token")]
    InvalidToken,

    #[error("lease on deal {deal_id} held by {owner} until {until}")]
    LeaseHeld {
        deal_id: String,
        owner: String,
        until: Timestamp,
    },

    // ── Queue safeguards ─────────────────────────────────────────────────────
    #[error("conflicting operation already queued for ({deal_id}, {from}, {asset})")]
    ConflictingQueueItem {
        deal_id: String,
        from: String,
        asset: String,
    },

    #[error("sender {chain}:{address} is halted pending operator reset: {reason}")]
    SenderHalted {
        chain: String,
        address: String,
        reason: String,
    },

    #[error("nonce anomaly on {chain}:{address}: {detail}")]
    NonceAnomaly {
        chain: String,
        address: String,
        detail: String,
    },

    // ── Admission / bad input ────────────────────────────────────────────────
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("chain not configured: {0}")]
    ChainNotConfigured(String),

    #[error("chain not allowed: {0}")]
    ChainNotAllowed(String),

    #[error("asset not allowed: {0}")]
    AssetNotAllowed(String),

    #[error("amount {amount} exceeds maximum {max} for {chain}:{asset}")]
    AmountTooLarge {
        chain: String,
        asset: String,
        amount: String,
        max: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl SwapxError {
    /// Transient failures leave state unchanged and are retried on the next
    /// tick; everything else needs a caller-side decision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SwapxError::Storage(_)
                | SwapxError::Serialization(_)
                | SwapxError::Adapter { .. }
                | SwapxError::QuoteUnavailable { .. }
                | SwapxError::LeaseHeld { .. }
        )
    }
}
