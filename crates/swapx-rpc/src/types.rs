use serde::{Deserialize, Serialize};

/// One leg of a new deal as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcTradeLeg {
    pub chain_id: String,
    pub asset: String,
    /// Decimal string, e.g. "1.0".
    pub amount: String,
}

/// `swapx_createDeal` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCreateDeal {
    pub alice: RpcTradeLeg,
    pub bob: RpcTradeLeg,
    pub timeout_seconds: i64,
    pub name: Option<String>,
}

/// `swapx_createDeal` response: the deal id plus one bearer token per party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcDealCreated {
    pub deal_id: String,
    pub token_a: String,
    pub token_b: String,
}

/// `swapx_fillPartyDetails` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFillDetails {
    pub deal_id: String,
    /// "alice" or "bob".
    pub party: String,
    pub token: String,
    pub payback_address: String,
    pub recipient_address: String,
    pub email: Option<String>,
}

/// Escrow summary inside a status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEscrow {
    pub chain_id: String,
    pub address: String,
}

/// Per-side deposit totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSideTotals {
    /// Sum of non-orphaned deposits in the trade asset (decimal string).
    pub confirmed: String,
    pub deposit_count: u32,
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEvent {
    pub time: i64,
    pub message: String,
}

/// `swapx_status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcDealStatus {
    pub deal_id: String,
    pub name: String,
    pub stage: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub escrow_a: Option<RpcEscrow>,
    pub escrow_b: Option<RpcEscrow>,
    pub alice_totals: RpcSideTotals,
    pub bob_totals: RpcSideTotals,
    pub events: Vec<RpcEvent>,
}

/// Lightweight row for `swapx_listDeals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcDealSummary {
    pub deal_id: String,
    pub name: String,
    pub stage: String,
    pub created_at: i64,
    pub expires_at: i64,
}
