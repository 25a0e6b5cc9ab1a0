//! The `ChainAdapter` trait: the narrow capability the core consumes.
//!
//! One implementation exists per configured chain. UTXO- and account-style
//! differences stay behind [`SendOptions`]: account chains read `nonce` and
//! `gas_price`, UTXO chains ignore both and select inputs themselves. An EVM
//! adapter MAY satisfy several logical transfers with a single
//! broker-contract call; the core never observes that beyond
//! `additional_txids` on the receipt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use swapx_core::config::ChainKind;
use swapx_core::queue::SubmittedTx;
use swapx_core::types::{Asset, ChainId, DealId, Party, Timestamp};
use swapx_core::{Amount, SwapxError};

// ── Data shapes ──────────────────────────────────────────────────────────────

/// An HD-derived escrow account reference. The broker stores the derivation
/// reference, never key material; `key_ref` is only meaningful to the
/// adapter that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscrowAccountRef {
    pub chain_id: ChainId,
    pub address: String,
    pub key_ref: String,
}

/// One confirmed inbound transfer as reported by a chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterDeposit {
    pub txid: String,
    /// Output index; always 0 on account chains.
    pub index: u32,
    pub amount: Amount,
    pub block_height: Option<u64>,
    pub block_time: Option<Timestamp>,
    pub confirms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositPage {
    pub deposits: Vec<AdapterDeposit>,
    pub total_confirmed: Amount,
}

/// Chain-agnostic options bag for `send`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SendOptions {
    pub nonce: Option<u64>,
    pub gas_price: Option<u128>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExistingTransfer {
    pub txid: String,
    pub block_number: Option<u64>,
}

/// Answer to a fee-budget probe: whether `from` can pay for one more
/// transfer, and the native shortfall if not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeeBudget {
    pub sufficient: bool,
    pub shortfall: Amount,
}

/// A native-currency quote for a USD amount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NativeQuote {
    pub native_amount: Amount,
    pub source: String,
    pub as_of: Timestamp,
}

/// Parameters for an atomic broker-contract split: one inbound call that the
/// on-chain splitter forwards to recipient, fee and payback addresses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerSplit {
    pub from: String,
    pub asset: Asset,
    pub recipient: String,
    pub recipient_amount: Amount,
    pub fee_address: String,
    pub fee_amount: Amount,
    pub payback: String,
    pub payback_amount: Amount,
}

// ── The capability ───────────────────────────────────────────────────────────

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> &ChainId;

    fn kind(&self) -> ChainKind;

    /// Deterministic over `(seed, deal_id, party)`; never reuses an address
    /// across deals.
    async fn generate_escrow_account(
        &self,
        asset: &Asset,
        deal_id: &DealId,
        party: Party,
    ) -> Result<EscrowAccountRef, SwapxError>;

    /// Confirmed deposits on `address` in `asset` with at least
    /// `min_confirms`. `since` is a block-time watermark; implementations may
    /// ignore it and return the full set.
    async fn list_confirmed_deposits(
        &self,
        asset: &Asset,
        address: &str,
        min_confirms: u32,
        since: Option<Timestamp>,
    ) -> Result<DepositPage, SwapxError>;

    /// Broadcast a transfer. Account chains take `options.nonce` /
    /// `options.gas_price` verbatim; UTXO chains select inputs and report
    /// them in the receipt.
    async fn send(
        &self,
        asset: &Asset,
        from: &str,
        to: &str,
        amount: &Amount,
        options: SendOptions,
    ) -> Result<SubmittedTx, SwapxError>;

    /// Confirmation depth of `txid`, `-1` when reorged or unknown.
    async fn get_tx_confirmations(&self, txid: &str) -> Result<i64, SwapxError>;

    /// Look for an already-broadcast transfer matching
    /// `(from → to, asset, amount)`. Recovers from crash-during-send and
    /// operator duplicates.
    async fn check_existing_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &Asset,
        amount: &Amount,
    ) -> Result<Option<ExistingTransfer>, SwapxError>;

    /// Whether `from` holds enough native currency to pay the fee for one
    /// transfer of `asset`. A shortfall makes the core enqueue a GAS_FUND
    /// from the tank wallet.
    async fn ensure_fee_budget(&self, from: &str, asset: &Asset) -> Result<FeeBudget, SwapxError>;

    /// The network's next nonce for `address` (account chains). Seeds the
    /// ledger's nonce reservation for fresh accounts.
    async fn network_nonce(&self, address: &str) -> Result<u64, SwapxError>;

    /// Convert a USD amount to native currency at the latest quote.
    async fn quote_native_for_usd(&self, usd: &Amount) -> Result<NativeQuote, SwapxError>;

    // ── Optional broker-contract operations (EVM only) ──────────────────────
    // Adapter-internal optimization hooks; the core records the three logical
    // outputs either way.

    async fn approve_broker_for_erc20(&self, _from: &str, _token: &Asset) -> Result<SubmittedTx, SwapxError> {
        Err(SwapxError::Other(format!(
            "broker contract not supported on {}",
            self.chain_id()
        )))
    }

    async fn swap_via_broker(&self, _params: BrokerSplit) -> Result<SubmittedTx, SwapxError> {
        Err(SwapxError::Other(format!(
            "broker contract not supported on {}",
            self.chain_id()
        )))
    }

    async fn revert_via_broker(&self, _params: BrokerSplit) -> Result<SubmittedTx, SwapxError> {
        Err(SwapxError::Other(format!(
            "broker contract not supported on {}",
            self.chain_id()
        )))
    }
}
