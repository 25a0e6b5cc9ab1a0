//! JSON-RPC 2.0 chain-gateway client.
//!
//! Production deployments run one gateway process per chain (the component
//! that actually speaks the node's wire protocol, holds fee estimation and
//! signs with derived keys). This adapter forwards every capability call to
//! the gateway over plain HTTP JSON-RPC, using raw reqwest + serde_json
//! rather than a full RPC client stack to keep the dependency surface small.
//!
//! The hot-wallet seed never leaves the broker: escrow generation derives the
//! per-deal key locally and hands the gateway only the derived `key_ref`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use swapx_core::config::{ChainKind, ChainProfile};
use swapx_core::queue::{NonceOrInputs, SubmittedTx};
use swapx_core::types::{Asset, ChainId, DealId, Party, Timestamp};
use swapx_core::{Amount, SwapxError};

use crate::adapter::{
    ChainAdapter, DepositPage, EscrowAccountRef, ExistingTransfer, FeeBudget, NativeQuote,
    SendOptions,
};
use crate::hd::EscrowDeriver;

pub struct RpcChainAdapter {
    chain_id: ChainId,
    kind: ChainKind,
    url: String,
    client: reqwest::Client,
    deriver: Arc<EscrowDeriver>,
}

impl RpcChainAdapter {
    pub fn new(profile: &ChainProfile, deriver: Arc<EscrowDeriver>) -> Self {
        Self {
            chain_id: profile.chain_id.clone(),
            kind: profile.kind,
            url: profile.endpoint.clone(),
            client: reqwest::Client::new(),
            deriver,
        }
    }

    fn adapter_err(&self, message: impl std::fmt::Display) -> SwapxError {
        SwapxError::Adapter {
            chain: self.chain_id.to_string(),
            message: message.to_string(),
        }
    }

    /// Call a gateway method and decode the `result` field.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SwapxError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        debug!(chain = %self.chain_id, method, "gateway call");
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.adapter_err(format!("connecting to gateway at {}: {e}", self.url)))?;

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.adapter_err(format!("parsing gateway response: {e}")))?;

        if let Some(err) = json.get("error") {
            return Err(self.adapter_err(format!("gateway error: {err}")));
        }

        serde_json::from_value(json["result"].clone())
            .map_err(|e| self.adapter_err(format!("decoding {method} result: {e}")))
    }
}

// Wire DTOs. The gateway speaks amounts as canonical strings, which `Amount`'s
// serde already is, so the core types mostly serialize straight through.

#[derive(Deserialize)]
struct WireReceipt {
    txid: String,
    submitted_at: Timestamp,
    #[serde(default)]
    nonce: Option<u64>,
    #[serde(default)]
    inputs: Option<Vec<String>>,
    #[serde(default)]
    gas_price: Option<u128>,
    #[serde(default)]
    additional_txids: Vec<String>,
}

#[derive(Deserialize)]
struct WireEscrow {
    address: String,
}

#[async_trait]
impl ChainAdapter for RpcChainAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn kind(&self) -> ChainKind {
        self.kind
    }

    async fn generate_escrow_account(
        &self,
        asset: &Asset,
        deal_id: &DealId,
        party: Party,
    ) -> Result<EscrowAccountRef, SwapxError> {
        let key_ref = self.deriver.key_ref(&self.chain_id, deal_id, party);
        let escrow: WireEscrow = self
            .call(
                "gw_deriveEscrow",
                serde_json::json!([key_ref, asset.as_str()]),
            )
            .await?;
        Ok(EscrowAccountRef {
            chain_id: self.chain_id.clone(),
            address: escrow.address,
            key_ref,
        })
    }

    async fn list_confirmed_deposits(
        &self,
        asset: &Asset,
        address: &str,
        min_confirms: u32,
        since: Option<Timestamp>,
    ) -> Result<DepositPage, SwapxError> {
        self.call(
            "gw_listConfirmedDeposits",
            serde_json::json!([asset.as_str(), address, min_confirms, since]),
        )
        .await
    }

    async fn send(
        &self,
        asset: &Asset,
        from: &str,
        to: &str,
        amount: &Amount,
        options: SendOptions,
    ) -> Result<SubmittedTx, SwapxError> {
        let receipt: WireReceipt = self
            .call(
                "gw_send",
                serde_json::json!([
                    asset.as_str(),
                    from,
                    to,
                    amount.to_canonical_string(),
                    { "nonce": options.nonce, "gasPrice": options.gas_price }
                ]),
            )
            .await?;

        let nonce_or_inputs = match (receipt.nonce, receipt.inputs) {
            (Some(n), _) => NonceOrInputs::Nonce(n),
            (None, Some(inputs)) => NonceOrInputs::Inputs(inputs),
            (None, None) => {
                return Err(self.adapter_err("send receipt carries neither nonce nor inputs"))
            }
        };
        Ok(SubmittedTx {
            txid: receipt.txid,
            submitted_at: receipt.submitted_at,
            nonce_or_inputs,
            gas_price: receipt.gas_price,
            additional_txids: receipt.additional_txids,
        })
    }

    async fn get_tx_confirmations(&self, txid: &str) -> Result<i64, SwapxError> {
        self.call("gw_txConfirmations", serde_json::json!([txid]))
            .await
    }

    async fn check_existing_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &Asset,
        amount: &Amount,
    ) -> Result<Option<ExistingTransfer>, SwapxError> {
        self.call(
            "gw_findTransfer",
            serde_json::json!([from, to, asset.as_str(), amount.to_canonical_string()]),
        )
        .await
    }

    async fn ensure_fee_budget(&self, from: &str, asset: &Asset) -> Result<FeeBudget, SwapxError> {
        self.call(
            "gw_feeBudget",
            serde_json::json!([from, asset.as_str()]),
        )
        .await
    }

    async fn network_nonce(&self, address: &str) -> Result<u64, SwapxError> {
        self.call("gw_networkNonce", serde_json::json!([address]))
            .await
    }

    async fn quote_native_for_usd(&self, usd: &Amount) -> Result<NativeQuote, SwapxError> {
        self.call(
            "gw_quoteNativeForUsd",
            serde_json::json!([usd.to_canonical_string()]),
        )
        .await
    }
}
