//! Deterministic in-memory chain for tests.
//!
//! `MockChain` implements the full [`ChainAdapter`] capability against state
//! the test controls directly: deposits appear when the test says so,
//! confirmations move when the test moves them, and a reorg is one call that
//! flips a txid to `-1`. Submitted transfers are recorded verbatim so tests
//! can assert on the exact outbound flow.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use swapx_core::config::ChainKind;
use swapx_core::queue::{NonceOrInputs, SubmittedTx};
use swapx_core::types::{Asset, ChainId, DealId, Party, Timestamp};
use swapx_core::{Amount, SwapxError};

use crate::adapter::{
    AdapterDeposit, ChainAdapter, DepositPage, EscrowAccountRef, ExistingTransfer, FeeBudget,
    NativeQuote, SendOptions,
};

struct MockDeposit {
    address: String,
    asset: Asset,
    txid: String,
    index: u32,
    amount: Amount,
    block_height: Option<u64>,
    block_time: Option<Timestamp>,
}

/// One recorded `send` call.
#[derive(Clone, Debug)]
pub struct SentRecord {
    pub from: String,
    pub to: String,
    pub asset: Asset,
    pub amount: Amount,
    pub txid: String,
    pub nonce: Option<u64>,
    pub gas_price: Option<u128>,
}

#[derive(Default)]
struct MockState {
    deposits: Vec<MockDeposit>,
    sent: Vec<SentRecord>,
    tx_confirms: HashMap<String, i64>,
    fee_shortfalls: HashMap<String, Amount>,
    network_nonces: HashMap<String, u64>,
    /// Native units per 1 USD; `None` simulates a missing oracle.
    quote_rate: Option<Amount>,
    quote_as_of: Timestamp,
    fail_all: bool,
    now: Timestamp,
    next_tx: u64,
}

pub struct MockChain {
    chain_id: ChainId,
    kind: ChainKind,
    decimals: u32,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain_id: ChainId, kind: ChainKind, decimals: u32) -> Self {
        Self {
            chain_id,
            kind,
            decimals,
            state: Mutex::new(MockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock chain state lock")
    }

    // ── Test controls ────────────────────────────────────────────────────────

    /// Record a deposit on `address` and return its txid.
    pub fn add_deposit(
        &self,
        address: &str,
        asset: &Asset,
        amount: &str,
        confirms: i64,
        block_time: Timestamp,
    ) -> String {
        let mut s = self.lock();
        s.next_tx += 1;
        let txid = format!("dep{}", s.next_tx);
        let block_height = 100 + s.next_tx;
        s.tx_confirms.insert(txid.clone(), confirms);
        s.deposits.push(MockDeposit {
            address: address.to_string(),
            asset: asset.clone(),
            txid: txid.clone(),
            index: 0,
            amount: Amount::parse(amount).expect("valid test amount"),
            block_height: Some(block_height),
            block_time: Some(block_time),
        });
        txid
    }

    pub fn set_confirms(&self, txid: &str, confirms: i64) {
        self.lock().tx_confirms.insert(txid.to_string(), confirms);
    }

    /// Flip a txid (deposit or outbound) to the reorged state.
    pub fn reorg(&self, txid: &str) {
        self.set_confirms(txid, -1);
    }

    /// Move every recorded outbound transfer to `confirms`.
    pub fn confirm_all_sent(&self, confirms: i64) {
        let mut s = self.lock();
        let txids: Vec<String> = s.sent.iter().map(|r| r.txid.clone()).collect();
        for txid in txids {
            s.tx_confirms.insert(txid, confirms);
        }
    }

    pub fn set_network_nonce(&self, address: &str, nonce: u64) {
        self.lock().network_nonces.insert(address.to_string(), nonce);
    }

    pub fn set_fee_shortfall(&self, address: &str, shortfall: &str) {
        self.lock()
            .fee_shortfalls
            .insert(address.to_string(), Amount::parse(shortfall).expect("valid test amount"));
    }

    pub fn clear_fee_shortfall(&self, address: &str) {
        self.lock().fee_shortfalls.remove(address);
    }

    /// Native units per 1 USD, with a quote timestamp.
    pub fn set_quote(&self, rate: &str, as_of: Timestamp) {
        let mut s = self.lock();
        s.quote_rate = Some(Amount::parse(rate).expect("valid test amount"));
        s.quote_as_of = as_of;
    }

    pub fn set_now(&self, now: Timestamp) {
        self.lock().now = now;
    }

    /// Make every adapter call fail until cleared.
    pub fn set_fail_all(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    fn check_fail(&self, s: &MockState) -> Result<(), SwapxError> {
        if s.fail_all {
            return Err(SwapxError::Adapter {
                chain: self.chain_id.to_string(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn kind(&self) -> ChainKind {
        self.kind
    }

    async fn generate_escrow_account(
        &self,
        _asset: &Asset,
        deal_id: &DealId,
        party: Party,
    ) -> Result<EscrowAccountRef, SwapxError> {
        let mut h = blake3::Hasher::new();
        h.update(self.chain_id.as_str().as_bytes());
        h.update(deal_id.as_bytes());
        h.update(party.as_str().as_bytes());
        let digest = h.finalize();
        let address = format!(
            "{}-{}",
            self.chain_id.as_str().to_ascii_lowercase(),
            bs58::encode(&digest.as_bytes()[..20]).into_string()
        );
        Ok(EscrowAccountRef {
            chain_id: self.chain_id.clone(),
            address,
            key_ref: hex::encode(digest.as_bytes()),
        })
    }

    async fn list_confirmed_deposits(
        &self,
        asset: &Asset,
        address: &str,
        min_confirms: u32,
        since: Option<Timestamp>,
    ) -> Result<DepositPage, SwapxError> {
        let s = self.lock();
        self.check_fail(&s)?;
        let mut deposits = Vec::new();
        for d in &s.deposits {
            if d.address != address || d.asset != *asset {
                continue;
            }
            let confirms = s.tx_confirms.get(&d.txid).copied().unwrap_or(0);
            if confirms < min_confirms as i64 {
                continue;
            }
            if let (Some(since), Some(bt)) = (since, d.block_time) {
                if bt < since {
                    continue;
                }
            }
            deposits.push(AdapterDeposit {
                txid: d.txid.clone(),
                index: d.index,
                amount: d.amount.clone(),
                block_height: d.block_height,
                block_time: d.block_time,
                confirms,
            });
        }
        let total_confirmed = Amount::sum(deposits.iter().map(|d| &d.amount));
        Ok(DepositPage {
            deposits,
            total_confirmed,
        })
    }

    async fn send(
        &self,
        asset: &Asset,
        from: &str,
        to: &str,
        amount: &Amount,
        options: SendOptions,
    ) -> Result<SubmittedTx, SwapxError> {
        let mut s = self.lock();
        self.check_fail(&s)?;
        s.next_tx += 1;
        let txid = format!("mtx{}", s.next_tx);
        s.tx_confirms.insert(txid.clone(), 0);
        s.sent.push(SentRecord {
            from: from.to_string(),
            to: to.to_string(),
            asset: asset.clone(),
            amount: amount.clone(),
            txid: txid.clone(),
            nonce: options.nonce,
            gas_price: options.gas_price,
        });
        let nonce_or_inputs = match self.kind {
            ChainKind::Account => NonceOrInputs::Nonce(options.nonce.unwrap_or(0)),
            ChainKind::Utxo => NonceOrInputs::Inputs(vec![format!("{txid}:vin0")]),
        };
        let gas_price = match self.kind {
            // An account gateway always settles on some gas price.
            ChainKind::Account => options.gas_price.or(Some(1_000_000_000)),
            ChainKind::Utxo => None,
        };
        Ok(SubmittedTx {
            txid,
            submitted_at: s.now,
            nonce_or_inputs,
            gas_price,
            additional_txids: vec![],
        })
    }

    async fn get_tx_confirmations(&self, txid: &str) -> Result<i64, SwapxError> {
        let s = self.lock();
        self.check_fail(&s)?;
        Ok(s.tx_confirms.get(txid).copied().unwrap_or(-1))
    }

    async fn check_existing_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &Asset,
        amount: &Amount,
    ) -> Result<Option<ExistingTransfer>, SwapxError> {
        let s = self.lock();
        self.check_fail(&s)?;
        // A reorged broadcast is no longer on-chain and must not be adopted.
        Ok(s.sent
            .iter()
            .filter(|r| s.tx_confirms.get(&r.txid).copied().unwrap_or(0) != -1)
            .find(|r| r.from == from && r.to == to && r.asset == *asset && r.amount == *amount)
            .map(|r| ExistingTransfer {
                txid: r.txid.clone(),
                block_number: Some(1),
            }))
    }

    async fn ensure_fee_budget(&self, from: &str, _asset: &Asset) -> Result<FeeBudget, SwapxError> {
        let s = self.lock();
        self.check_fail(&s)?;
        Ok(match s.fee_shortfalls.get(from) {
            Some(shortfall) => FeeBudget {
                sufficient: false,
                shortfall: shortfall.clone(),
            },
            None => FeeBudget {
                sufficient: true,
                shortfall: Amount::zero(),
            },
        })
    }

    async fn network_nonce(&self, address: &str) -> Result<u64, SwapxError> {
        let s = self.lock();
        self.check_fail(&s)?;
        Ok(s.network_nonces.get(address).copied().unwrap_or(0))
    }

    async fn quote_native_for_usd(&self, usd: &Amount) -> Result<NativeQuote, SwapxError> {
        let s = self.lock();
        self.check_fail(&s)?;
        let rate = s.quote_rate.clone().ok_or(SwapxError::QuoteUnavailable {
            chain: self.chain_id.to_string(),
        })?;
        // native = usd × rate, floored to the chain's native decimals.
        Ok(NativeQuote {
            native_amount: usd.mul_amount(&rate, self.decimals),
            source: "mock".into(),
            as_of: s.quote_as_of,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> MockChain {
        MockChain::new(ChainId::new("ETH"), ChainKind::Account, 18)
    }

    #[tokio::test]
    async fn deposits_filter_by_confirms() {
        let c = chain();
        let asset = Asset::new("ETH");
        c.add_deposit("0xa", &asset, "1.0", 3, 1_000);
        c.add_deposit("0xa", &asset, "2.0", 1, 1_000);

        let page = c.list_confirmed_deposits(&asset, "0xa", 2, None).await.unwrap();
        assert_eq!(page.deposits.len(), 1);
        assert_eq!(page.total_confirmed, Amount::parse("1.0").unwrap());
    }

    #[tokio::test]
    async fn reorg_reports_minus_one() {
        let c = chain();
        let asset = Asset::new("ETH");
        let txid = c.add_deposit("0xa", &asset, "1.0", 12, 1_000);
        c.reorg(&txid);
        assert_eq!(c.get_tx_confirmations(&txid).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn send_records_and_existing_transfer_finds() {
        let c = chain();
        let asset = Asset::new("ETH");
        let amount = Amount::parse("1.5").unwrap();
        let receipt = c
            .send(&asset, "0xa", "0xb", &amount, SendOptions { nonce: Some(4), gas_price: Some(100) })
            .await
            .unwrap();
        assert_eq!(receipt.nonce(), Some(4));

        let found = c.check_existing_transfer("0xa", "0xb", &asset, &amount).await.unwrap();
        assert_eq!(found.unwrap().txid, receipt.txid);
        assert!(c.check_existing_transfer("0xa", "0xc", &asset, &amount).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn escrow_accounts_deterministic_and_distinct() {
        let c = chain();
        let asset = Asset::new("ETH");
        let d1 = DealId::from_bytes([1u8; 32]);
        let d2 = DealId::from_bytes([2u8; 32]);
        let a1 = c.generate_escrow_account(&asset, &d1, Party::Alice).await.unwrap();
        let a1_again = c.generate_escrow_account(&asset, &d1, Party::Alice).await.unwrap();
        let a2 = c.generate_escrow_account(&asset, &d2, Party::Alice).await.unwrap();
        assert_eq!(a1, a1_again);
        assert_ne!(a1.address, a2.address);
    }

    #[tokio::test]
    async fn quote_requires_rate() {
        let c = chain();
        let usd = Amount::parse("10").unwrap();
        assert!(matches!(
            c.quote_native_for_usd(&usd).await,
            Err(SwapxError::QuoteUnavailable { .. })
        ));
        c.set_quote("0.0005", 1_000);
        let q = c.quote_native_for_usd(&usd).await.unwrap();
        assert_eq!(q.native_amount, Amount::parse("0.005").unwrap());
    }

    #[tokio::test]
    async fn injected_failure_propagates() {
        let c = chain();
        c.set_fail_all(true);
        assert!(c.get_tx_confirmations("x").await.is_err());
    }
}
