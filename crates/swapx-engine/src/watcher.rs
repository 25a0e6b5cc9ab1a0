//! Deposit polling with reorg detection.
//!
//! The watcher is the only writer of deposit rows. Per `(deal, side)` it
//! asks the chain for anything confirmed on the escrow address, upserts what
//! it finds (idempotent on `(deal, txid, index)`), and re-verifies deposits
//! the chain stopped reporting: a `confirms = -1` answer marks the row
//! orphaned until it resurfaces. An adapter failure never blocks the tick;
//! the caller gets the previous ledger snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use swapx_chain::AdapterRegistry;
use swapx_core::deal::Deal;
use swapx_core::deposit::Deposit;
use swapx_core::types::{Asset, Party};
use swapx_core::SwapxError;
use swapx_ledger::Ledger;

pub struct DepositWatcher {
    ledger: Arc<Ledger>,
    adapters: AdapterRegistry,
}

impl DepositWatcher {
    pub fn new(ledger: Arc<Ledger>, adapters: AdapterRegistry) -> Self {
        Self { ledger, adapters }
    }

    /// Poll one side of a deal and return the fresh deposit snapshot for its
    /// escrow address. Polls the trade asset and, when the commission is
    /// charged in a different asset, that asset too.
    pub async fn poll_side(&self, deal: &Deal, party: Party) -> Result<Vec<Deposit>, SwapxError> {
        let Some(escrow) = deal.escrow(party) else {
            return Ok(Vec::new());
        };
        let leg = deal.leg(party);

        let mut assets: Vec<&Asset> = vec![&leg.asset];
        let commission = deal.commission(party);
        if commission.asset != leg.asset {
            assets.push(&commission.asset);
        }

        let adapter = self.adapters.get(&escrow.chain_id)?;
        let mut observed_keys: HashSet<(String, u32)> = HashSet::new();
        let mut adapter_ok = true;

        for asset in assets {
            // min_confirms = 1: discovery wants everything on-chain; lock
            // thresholds are applied later by the evaluator.
            match adapter
                .list_confirmed_deposits(asset, &escrow.address, 1, None)
                .await
            {
                Ok(page) => {
                    for found in page.deposits {
                        observed_keys.insert((found.txid.clone(), found.index));
                        let row = Deposit {
                            deal_id: deal.id.clone(),
                            txid: found.txid,
                            index: found.index,
                            chain_id: escrow.chain_id.clone(),
                            address: escrow.address.clone(),
                            asset: asset.clone(),
                            amount: found.amount,
                            block_height: found.block_height,
                            block_time: found.block_time,
                            confirms: found.confirms,
                            orphaned: false,
                            consumed: false,
                        };
                        self.ledger.upsert_deposit(&row)?;
                    }
                }
                Err(e) => {
                    adapter_ok = false;
                    warn!(
                        deal_id = %deal.id,
                        party = %party,
                        asset = %asset,
                        error = %e,
                        "deposit poll failed; serving previous snapshot"
                    );
                }
            }
        }

        // Re-verify known deposits the listing no longer covers; a -1 answer
        // is a reorg within the finality window.
        if adapter_ok {
            for known in self.ledger.deposits_for_address(&deal.id, &escrow.address)? {
                if observed_keys.contains(&(known.txid.clone(), known.index)) {
                    continue;
                }
                match adapter.get_tx_confirmations(&known.txid).await {
                    Ok(confirms) => {
                        if confirms != known.confirms {
                            debug!(
                                deal_id = %deal.id,
                                txid = %known.txid,
                                confirms,
                                "refreshing unlisted deposit"
                            );
                            let mut refreshed = known.clone();
                            refreshed.confirms = confirms;
                            self.ledger.upsert_deposit(&refreshed)?;
                        }
                    }
                    Err(e) => {
                        warn!(
                            deal_id = %deal.id,
                            txid = %known.txid,
                            error = %e,
                            "confirmation re-check failed; keeping previous state"
                        );
                    }
                }
            }
        }

        self.ledger.deposits_for_address(&deal.id, &escrow.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use swapx_chain::mock::MockChain;
    use swapx_core::amount::Amount;
    use swapx_core::config::ChainKind;
    use swapx_core::deal::{Commission, CommissionMode, EscrowRef, Stage, TradeLeg};
    use swapx_core::types::{AccessToken, ChainId, DealId};

    fn temp_ledger(name: &str) -> Arc<Ledger> {
        let dir = std::env::temp_dir().join(format!("swapx_watcher_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        Arc::new(Ledger::open(&dir).expect("open temp db"))
    }

    fn test_deal() -> Deal {
        let id = DealId::from_bytes([3u8; 32]);
        Deal {
            id: id.clone(),
            name: "w".into(),
            created_at: 0,
            expires_at: 3_600,
            timeout_seconds: 3_600,
            alice: TradeLeg {
                chain_id: ChainId::new("ETH"),
                asset: Asset::new("ETH"),
                amount: Amount::parse("1").unwrap(),
            },
            bob: TradeLeg {
                chain_id: ChainId::new("UNICITY"),
                asset: Asset::new("ALPHA"),
                amount: Amount::parse("100").unwrap(),
            },
            alice_details: None,
            bob_details: None,
            escrow_a: Some(EscrowRef {
                chain_id: ChainId::new("ETH"),
                address: "eth-escrow-a".into(),
                key_ref: "kr".into(),
            }),
            escrow_b: None,
            stage: Stage::Collection,
            collection_remaining_secs: None,
            commission_a: Commission {
                mode: CommissionMode::PercentBps,
                amount: Amount::parse("0.003").unwrap(),
                asset: Asset::new("ETH"),
                frozen_at: None,
            },
            commission_b: Commission {
                mode: CommissionMode::PercentBps,
                amount: Amount::parse("0.3").unwrap(),
                asset: Asset::new("ALPHA"),
                frozen_at: None,
            },
            token_a: AccessToken::mint(&id, Party::Alice, &[0u8; 16]),
            token_b: AccessToken::mint(&id, Party::Bob, &[1u8; 16]),
        }
    }

    fn setup(name: &str) -> (Arc<Ledger>, Arc<MockChain>, DepositWatcher) {
        let ledger = temp_ledger(name);
        let chain = Arc::new(MockChain::new(ChainId::new("ETH"), ChainKind::Account, 18));
        let mut registry = AdapterRegistry::new();
        registry.insert(chain.clone());
        let watcher = DepositWatcher::new(Arc::clone(&ledger), registry);
        (ledger, chain, watcher)
    }

    #[tokio::test]
    async fn records_new_deposits_idempotently() {
        let (ledger, chain, watcher) = setup("records");
        let deal = test_deal();
        chain.add_deposit("eth-escrow-a", &Asset::new("ETH"), "1.0030", 3, 1_000);

        let first = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(ledger.deposits_for_deal(&deal.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refreshes_confirms_on_repoll() {
        let (_ledger, chain, watcher) = setup("refresh");
        let deal = test_deal();
        let txid = chain.add_deposit("eth-escrow-a", &Asset::new("ETH"), "1.0", 3, 1_000);

        watcher.poll_side(&deal, Party::Alice).await.unwrap();
        chain.set_confirms(&txid, 12);
        let snapshot = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert_eq!(snapshot[0].confirms, 12);
    }

    #[tokio::test]
    async fn reorged_deposit_is_marked_orphaned_and_can_resurrect() {
        let (_ledger, chain, watcher) = setup("reorg");
        let deal = test_deal();
        let txid = chain.add_deposit("eth-escrow-a", &Asset::new("ETH"), "1.0", 12, 1_000);

        watcher.poll_side(&deal, Party::Alice).await.unwrap();
        chain.reorg(&txid);
        let snapshot = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert!(snapshot[0].is_orphaned());

        chain.set_confirms(&txid, 2);
        let snapshot = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert!(!snapshot[0].is_orphaned());
        assert_eq!(snapshot[0].confirms, 2);
    }

    #[tokio::test]
    async fn adapter_failure_returns_previous_snapshot() {
        let (_ledger, chain, watcher) = setup("fail");
        let deal = test_deal();
        chain.add_deposit("eth-escrow-a", &Asset::new("ETH"), "1.0", 6, 1_000);
        watcher.poll_side(&deal, Party::Alice).await.unwrap();

        chain.set_fail_all(true);
        let snapshot = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].confirms, 6);
    }

    #[tokio::test]
    async fn no_escrow_means_no_deposits() {
        let (_ledger, _chain, watcher) = setup("noescrow");
        let mut deal = test_deal();
        deal.escrow_a = None;
        let snapshot = watcher.poll_side(&deal, Party::Alice).await.unwrap();
        assert!(snapshot.is_empty());
    }
}
