//! The queue worker: one pass = one queue tick.
//!
//! Sender identities `(deal, from)` proceed in parallel; within a sender the
//! lowest-seq PENDING item dispatches only once every earlier item is
//! SUBMITTED (holding its nonce / inputs) or COMPLETED, and phased items wait
//! for their prerequisite phase to complete deal-wide.
//!
//! Per item the dispatch pipeline is: recover an already-broadcast transfer,
//! ensure the gas budget (tank-funded on shortfall; the GAS_FUND row doubles
//! as the reimbursement record), reserve the nonce in the ledger *before*
//! broadcasting, then submit. Completion itself is observed by the deal
//! tick's confirmation pass; this module only moves PENDING → SUBMITTED and
//! keeps stuck submissions alive with same-nonce gas bumps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use swapx_chain::{AdapterRegistry, SendOptions};
use swapx_core::config::{BrokerConfig, ChainKind, ChainProfile};
use swapx_core::constants::DEFAULT_GAS_PRICE_WEI;
use swapx_core::queue::{NonceOrInputs, PlannedItem, Purpose, QueueItem, QueueStatus, SubmittedTx};
use swapx_core::types::{ChainId, DealId, Timestamp};
use swapx_core::SwapxError;
use swapx_ledger::Ledger;

use crate::audit::verify_sender_nonces;

pub struct QueueWorker {
    ledger: Arc<Ledger>,
    adapters: AdapterRegistry,
    config: Arc<BrokerConfig>,
}

impl QueueWorker {
    pub fn new(ledger: Arc<Ledger>, adapters: AdapterRegistry, config: Arc<BrokerConfig>) -> Self {
        Self {
            ledger,
            adapters,
            config,
        }
    }

    /// One queue tick over every sender with open items.
    pub async fn tick(&self, now: Timestamp) -> Result<(), SwapxError> {
        let open = self.ledger.iter_open_items()?;

        self.audit_accounts(&open, now)?;

        let senders: BTreeSet<(DealId, String, ChainId)> = open
            .iter()
            .map(|i| (i.deal_id.clone(), i.from.clone(), i.chain_id.clone()))
            .collect();

        let futures: Vec<_> = senders
            .into_iter()
            .map(|(deal_id, from, chain_id)| self.process_sender(deal_id, from, chain_id, now))
            .collect();
        for result in futures::future::join_all(futures).await {
            if let Err(e) = result {
                if e.is_transient() {
                    debug!(error = %e, "sender pass hit a transient error; retrying next tick");
                } else {
                    warn!(error = %e, "sender pass failed");
                }
            }
        }
        Ok(())
    }

    /// Nonce-integrity audit per account-chain address. An anomaly halts the
    /// sender; nothing is auto-corrected.
    fn audit_accounts(&self, open: &[QueueItem], now: Timestamp) -> Result<(), SwapxError> {
        let mut by_address: BTreeMap<(ChainId, String), Vec<QueueItem>> = BTreeMap::new();
        for item in open {
            let Ok(profile) = self.config.chain(&item.chain_id) else { continue };
            if profile.kind == ChainKind::Account {
                by_address
                    .entry((item.chain_id.clone(), item.from.clone()))
                    .or_default()
                    .push(item.clone());
            }
        }
        for ((chain_id, address), items) in by_address {
            if self.ledger.sender_halt_reason(&chain_id, &address)?.is_some() {
                continue;
            }
            if let Some(anomaly) = verify_sender_nonces(&items) {
                error!(
                    chain = %chain_id,
                    address = %address,
                    anomaly = %anomaly,
                    "nonce integrity violated; halting sender"
                );
                self.ledger.halt_sender(&chain_id, &address, &anomaly)?;
                for deal_id in items.iter().map(|i| &i.deal_id).collect::<BTreeSet<_>>() {
                    self.ledger.append_event(
                        deal_id,
                        now,
                        format!("sender {address} halted: {anomaly}"),
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn process_sender(
        &self,
        deal_id: DealId,
        from: String,
        chain_id: ChainId,
        now: Timestamp,
    ) -> Result<(), SwapxError> {
        if self.ledger.sender_halt_reason(&chain_id, &from)?.is_some() {
            return Ok(());
        }
        let profile = self.config.chain(&chain_id)?;

        if profile.kind == ChainKind::Account {
            self.bump_stuck(&deal_id, &from, profile, now).await?;
        }

        let Some(item) = self.ledger.next_dispatchable(&deal_id, &from)? else {
            return Ok(());
        };

        // Phase barrier: a phased item waits for its prerequisite phase to be
        // COMPLETED across the whole deal.
        if let Some(phase) = item.phase {
            if let Some(prerequisite) = phase.prerequisite() {
                if !self.ledger.phase_completed(&deal_id, prerequisite)? {
                    return Ok(());
                }
            }
        }

        self.dispatch(item, profile, now).await
    }

    async fn dispatch(
        &self,
        mut item: QueueItem,
        profile: &ChainProfile,
        now: Timestamp,
    ) -> Result<(), SwapxError> {
        let adapter = self.adapters.get(&item.chain_id)?;

        // 1. Someone (a crashed worker, an operator) may already have
        //    broadcast this transfer.
        if let Some(existing) = adapter
            .check_existing_transfer(&item.from, &item.to, &item.asset, &item.amount)
            .await?
        {
            info!(
                deal_id = %item.deal_id,
                txid = %existing.txid,
                purpose = item.purpose.as_str(),
                "matching transfer already on-chain; adopting it"
            );
            item.status = QueueStatus::Completed;
            item.submitted_tx = Some(SubmittedTx {
                txid: existing.txid.clone(),
                submitted_at: now,
                nonce_or_inputs: item
                    .original_nonce
                    .map(NonceOrInputs::Nonce)
                    .unwrap_or_else(|| NonceOrInputs::Inputs(Vec::new())),
                gas_price: item.last_gas_price,
                additional_txids: Vec::new(),
            });
            self.ledger.update_queue_item(&item)?;
            self.ledger.append_event(
                &item.deal_id,
                now,
                format!("{} adopted existing transfer {}", item.purpose.as_str(), existing.txid),
            )?;
            return Ok(());
        }

        // 2. Gas budget (account chains). The item waits while the tank
        //    funds it; the GAS_FUND sender proceeds in parallel.
        if profile.kind == ChainKind::Account && item.purpose != Purpose::GasFund {
            let budget = adapter.ensure_fee_budget(&item.from, &item.asset).await?;
            if !budget.sufficient {
                let Some(tank) = self.config.tank_wallet_address.clone() else {
                    warn!(
                        deal_id = %item.deal_id,
                        from = %item.from,
                        "escrow needs gas but no tank wallet is configured"
                    );
                    return Ok(());
                };
                let outcome = self.ledger.enqueue(&PlannedItem {
                    deal_id: item.deal_id.clone(),
                    chain_id: item.chain_id.clone(),
                    from: tank,
                    to: item.from.clone(),
                    asset: profile.native_asset.clone(),
                    amount: budget.shortfall.clone(),
                    purpose: Purpose::GasFund,
                    phase: None,
                    dedup_key: format!("gas:{}", item.id),
                })?;
                if outcome.is_created() {
                    info!(
                        deal_id = %item.deal_id,
                        escrow = %item.from,
                        shortfall = %budget.shortfall,
                        "gas fund queued from tank wallet"
                    );
                    self.ledger.append_event(
                        &item.deal_id,
                        now,
                        format!("gas fund of {} queued for {}", budget.shortfall, item.from),
                    )?;
                }
                return Ok(());
            }
        }

        // 3. Nonce reservation, persisted on the item before any broadcast.
        //    A re-opened (reorged) or crash-recovered item reuses its nonce.
        let mut options = SendOptions::default();
        if profile.kind == ChainKind::Account {
            let nonce = match item.original_nonce {
                Some(n) => n,
                None => {
                    let network = match self.ledger.get_account(&item.chain_id, &item.from)? {
                        Some(acct) if acct.last_used_nonce.is_some() => None,
                        _ => Some(adapter.network_nonce(&item.from).await?),
                    };
                    let n = self.ledger.reserve_nonce(&item.chain_id, &item.from, network)?;
                    item.original_nonce = Some(n);
                    self.ledger.update_queue_item(&item)?;
                    n
                }
            };
            options.nonce = Some(nonce);
            options.gas_price = item.last_gas_price;
        }

        // 4. Submit. A failed broadcast leaves the item PENDING (nonce kept)
        //    for the next tick.
        match adapter
            .send(&item.asset, &item.from, &item.to, &item.amount, options)
            .await
        {
            Ok(receipt) => {
                info!(
                    deal_id = %item.deal_id,
                    txid = %receipt.txid,
                    purpose = item.purpose.as_str(),
                    seq = item.seq,
                    "outbound transfer submitted"
                );
                item.status = QueueStatus::Submitted;
                item.last_submit_at = Some(now);
                item.last_gas_price = receipt.gas_price.or(item.last_gas_price);
                self.ledger.append_event(
                    &item.deal_id,
                    now,
                    format!("{} submitted ({})", item.purpose.as_str(), receipt.txid),
                )?;
                item.submitted_tx = Some(receipt);
                self.ledger.update_queue_item(&item)?;
            }
            Err(e) => {
                warn!(
                    deal_id = %item.deal_id,
                    purpose = item.purpose.as_str(),
                    error = %e,
                    "broadcast failed; will retry"
                );
            }
        }
        Ok(())
    }

    /// Same-nonce gas bump for SUBMITTED items stuck past the threshold.
    /// `original_nonce` stays untouched so a replacement is always
    /// recognisable.
    async fn bump_stuck(
        &self,
        deal_id: &DealId,
        from: &str,
        profile: &ChainProfile,
        now: Timestamp,
    ) -> Result<(), SwapxError> {
        let adapter = self.adapters.get(&profile.chain_id)?;
        for mut item in self.ledger.items_for_sender(deal_id, from)? {
            if item.status != QueueStatus::Submitted {
                continue;
            }
            let Some(last_submit) = item.last_submit_at else { continue };
            if now - last_submit < self.config.gas_bump_after_secs {
                continue;
            }
            let Some(nonce) = item
                .original_nonce
                .or_else(|| item.submitted_tx.as_ref().and_then(|s| s.nonce()))
            else {
                continue;
            };

            let current = item.last_gas_price.unwrap_or(DEFAULT_GAS_PRICE_WEI);
            let bumped = current + current * self.config.gas_bump_percent as u128 / 100;

            match adapter
                .send(
                    &item.asset,
                    &item.from,
                    &item.to,
                    &item.amount,
                    SendOptions {
                        nonce: Some(nonce),
                        gas_price: Some(bumped),
                    },
                )
                .await
            {
                Ok(receipt) => {
                    warn!(
                        deal_id = %deal_id,
                        nonce,
                        gas_price = bumped,
                        attempt = item.gas_bump_attempts + 1,
                        txid = %receipt.txid,
                        "stuck transfer re-broadcast with bumped gas"
                    );
                    item.gas_bump_attempts += 1;
                    item.last_gas_price = Some(bumped);
                    item.last_submit_at = Some(now);
                    self.ledger.append_event(
                        deal_id,
                        now,
                        format!(
                            "{} gas-bumped to {} (attempt {})",
                            item.purpose.as_str(),
                            bumped,
                            item.gas_bump_attempts
                        ),
                    )?;
                    item.submitted_tx = Some(receipt);
                    self.ledger.update_queue_item(&item)?;
                }
                Err(e) => {
                    warn!(deal_id = %deal_id, nonce, error = %e, "gas bump broadcast failed");
                }
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
