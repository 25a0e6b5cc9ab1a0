//! The per-deal state machine.
//!
//! `DealEngine::tick_deal` runs once per deal per deal-tick, under the deal's
//! lease: poll deposits, reconfirm submitted outbound items, then act for the
//! current stage. Every decision uses the `now` captured at tick start, so a
//! tick racing the deadline stays consistent.
//!
//! Transition safety rules carried here:
//! - a deadline never reverts a deal whose two sides are both locked;
//! - commissions freeze on entry to WAITING and are immutable after;
//! - the collection timer is suspended in WAITING, restored on a reorg
//!   return, and discarded on entry to SWAP — from there the swap runs to
//!   completion, retried indefinitely on transient failure;
//! - a reorg return to COLLECTION drops still-PENDING phased items and keeps
//!   SUBMITTED ones for confirmation tracking to settle.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use swapx_chain::AdapterRegistry;
use swapx_core::config::{BrokerConfig, ChainKind};
use swapx_core::constants::MAX_QUOTE_AGE_SECS;
use swapx_core::deal::{Commission, CommissionMode, Deal, EscrowRef, Stage};
use swapx_core::deposit::Deposit;
use swapx_core::queue::{Purpose, QueueItem, QueueStatus};
use swapx_core::types::{DealId, Party, Timestamp};
use swapx_core::SwapxError;
use swapx_ledger::Ledger;

use crate::lock::{eligible_deposits, evaluate_lock, LockStatus};
use crate::planner::{plan_post_close_side, plan_refund_side, plan_swap_side, Plan};
use crate::watcher::DepositWatcher;

pub struct DealEngine {
    ledger: Arc<Ledger>,
    adapters: AdapterRegistry,
    config: Arc<BrokerConfig>,
    watcher: DepositWatcher,
    owner_id: String,
}

impl DealEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        adapters: AdapterRegistry,
        config: Arc<BrokerConfig>,
        owner_id: impl Into<String>,
    ) -> Self {
        let watcher = DepositWatcher::new(Arc::clone(&ledger), adapters.clone());
        Self {
            ledger,
            adapters,
            config,
            watcher,
            owner_id: owner_id.into(),
        }
    }

    /// One deal-tick for one deal. `now` is captured once by the driver.
    pub async fn tick_deal(&self, deal_id: &DealId, now: Timestamp) -> Result<(), SwapxError> {
        let deal = self
            .ledger
            .get_deal(deal_id)?
            .ok_or_else(|| SwapxError::DealNotFound(deal_id.to_hex()))?;

        if deal.stage == Stage::Closed {
            return self.post_close_sweep(deal, now).await;
        }

        match self
            .ledger
            .acquire_lease(deal_id, &self.owner_id, self.config.lease_ttl_secs, now)
        {
            Ok(_) => {}
            Err(SwapxError::LeaseHeld { owner, .. }) => {
                debug!(deal_id = %deal_id, owner = %owner, "lease held elsewhere; skipping tick");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let result = self.run_stage(deal, now).await;
        // Best effort; an expired lease is reclaimed anyway.
        let _ = self.ledger.release_lease(deal_id, &self.owner_id);
        result
    }

    async fn run_stage(&self, mut deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        self.ensure_escrows(&mut deal, now).await?;

        // Poll both sides; the watcher degrades to the ledger snapshot on
        // adapter trouble, so this only fails on storage errors.
        self.watcher.poll_side(&deal, Party::Alice).await?;
        self.watcher.poll_side(&deal, Party::Bob).await?;

        self.reconfirm_submitted(&deal, now).await?;

        match deal.stage {
            Stage::Created => self.on_created(deal, now),
            Stage::Collection => self.on_collection(deal, now).await,
            Stage::Waiting => self.on_waiting(deal, now).await,
            Stage::Swap => self.on_swap(deal, now),
            Stage::Reverted => self.on_reverted(deal, now).await,
            Stage::Closed => Ok(()),
        }
    }

    /// Create missing escrow accounts for parties whose details are in.
    /// Derivation is deterministic, so a crashed earlier attempt lands on the
    /// same address.
    async fn ensure_escrows(&self, deal: &mut Deal, now: Timestamp) -> Result<(), SwapxError> {
        for party in [Party::Alice, Party::Bob] {
            if deal.details(party).is_none() || deal.escrow(party).is_some() {
                continue;
            }
            let leg = deal.leg(party).clone();
            let adapter = self.adapters.get(&leg.chain_id)?;
            let acct = adapter
                .generate_escrow_account(&leg.asset, &deal.id, party)
                .await?;
            info!(deal_id = %deal.id, party = %party, address = %acct.address, "escrow account created");
            deal.set_escrow(
                party,
                EscrowRef {
                    chain_id: acct.chain_id,
                    address: acct.address.clone(),
                    key_ref: acct.key_ref,
                },
            );
            self.ledger.put_deal(deal)?;
            self.ledger
                .append_event(&deal.id, now, format!("escrow created for {party}: {}", acct.address))?;
        }
        Ok(())
    }

    // ── Submitted-item reconfirmation ────────────────────────────────────────

    /// Refresh confirmation depth of every SUBMITTED outbound item of the
    /// deal. Finality completes the item (and advances the account's
    /// confirmed nonce); `-1` re-opens it with the nonce kept.
    async fn reconfirm_submitted(&self, deal: &Deal, now: Timestamp) -> Result<(), SwapxError> {
        for mut item in self.ledger.items_for_deal(&deal.id)? {
            if item.status != QueueStatus::Submitted {
                continue;
            }
            let Some(submitted) = item.submitted_tx.clone() else {
                continue;
            };
            let profile = self.config.chain(&item.chain_id)?;
            let adapter = self.adapters.get(&item.chain_id)?;
            match adapter.get_tx_confirmations(&submitted.txid).await {
                Ok(confirms) if confirms >= profile.confirmations as i64 => {
                    item.status = QueueStatus::Completed;
                    self.ledger.update_queue_item(&item)?;
                    if let Some(nonce) = submitted.nonce() {
                        self.ledger
                            .record_confirmed_nonce(&item.chain_id, &item.from, nonce)?;
                    }
                    info!(
                        deal_id = %deal.id,
                        txid = %submitted.txid,
                        purpose = item.purpose.as_str(),
                        "outbound transfer reached finality"
                    );
                    self.ledger.append_event(
                        &deal.id,
                        now,
                        format!("{} confirmed ({})", item.purpose.as_str(), submitted.txid),
                    )?;
                }
                Ok(-1) => {
                    // Outbound reorg: re-open, keep the nonce, resubmit later.
                    warn!(
                        deal_id = %deal.id,
                        txid = %submitted.txid,
                        "outbound transfer reorged; re-opening item"
                    );
                    item.status = QueueStatus::Pending;
                    self.ledger.update_queue_item(&item)?;
                    self.ledger.append_event(
                        &deal.id,
                        now,
                        format!("{} reorged; will resubmit ({})", item.purpose.as_str(), submitted.txid),
                    )?;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(deal_id = %deal.id, txid = %submitted.txid, error = %e, "confirmation check failed");
                }
            }
        }
        Ok(())
    }

    // ── Stage handlers ───────────────────────────────────────────────────────

    fn on_created(&self, mut deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        if !deal.both_details_filled() {
            return Ok(());
        }
        deal.stage = Stage::Collection;
        // The collection timer starts when both parties are in.
        deal.expires_at = now + deal.timeout_seconds;
        self.ledger.put_deal(&deal)?;
        self.ledger.append_event(
            &deal.id,
            now,
            format!("entering COLLECTION; deadline {}", deal.expires_at),
        )?;
        self.ledger
            .record_notification(&deal.id, "DETAILS_FILLED", "both", now)?;
        info!(deal_id = %deal.id, expires_at = deal.expires_at, "deal entered COLLECTION");
        Ok(())
    }

    async fn on_collection(&self, mut deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        // Refresh un-frozen commission terms. A missing price quote keeps the
        // side un-lockable but must not stop deadline handling.
        let mut quotes_ok = true;
        for party in [Party::Alice, Party::Bob] {
            match self.resolve_commission(&deal, party, now).await {
                Ok(c) => *deal.commission_mut(party) = c,
                Err(SwapxError::QuoteUnavailable { chain }) => {
                    warn!(deal_id = %deal.id, chain = %chain, "commission quote unavailable; WAITING blocked");
                    quotes_ok = false;
                }
                Err(e) => return Err(e),
            }
        }

        let status_a = self.side_lock_status(&deal, Party::Alice, LockLevel::Collect).await?;
        let status_b = self.side_lock_status(&deal, Party::Bob, LockLevel::Collect).await?;
        let both_locked = quotes_ok && status_a.locked() && status_b.locked();

        if both_locked {
            // Freeze commissions at the terms used for the lock decision.
            deal.commission_a.freeze(now);
            deal.commission_b.freeze(now);
            if let Some(d) = deal.alice_details.as_mut() {
                d.locked = true;
            }
            if let Some(d) = deal.bob_details.as_mut() {
                d.locked = true;
            }
            deal.collection_remaining_secs = Some(deal.remaining_collection_secs(now));
            deal.stage = Stage::Waiting;
            self.ledger.put_deal(&deal)?;
            self.ledger
                .append_event(&deal.id, now, "both sides locked; entering WAITING")?;
            self.ledger.record_notification(&deal.id, "LOCKED", "both", now)?;
            info!(deal_id = %deal.id, "deal entered WAITING");
            return Ok(());
        }

        if now >= deal.expires_at {
            // Not both locked at the deadline: revert and refund whatever is
            // confirmed. (Both-locked deals took the WAITING branch above.)
            deal.stage = Stage::Reverted;
            self.ledger.put_deal(&deal)?;
            self.ledger
                .append_event(&deal.id, now, "deadline passed without both locks; entering REVERTED")?;
            self.ledger.record_notification(&deal.id, "REVERTED", "deadline", now)?;
            info!(deal_id = %deal.id, "deal entered REVERTED");
            self.enqueue_refunds(&deal, now).await?;
        }
        Ok(())
    }

    async fn on_waiting(&self, mut deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        let final_a = self.side_lock_status(&deal, Party::Alice, LockLevel::Finality).await?;
        let final_b = self.side_lock_status(&deal, Party::Bob, LockLevel::Finality).await?;

        if final_a.locked() && final_b.locked() {
            self.enter_swap(&mut deal, now).await?;
            return Ok(());
        }

        // Still waiting for depth is fine; a broken COLLECTION-level lock is
        // a reorg and sends the deal back.
        let collect_a = self.side_lock_status(&deal, Party::Alice, LockLevel::Collect).await?;
        let collect_b = self.side_lock_status(&deal, Party::Bob, LockLevel::Collect).await?;
        if collect_a.locked() && collect_b.locked() {
            return Ok(());
        }

        let remaining = deal.collection_remaining_secs.take().unwrap_or(0);
        deal.expires_at = now + remaining;
        deal.stage = Stage::Collection;
        let dropped = self.ledger.drop_pending_phased(&deal.id)?;
        self.ledger.put_deal(&deal)?;
        self.ledger.append_event(
            &deal.id,
            now,
            format!("reorg broke a lock; back to COLLECTION with {remaining}s remaining"),
        )?;
        if dropped > 0 {
            self.ledger.append_event(
                &deal.id,
                now,
                format!("dropped {dropped} undispatched swap items"),
            )?;
        }
        warn!(deal_id = %deal.id, dropped, "reorg during WAITING; deal back to COLLECTION");
        Ok(())
    }

    async fn enter_swap(&self, deal: &mut Deal, now: Timestamp) -> Result<(), SwapxError> {
        // Plan both sides first; the stage flips only after every item is
        // recorded, so a crash replays the (idempotent) plan.
        for party in [Party::Alice, Party::Bob] {
            let plan = self.build_swap_plan(deal, party, now).await?;
            self.apply_plan(&deal.id, &plan, now)?;
        }
        deal.stage = Stage::Swap;
        deal.collection_remaining_secs = None;
        self.ledger.put_deal(deal)?;
        self.ledger
            .append_event(&deal.id, now, "finality reached on both sides; executing swap")?;
        self.ledger.record_notification(&deal.id, "SWAP", "started", now)?;
        info!(deal_id = %deal.id, "deal entered SWAP");
        Ok(())
    }

    fn on_swap(&self, mut deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        let items = self.ledger.items_for_deal(&deal.id)?;
        let core_items: Vec<&QueueItem> = items
            .iter()
            .filter(|i| matches!(i.purpose, Purpose::SwapPayout | Purpose::OpCommission))
            .collect();
        let done = !core_items.is_empty()
            && core_items.iter().all(|i| i.status == QueueStatus::Completed);
        if !done {
            return Ok(());
        }
        deal.stage = Stage::Closed;
        self.ledger.put_deal(&deal)?;
        self.ledger
            .append_event(&deal.id, now, "swap distribution complete; deal CLOSED")?;
        self.ledger.record_notification(&deal.id, "CLOSED", "swapped", now)?;
        info!(deal_id = %deal.id, "deal CLOSED after swap");
        Ok(())
    }

    async fn on_reverted(&self, mut deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        // Deposits can still confirm after the revert; fold them into the
        // refund plan (idempotent per deposit).
        self.enqueue_refunds(&deal, now).await?;

        let items = self.ledger.items_for_deal(&deal.id)?;
        let refunds: Vec<&QueueItem> = items
            .iter()
            .filter(|i| i.purpose == Purpose::TimeoutRefund)
            .collect();
        let done = refunds.iter().all(|i| i.status == QueueStatus::Completed);
        if !done {
            return Ok(());
        }
        deal.stage = Stage::Closed;
        self.ledger.put_deal(&deal)?;
        self.ledger
            .append_event(&deal.id, now, "refunds complete; deal CLOSED")?;
        self.ledger.record_notification(&deal.id, "CLOSED", "reverted", now)?;
        info!(deal_id = %deal.id, "deal CLOSED after revert");
        Ok(())
    }

    /// CLOSED-stage sweep: refund deposits that confirmed past finality but
    /// were never part of the settled set. A tick with nothing new performs
    /// no ledger writes and takes no lease.
    async fn post_close_sweep(&self, deal: Deal, now: Timestamp) -> Result<(), SwapxError> {
        if !self.has_unsettled_deposits(&deal).await? {
            return Ok(());
        }

        match self
            .ledger
            .acquire_lease(&deal.id, &self.owner_id, self.config.lease_ttl_secs, now)
        {
            Ok(_) => {}
            Err(SwapxError::LeaseHeld { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        let result = self.post_close_refunds(&deal, now).await;
        let _ = self.ledger.release_lease(&deal.id, &self.owner_id);
        result
    }

    /// Read-only probe: is there anything on either escrow that the settled
    /// set does not account for?
    async fn has_unsettled_deposits(&self, deal: &Deal) -> Result<bool, SwapxError> {
        for party in [Party::Alice, Party::Bob] {
            let Some(escrow) = deal.escrow(party) else { continue };
            let known = self.ledger.deposits_for_address(&deal.id, &escrow.address)?;
            if known.iter().any(|d| !d.consumed && !d.is_orphaned()) {
                return Ok(true);
            }
            let leg = deal.leg(party);
            let commission = deal.commission(party);
            let adapter = self.adapters.get(&escrow.chain_id)?;
            let mut assets = vec![&leg.asset];
            if commission.asset != leg.asset {
                assets.push(&commission.asset);
            }
            for asset in assets {
                let page = match adapter
                    .list_confirmed_deposits(asset, &escrow.address, 1, None)
                    .await
                {
                    Ok(page) => page,
                    // Transient adapter trouble: nothing to do this tick.
                    Err(_) => continue,
                };
                for found in page.deposits {
                    let is_known = known
                        .iter()
                        .any(|d| d.txid == found.txid && d.index == found.index);
                    if !is_known {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn post_close_refunds(&self, deal: &Deal, now: Timestamp) -> Result<(), SwapxError> {
        self.watcher.poll_side(deal, Party::Alice).await?;
        self.watcher.poll_side(deal, Party::Bob).await?;

        for party in [Party::Alice, Party::Bob] {
            let Some(escrow) = deal.escrow(party) else { continue };
            let profile = self.config.chain(&escrow.chain_id)?;
            let deposits = self.ledger.deposits_for_address(&deal.id, &escrow.address)?;
            let late: Vec<&Deposit> =
                eligible_deposits(&deposits, profile.confirmations, None)
                    .into_iter()
                    .filter(|d| !d.consumed)
                    .collect();
            if late.is_empty() {
                continue;
            }
            let plan = plan_post_close_side(deal, party, escrow, &late)?;
            let created = self.apply_plan(&deal.id, &plan, now)?;
            if created > 0 {
                self.ledger.append_event(
                    &deal.id,
                    now,
                    format!("late deposit after close; {created} post-close refund(s) queued"),
                )?;
                for (txid, index) in &plan.consumed {
                    self.ledger.record_notification(
                        &deal.id,
                        "POST_CLOSE_REFUND",
                        &format!("{txid}:{index}"),
                        now,
                    )?;
                }
                info!(deal_id = %deal.id, party = %party, created, "post-close refunds queued");
            }
        }
        Ok(())
    }

    // ── Plan helpers ─────────────────────────────────────────────────────────

    async fn build_swap_plan(
        &self,
        deal: &Deal,
        party: Party,
        _now: Timestamp,
    ) -> Result<Plan, SwapxError> {
        let escrow = deal
            .escrow(party)
            .ok_or_else(|| SwapxError::InvalidInput("escrow missing at swap".into()))?;
        let profile = self.config.chain(&escrow.chain_id)?;
        let deposits = self.ledger.deposits_for_address(&deal.id, &escrow.address)?;
        let eligible: Vec<&Deposit> =
            eligible_deposits(&deposits, profile.confirmations, Some(deal.expires_at))
                .into_iter()
                .filter(|d| !d.consumed)
                .collect();
        plan_swap_side(
            deal,
            party,
            escrow,
            &eligible,
            &profile.operator_address,
            profile.kind == ChainKind::Utxo,
        )
    }

    /// Refund every confirmed, unconsumed deposit of both sides.
    async fn enqueue_refunds(&self, deal: &Deal, now: Timestamp) -> Result<(), SwapxError> {
        for party in [Party::Alice, Party::Bob] {
            let Some(escrow) = deal.escrow(party) else { continue };
            if deal.details(party).is_none() {
                continue;
            }
            let profile = self.config.chain(&escrow.chain_id)?;
            let deposits = self.ledger.deposits_for_address(&deal.id, &escrow.address)?;
            let confirmed: Vec<&Deposit> =
                eligible_deposits(&deposits, profile.collect_confirms, None)
                    .into_iter()
                    .filter(|d| !d.consumed)
                    .collect();
            if confirmed.is_empty() {
                continue;
            }
            let plan = plan_refund_side(deal, party, escrow, &confirmed)?;
            let created = self.apply_plan(&deal.id, &plan, now)?;
            if created > 0 {
                self.ledger.append_event(
                    &deal.id,
                    now,
                    format!("{created} timeout refund(s) queued for {party}"),
                )?;
            }
        }
        Ok(())
    }

    /// Enqueue a plan's items (idempotent via dedup keys) and mark its
    /// deposits consumed. A safeguard rejection is surfaced as critical and
    /// leaves the deal in its current stage for operator intervention.
    fn apply_plan(&self, deal_id: &DealId, plan: &Plan, now: Timestamp) -> Result<usize, SwapxError> {
        let mut created = 0;
        for item in &plan.items {
            match self.ledger.enqueue(item) {
                Ok(outcome) => {
                    if outcome.is_created() {
                        created += 1;
                    }
                }
                Err(e @ SwapxError::ConflictingQueueItem { .. }) => {
                    error!(deal_id = %deal_id, error = %e, "conflicting operation; manual intervention required");
                    self.ledger.append_event(
                        deal_id,
                        now,
                        format!("enqueue rejected: {e}"),
                    )?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.ledger.mark_deposits_consumed(deal_id, &plan.consumed)?;
        Ok(created)
    }

    // ── Evaluation helpers ───────────────────────────────────────────────────

    async fn side_lock_status(
        &self,
        deal: &Deal,
        party: Party,
        level: LockLevel,
    ) -> Result<LockStatus, SwapxError> {
        let leg = deal.leg(party);
        let commission = deal.commission(party);
        let profile = self.config.chain(&leg.chain_id)?;
        let min_confirms = match level {
            LockLevel::Collect => profile.collect_confirms,
            LockLevel::Finality => profile.confirmations,
        };
        let deposits = match deal.escrow(party) {
            Some(escrow) => self.ledger.deposits_for_address(&deal.id, &escrow.address)?,
            None => Vec::new(),
        };
        Ok(evaluate_lock(
            &deposits,
            &leg.asset,
            &leg.amount,
            &commission.asset,
            &commission.amount,
            min_confirms,
            Some(deal.expires_at),
        ))
    }

    /// Current commission terms for a side. Frozen terms are returned
    /// verbatim; otherwise percent terms are recomputed from the leg and
    /// fixed-USD terms are quoted (and rejected when the quote is stale).
    async fn resolve_commission(
        &self,
        deal: &Deal,
        party: Party,
        now: Timestamp,
    ) -> Result<Commission, SwapxError> {
        let current = deal.commission(party);
        if current.is_frozen() {
            return Ok(current.clone());
        }
        let leg = deal.leg(party);
        let profile = self.config.chain(&leg.chain_id)?;
        match current.mode {
            CommissionMode::PercentBps => Ok(Commission {
                mode: CommissionMode::PercentBps,
                amount: leg.amount.mul_bps_floor(
                    self.config.commission_bps,
                    profile.decimals_for(&leg.asset),
                ),
                asset: leg.asset.clone(),
                frozen_at: None,
            }),
            CommissionMode::FixedUsdNative => {
                let adapter = self.adapters.get(&leg.chain_id)?;
                let quote = adapter
                    .quote_native_for_usd(&self.config.commission_usd_fixed)
                    .await?;
                if now - quote.as_of > MAX_QUOTE_AGE_SECS {
                    return Err(SwapxError::QuoteUnavailable {
                        chain: leg.chain_id.to_string(),
                    });
                }
                Ok(Commission {
                    mode: CommissionMode::FixedUsdNative,
                    amount: quote.native_amount,
                    asset: profile.native_asset.clone(),
                    frozen_at: None,
                })
            }
        }
    }

    /// External cancellation: permitted only in CREATED with no observed
    /// deposits, checked under the deal lease.
    pub async fn cancel_deal(&self, deal_id: &DealId, now: Timestamp) -> Result<(), SwapxError> {
        self.ledger
            .acquire_lease(deal_id, &self.owner_id, self.config.lease_ttl_secs, now)?;
        let result = self.cancel_under_lease(deal_id, now).await;
        let _ = self.ledger.release_lease(deal_id, &self.owner_id);
        result
    }

    async fn cancel_under_lease(&self, deal_id: &DealId, now: Timestamp) -> Result<(), SwapxError> {
        let mut deal = self
            .ledger
            .get_deal(deal_id)?
            .ok_or_else(|| SwapxError::DealNotFound(deal_id.to_hex()))?;
        if deal.stage != Stage::Created {
            return Err(SwapxError::NotCancellable {
                deal_id: deal_id.to_hex(),
                reason: format!("stage is {}", deal.stage),
            });
        }
        // Late-cancel protection: look again for deposits before tearing
        // down, including anything only visible on-chain.
        self.watcher.poll_side(&deal, Party::Alice).await?;
        self.watcher.poll_side(&deal, Party::Bob).await?;
        if !self.ledger.deposits_for_deal(deal_id)?.is_empty() {
            return Err(SwapxError::NotCancellable {
                deal_id: deal_id.to_hex(),
                reason: "deposits already observed".into(),
            });
        }
        deal.stage = Stage::Closed;
        self.ledger.put_deal(&deal)?;
        self.ledger.append_event(deal_id, now, "deal cancelled")?;
        self.ledger.record_notification(deal_id, "CLOSED", "cancelled", now)?;
        info!(deal_id = %deal_id, "deal cancelled");
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum LockLevel {
    Collect,
    Finality,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use swapx_chain::mock::MockChain;
    use swapx_core::amount::Amount;
    use swapx_core::deal::{PartyDetails, TradeLeg};
    use swapx_core::queue::{NonceOrInputs, Phase, PlannedItem, SubmittedTx};
    use swapx_core::types::{AccessToken, Asset, ChainId};

    struct Harness {
        ledger: Arc<Ledger>,
        eth: Arc<MockChain>,
        unicity: Arc<MockChain>,
        engine: DealEngine,
    }

    fn config() -> Arc<BrokerConfig> {
        let mut vars = BTreeMap::new();
        vars.insert("ETH_RPC".into(), "http://gateway-eth".into());
        vars.insert("ETH_CONFIRMATIONS".into(), "12".into());
        vars.insert("ETH_COLLECT_CONFIRMS".into(), "3".into());
        vars.insert("ETH_OPERATOR_ADDRESS".into(), "op-eth".into());
        vars.insert("ETH_DECIMALS".into(), "18".into());
        vars.insert("UNICITY_ELECTRUM".into(), "tcp://gateway-uni".into());
        vars.insert("UNICITY_CONFIRMATIONS".into(), "6".into());
        vars.insert("UNICITY_COLLECT_CONFIRMS".into(), "2".into());
        vars.insert("UNICITY_OPERATOR_ADDRESS".into(), "op-uni".into());
        vars.insert("UNICITY_ASSET_DECIMALS".into(), "ALPHA=8".into());
        Arc::new(BrokerConfig::from_env_map(&vars).unwrap())
    }

    fn harness(name: &str) -> Harness {
        let dir = std::env::temp_dir().join(format!("swapx_engine_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        let ledger = Arc::new(Ledger::open(&dir).expect("open temp db"));
        let eth = Arc::new(MockChain::new(ChainId::new("ETH"), ChainKind::Account, 18));
        let unicity = Arc::new(MockChain::new(ChainId::new("UNICITY"), ChainKind::Utxo, 8));
        let mut registry = AdapterRegistry::new();
        registry.insert(eth.clone());
        registry.insert(unicity.clone());
        let engine = DealEngine::new(Arc::clone(&ledger), registry, config(), "test-worker");
        Harness { ledger, eth, unicity, engine }
    }

    fn details(tag: &str) -> PartyDetails {
        PartyDetails {
            payback_address: format!("{tag}-payback"),
            recipient_address: format!("{tag}-recipient"),
            email: None,
            filled_at: 1_000,
            locked: false,
        }
    }

    fn seed_deal(h: &Harness, tag: u8) -> Deal {
        let id = DealId::from_bytes([tag; 32]);
        let deal = Deal {
            id: id.clone(),
            name: format!("deal-{tag}"),
            created_at: 1_000,
            expires_at: 1_000 + 3_600,
            timeout_seconds: 3_600,
            alice: TradeLeg {
                chain_id: ChainId::new("ETH"),
                asset: Asset::new("ETH"),
                amount: Amount::parse("1.0").unwrap(),
            },
            bob: TradeLeg {
                chain_id: ChainId::new("UNICITY"),
                asset: Asset::new("ALPHA"),
                amount: Amount::parse("100").unwrap(),
            },
            alice_details: Some(details("alice")),
            bob_details: Some(details("bob")),
            escrow_a: None,
            escrow_b: None,
            stage: Stage::Created,
            collection_remaining_secs: None,
            commission_a: Commission {
                mode: CommissionMode::PercentBps,
                amount: Amount::zero(),
                asset: Asset::new("ETH"),
                frozen_at: None,
            },
            commission_b: Commission {
                mode: CommissionMode::PercentBps,
                amount: Amount::zero(),
                asset: Asset::new("ALPHA"),
                frozen_at: None,
            },
            token_a: AccessToken::mint(&id, Party::Alice, &[0u8; 16]),
            token_b: AccessToken::mint(&id, Party::Bob, &[1u8; 16]),
        };
        h.ledger.put_deal(&deal).unwrap();
        deal
    }

    async fn tick(h: &Harness, id: &DealId, now: Timestamp) -> Deal {
        h.engine.tick_deal(id, now).await.unwrap();
        h.ledger.get_deal(id).unwrap().unwrap()
    }

    /// Tick into COLLECTION and return the escrow addresses (alice, bob).
    async fn into_collection(h: &Harness, id: &DealId, now: Timestamp) -> (String, String) {
        let deal = tick(h, id, now).await;
        assert_eq!(deal.stage, Stage::Collection);
        (
            deal.escrow_a.as_ref().unwrap().address.clone(),
            deal.escrow_b.as_ref().unwrap().address.clone(),
        )
    }

    #[tokio::test]
    async fn created_moves_to_collection_and_creates_escrows() {
        let h = harness("created");
        let deal = seed_deal(&h, 1);
        let after = tick(&h, &deal.id, 2_000).await;
        assert_eq!(after.stage, Stage::Collection);
        assert_eq!(after.expires_at, 2_000 + 3_600);
        assert!(after.escrow_a.is_some());
        assert!(after.escrow_b.is_some());
        // Percent commissions resolved on the first COLLECTION tick.
    }

    #[tokio::test]
    async fn collection_locks_both_sides_and_freezes_commission() {
        let h = harness("lock");
        let deal = seed_deal(&h, 2);
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;

        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_100);
        h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 2, 2_100);

        let after = tick(&h, &deal.id, 2_200).await;
        assert_eq!(after.stage, Stage::Waiting);
        assert!(after.commission_a.is_frozen());
        assert_eq!(after.commission_a.amount, Amount::parse("0.003").unwrap());
        assert_eq!(after.commission_b.amount, Amount::parse("0.3").unwrap());
        assert_eq!(after.collection_remaining_secs, Some(2_000 + 3_600 - 2_200));
        assert!(after.alice_details.as_ref().unwrap().locked);
    }

    #[tokio::test]
    async fn partial_deposit_does_not_lock() {
        let h = harness("partial");
        let deal = seed_deal(&h, 3);
        let (esc_a, _) = into_collection(&h, &deal.id, 2_000).await;
        // Trade covered but not trade+commission.
        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0", 12, 2_100);
        let after = tick(&h, &deal.id, 2_200).await;
        assert_eq!(after.stage, Stage::Collection);
    }

    #[tokio::test]
    async fn deadline_reverts_and_queues_refund() {
        let h = harness("revert");
        let deal = seed_deal(&h, 4);
        let (esc_a, _) = into_collection(&h, &deal.id, 2_000).await;
        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_100);

        // Bob never shows up; deadline passes.
        let after = tick(&h, &deal.id, 2_000 + 3_600).await;
        assert_eq!(after.stage, Stage::Reverted);

        let items = h.ledger.items_for_deal(&deal.id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].purpose, Purpose::TimeoutRefund);
        assert_eq!(items[0].amount, Amount::parse("1.0030").unwrap());
        assert_eq!(items[0].to, "alice-payback");
    }

    #[tokio::test]
    async fn deadline_with_both_locked_enters_waiting_not_reverted() {
        let h = harness("no_revert");
        let deal = seed_deal(&h, 5);
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;
        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_100);
        h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 2, 2_100);

        // Tick lands exactly on the deadline with both sides locked.
        let after = tick(&h, &deal.id, 2_000 + 3_600).await;
        assert_eq!(after.stage, Stage::Waiting);
    }

    #[tokio::test]
    async fn waiting_reaches_finality_and_plans_swap() {
        let h = harness("swap_plan");
        let deal = seed_deal(&h, 6);
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;
        let tx_a = h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_100);
        let tx_b = h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 2, 2_100);

        let after = tick(&h, &deal.id, 2_200).await;
        assert_eq!(after.stage, Stage::Waiting);

        h.eth.set_confirms(&tx_a, 12);
        h.unicity.set_confirms(&tx_b, 6);
        let after = tick(&h, &deal.id, 2_400).await;
        assert_eq!(after.stage, Stage::Swap);
        assert_eq!(after.collection_remaining_secs, None);

        let items = h.ledger.items_for_deal(&deal.id).unwrap();
        // ETH side: payout + commission (no surplus). UNICITY side: payout +
        // commission, phased.
        let eth_items: Vec<_> = items.iter().filter(|i| i.chain_id == ChainId::new("ETH")).collect();
        let uni_items: Vec<_> = items.iter().filter(|i| i.chain_id == ChainId::new("UNICITY")).collect();
        assert_eq!(eth_items.len(), 2);
        assert_eq!(uni_items.len(), 2);
        assert!(eth_items.iter().all(|i| i.phase.is_none()));
        assert_eq!(uni_items[0].phase, Some(Phase::Phase1Swap));
        assert_eq!(uni_items[1].phase, Some(Phase::Phase2Commission));

        let payout = eth_items.iter().find(|i| i.purpose == Purpose::SwapPayout).unwrap();
        assert_eq!(payout.amount, Amount::parse("1.0").unwrap());
        assert_eq!(payout.to, "bob-recipient");

        // Deposits are settled.
        let deps = h.ledger.deposits_for_deal(&deal.id).unwrap();
        assert!(deps.iter().all(|d| d.consumed));
    }

    #[tokio::test]
    async fn waiting_reorg_returns_to_collection_and_drops_pending_phased() {
        let h = harness("reorg_back");
        let deal = seed_deal(&h, 7);
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;
        let tx_a = h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_100);
        h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 2, 2_100);

        let after = tick(&h, &deal.id, 2_200).await;
        assert_eq!(after.stage, Stage::Waiting);

        // Simulate the planned-but-undispatched edge: a pending phased item
        // exists when the reorg hits.
        h.ledger
            .enqueue(&PlannedItem {
                deal_id: deal.id.clone(),
                chain_id: ChainId::new("UNICITY"),
                from: esc_b.clone(),
                to: "alice-recipient".into(),
                asset: Asset::new("ALPHA"),
                amount: Amount::parse("100").unwrap(),
                purpose: Purpose::SwapPayout,
                phase: Some(Phase::Phase1Swap),
                dedup_key: format!("swap:{esc_b}"),
            })
            .unwrap();

        h.eth.reorg(&tx_a);
        let after = tick(&h, &deal.id, 2_600).await;
        assert_eq!(after.stage, Stage::Collection);
        // Timer resumed from the suspended remainder.
        assert_eq!(after.expires_at, 2_600 + (2_000 + 3_600 - 2_200));
        assert_eq!(after.collection_remaining_secs, None);
        assert!(h.ledger.items_for_deal(&deal.id).unwrap().is_empty());

        // Alice re-deposits; the deal walks forward again.
        let tx_a2 = h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_700);
        let after = tick(&h, &deal.id, 2_800).await;
        assert_eq!(after.stage, Stage::Waiting);

        // Alice reaches finality but Bob's side has not yet; still WAITING.
        h.eth.set_confirms(&tx_a2, 12);
        let after = tick(&h, &deal.id, 2_900).await;
        assert_eq!(after.stage, Stage::Waiting);
    }

    #[tokio::test]
    async fn swap_closes_once_payout_and_commission_complete() {
        let h = harness("swap_close");
        let deal = seed_deal(&h, 8);
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;
        let tx_a = h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 12, 2_100);
        let tx_b = h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 6, 2_100);
        let _ = (tx_a, tx_b);

        // Locks and finality in one pass.
        let after = tick(&h, &deal.id, 2_200).await;
        assert_eq!(after.stage, Stage::Waiting);
        let after = tick(&h, &deal.id, 2_300).await;
        assert_eq!(after.stage, Stage::Swap);

        // Still open: nothing completed yet.
        let after = tick(&h, &deal.id, 2_400).await;
        assert_eq!(after.stage, Stage::Swap);

        // Complete all payout/commission items out-of-band (the worker's
        // job) and close.
        for mut item in h.ledger.items_for_deal(&deal.id).unwrap() {
            item.status = QueueStatus::Completed;
            h.ledger.update_queue_item(&item).unwrap();
        }
        let after = tick(&h, &deal.id, 2_500).await;
        assert_eq!(after.stage, Stage::Closed);
    }

    #[tokio::test]
    async fn reverted_with_no_deposits_closes_immediately() {
        let h = harness("revert_empty");
        let deal = seed_deal(&h, 9);
        into_collection(&h, &deal.id, 2_000).await;
        let after = tick(&h, &deal.id, 2_000 + 3_600).await;
        assert_eq!(after.stage, Stage::Reverted);
        let after = tick(&h, &deal.id, 2_000 + 3_700).await;
        assert_eq!(after.stage, Stage::Closed);
    }

    #[tokio::test]
    async fn reverted_closes_after_refund_completes() {
        let h = harness("revert_close");
        let deal = seed_deal(&h, 10);
        let (esc_a, _) = into_collection(&h, &deal.id, 2_000).await;
        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 3, 2_100);
        let after = tick(&h, &deal.id, 2_000 + 3_600).await;
        assert_eq!(after.stage, Stage::Reverted);

        for mut item in h.ledger.items_for_deal(&deal.id).unwrap() {
            item.status = QueueStatus::Completed;
            h.ledger.update_queue_item(&item).unwrap();
        }
        let after = tick(&h, &deal.id, 2_000 + 3_700).await;
        assert_eq!(after.stage, Stage::Closed);
    }

    #[tokio::test]
    async fn post_close_late_deposit_gets_refund_without_commission() {
        let h = harness("post_close");
        let deal = seed_deal(&h, 11);
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;
        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "1.0030", 12, 2_100);
        h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 6, 2_100);
        tick(&h, &deal.id, 2_200).await;
        tick(&h, &deal.id, 2_300).await;
        for mut item in h.ledger.items_for_deal(&deal.id).unwrap() {
            item.status = QueueStatus::Completed;
            h.ledger.update_queue_item(&item).unwrap();
        }
        let after = tick(&h, &deal.id, 2_500).await;
        assert_eq!(after.stage, Stage::Closed);

        // A late 5 ALPHA lands past finality.
        h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "5", 6, 9_000);
        let after = tick(&h, &deal.id, 9_100).await;
        assert_eq!(after.stage, Stage::Closed);

        let refunds: Vec<_> = h
            .ledger
            .items_for_deal(&deal.id)
            .unwrap()
            .into_iter()
            .filter(|i| i.purpose == Purpose::PostCloseRefund)
            .collect();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, Amount::parse("5").unwrap());
        assert_eq!(refunds[0].to, "bob-payback");

        // Re-running the sweep adds nothing.
        tick(&h, &deal.id, 9_200).await;
        let again: Vec<_> = h
            .ledger
            .items_for_deal(&deal.id)
            .unwrap()
            .into_iter()
            .filter(|i| i.purpose == Purpose::PostCloseRefund)
            .collect();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn quote_unavailable_blocks_waiting() {
        let h = harness("quote");
        let mut deal = seed_deal(&h, 12);
        deal.commission_a.mode = CommissionMode::FixedUsdNative;
        h.ledger.put_deal(&deal).unwrap();
        let (esc_a, esc_b) = into_collection(&h, &deal.id, 2_000).await;
        h.eth.add_deposit(&esc_a, &Asset::new("ETH"), "2", 3, 2_100);
        h.unicity.add_deposit(&esc_b, &Asset::new("ALPHA"), "100.3", 2, 2_100);

        // No ETH/USD quote: the deal must sit in COLLECTION.
        let after = tick(&h, &deal.id, 2_200).await;
        assert_eq!(after.stage, Stage::Collection);

        // Fresh quote: $10 at 0.0005 ETH/USD is 0.005 ETH commission.
        h.eth.set_quote("0.0005", 2_250);
        let after = tick(&h, &deal.id, 2_300).await;
        assert_eq!(after.stage, Stage::Waiting);
        assert!(after.commission_a.is_frozen());
        assert_eq!(after.commission_a.amount, Amount::parse("0.005").unwrap());
        assert_eq!(after.commission_a.asset, Asset::new("ETH"));
    }

    #[tokio::test]
    async fn lease_held_skips_tick() {
        let h = harness("lease");
        let deal = seed_deal(&h, 13);
        h.ledger.acquire_lease(&deal.id, "someone-else", 90, 2_000).unwrap();
        let after = tick(&h, &deal.id, 2_010).await;
        // Untouched: still CREATED.
        assert_eq!(after.stage, Stage::Created);
    }

    #[tokio::test]
    async fn reconfirm_completes_submitted_and_tracks_nonce() {
        let h = harness("reconfirm");
        let deal = seed_deal(&h, 14);
        let (esc_a, _) = into_collection(&h, &deal.id, 2_000).await;

        let outcome = h
            .ledger
            .enqueue(&PlannedItem {
                deal_id: deal.id.clone(),
                chain_id: ChainId::new("ETH"),
                from: esc_a.clone(),
                to: "bob-recipient".into(),
                asset: Asset::new("ETH"),
                amount: Amount::parse("1").unwrap(),
                purpose: Purpose::SwapPayout,
                phase: None,
                dedup_key: format!("swap:{esc_a}"),
            })
            .unwrap();
        let mut item = outcome.item().clone();
        item.status = QueueStatus::Submitted;
        item.original_nonce = Some(5);
        item.submitted_tx = Some(SubmittedTx {
            txid: "out-tx-1".into(),
            submitted_at: 2_100,
            nonce_or_inputs: NonceOrInputs::Nonce(5),
            gas_price: Some(100),
            additional_txids: vec![],
        });
        h.ledger.update_queue_item(&item).unwrap();

        h.eth.set_confirms("out-tx-1", 12);
        tick(&h, &deal.id, 2_200).await;

        let items = h.ledger.items_for_deal(&deal.id).unwrap();
        assert_eq!(items[0].status, QueueStatus::Completed);
        let account = h.ledger.get_account(&ChainId::new("ETH"), &esc_a).unwrap().unwrap();
        assert_eq!(account.last_confirmed_nonce, Some(5));
    }

    #[tokio::test]
    async fn reconfirm_reopens_reorged_outbound_keeping_nonce() {
        let h = harness("reconfirm_reorg");
        let deal = seed_deal(&h, 15);
        let (esc_a, _) = into_collection(&h, &deal.id, 2_000).await;

        let outcome = h
            .ledger
            .enqueue(&PlannedItem {
                deal_id: deal.id.clone(),
                chain_id: ChainId::new("ETH"),
                from: esc_a.clone(),
                to: "bob-recipient".into(),
                asset: Asset::new("ETH"),
                amount: Amount::parse("1").unwrap(),
                purpose: Purpose::SwapPayout,
                phase: None,
                dedup_key: format!("swap:{esc_a}"),
            })
            .unwrap();
        let mut item = outcome.item().clone();
        item.status = QueueStatus::Submitted;
        item.original_nonce = Some(9);
        item.submitted_tx = Some(SubmittedTx {
            txid: "out-tx-2".into(),
            submitted_at: 2_100,
            nonce_or_inputs: NonceOrInputs::Nonce(9),
            gas_price: Some(100),
            additional_txids: vec![],
        });
        h.ledger.update_queue_item(&item).unwrap();

        h.eth.set_confirms("out-tx-2", -1);
        tick(&h, &deal.id, 2_200).await;

        let items = h.ledger.items_for_deal(&deal.id).unwrap();
        assert_eq!(items[0].status, QueueStatus::Pending);
        assert_eq!(items[0].original_nonce, Some(9));
    }

    #[tokio::test]
    async fn closed_tick_without_new_deposits_writes_nothing() {
        let h = harness("closed_noop");
        let deal = seed_deal(&h, 18);
        h.engine.cancel_deal(&deal.id, 1_500).await.unwrap();
        let events_before = h.ledger.events_for_deal(&deal.id, 0, 100).unwrap().len();

        tick(&h, &deal.id, 5_000).await;
        tick(&h, &deal.id, 5_030).await;

        // No items, no events, no lease held: another owner can take the
        // lease immediately.
        assert!(h.ledger.items_for_deal(&deal.id).unwrap().is_empty());
        assert_eq!(h.ledger.events_for_deal(&deal.id, 0, 100).unwrap().len(), events_before);
        h.ledger.acquire_lease(&deal.id, "other", 90, 5_031).unwrap();
    }

    #[tokio::test]
    async fn cancel_only_in_created_without_deposits() {
        let h = harness("cancel");
        let deal = seed_deal(&h, 16);
        h.engine.cancel_deal(&deal.id, 1_500).await.unwrap();
        assert_eq!(h.ledger.get_deal(&deal.id).unwrap().unwrap().stage, Stage::Closed);

        // A deal past CREATED refuses.
        let deal2 = seed_deal(&h, 17);
        tick(&h, &deal2.id, 2_000).await;
        assert!(matches!(
            h.engine.cancel_deal(&deal2.id, 2_100).await,
            Err(SwapxError::NotCancellable { .. })
        ));
    }
}
