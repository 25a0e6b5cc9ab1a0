use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::constants::REORGED_CONFIRMS;
use crate::types::{Asset, ChainId, DealId, Timestamp};

/// A confirmed inbound transfer observed on an escrow address.
///
/// Primary key: `(deal_id, txid, index)` — the `index` disambiguates multiple
/// outputs of one UTXO transaction. Rows are append-only per key; re-observing
/// a deposit only refreshes `confirms`, `block_height`, `block_time` and the
/// `orphaned` flag. Totals are always recomputed from rows, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub deal_id: DealId,
    pub txid: String,
    pub index: u32,

    pub chain_id: ChainId,
    pub address: String,
    pub asset: Asset,
    pub amount: Amount,

    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub block_time: Option<Timestamp>,
    pub confirms: i64,

    /// Set when the adapter reported `confirms = -1`. Orphaned deposits are
    /// excluded from lock evaluation until they resurface.
    #[serde(default)]
    pub orphaned: bool,

    /// Broker bookkeeping, not a watcher field: set once this deposit has
    /// been distributed by a swap, refund or post-close plan. Deposits that
    /// confirm after close and are still unconsumed get a post-close refund.
    #[serde(default)]
    pub consumed: bool,
}

impl Deposit {
    /// Storage key under the deal's prefix: `txid ‖ 0x00 ‖ index_be`.
    pub fn subkey(txid: &str, index: u32) -> Vec<u8> {
        let mut k = txid.as_bytes().to_vec();
        k.push(0);
        k.extend_from_slice(&index.to_be_bytes());
        k
    }

    pub fn key(&self) -> Vec<u8> {
        Self::subkey(&self.txid, self.index)
    }

    /// Apply a fresh observation of the same `(txid, index)`. Only the
    /// mutable fields move; identity fields are left untouched.
    pub fn refresh_from(&mut self, observed: &Deposit) {
        self.confirms = observed.confirms;
        self.block_height = observed.block_height;
        self.block_time = observed.block_time;
        self.orphaned = observed.confirms == REORGED_CONFIRMS;
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned || self.confirms == REORGED_CONFIRMS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit(confirms: i64) -> Deposit {
        Deposit {
            deal_id: DealId::derive("d", 1, &[0u8; 16]),
            txid: "ab12".into(),
            index: 0,
            chain_id: ChainId::new("ETH"),
            address: "0xescrow".into(),
            asset: Asset::new("ETH"),
            amount: Amount::parse("1.0030").unwrap(),
            block_height: Some(100),
            block_time: Some(1_000),
            confirms,
            orphaned: false,
            consumed: false,
        }
    }

    #[test]
    fn refresh_updates_only_mutable_fields() {
        let mut d = deposit(3);
        let mut seen = deposit(12);
        seen.block_height = Some(101);
        seen.amount = Amount::parse("999").unwrap(); // identity field, must not move
        d.refresh_from(&seen);
        assert_eq!(d.confirms, 12);
        assert_eq!(d.block_height, Some(101));
        assert_eq!(d.amount, Amount::parse("1.0030").unwrap());
        assert!(!d.is_orphaned());
    }

    #[test]
    fn reorg_marks_orphaned() {
        let mut d = deposit(12);
        d.refresh_from(&deposit(-1));
        assert!(d.is_orphaned());
        // Resurrection clears the flag.
        d.refresh_from(&deposit(2));
        assert!(!d.is_orphaned());
    }

    #[test]
    fn subkey_disambiguates_outputs() {
        assert_ne!(Deposit::subkey("tx", 0), Deposit::subkey("tx", 1));
    }
}
