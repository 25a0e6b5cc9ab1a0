use serde::{Deserialize, Serialize};

use crate::types::{ChainId, DealId, Timestamp};

// ── Account ──────────────────────────────────────────────────────────────────

/// Nonce bookkeeping for one `(chain_id, address)`. UTXO chains never create
/// these rows; their ordering comes from the UTXO set and phase barriers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub chain_id: ChainId,
    pub address: String,
    /// Highest nonce handed out by `reserve_nonce`.
    #[serde(default)]
    pub last_used_nonce: Option<u64>,
    /// Highest nonce seen on a COMPLETED outbound item.
    #[serde(default)]
    pub last_confirmed_nonce: Option<u64>,
}

impl Account {
    pub fn new(chain_id: ChainId, address: impl Into<String>) -> Self {
        Self {
            chain_id,
            address: address.into(),
            last_used_nonce: None,
            last_confirmed_nonce: None,
        }
    }

    /// Storage key: `chain_id ‖ 0x00 ‖ address`.
    pub fn key_for(chain_id: &ChainId, address: &str) -> Vec<u8> {
        let mut k = chain_id.as_str().as_bytes().to_vec();
        k.push(0);
        k.extend_from_slice(address.as_bytes());
        k
    }

    pub fn key(&self) -> Vec<u8> {
        Self::key_for(&self.chain_id, &self.address)
    }
}

// ── Lease ────────────────────────────────────────────────────────────────────

/// Per-deal mutual exclusion for the deal tick. The holder renews; expiry is
/// the upper bound on work orphaned by a crashed process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub deal_id: DealId,
    pub owner_id: String,
    pub until: Timestamp,
}

impl Lease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.until
    }
}

// ── Event ────────────────────────────────────────────────────────────────────

/// Append-only audit log row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub deal_id: DealId,
    pub time: Timestamp,
    pub message: String,
}

// ── Notification ─────────────────────────────────────────────────────────────

/// Idempotency row for outbound notifications. The transport is external;
/// uniqueness of `(deal_id, event_type, event_key)` is what the broker owns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub deal_id: DealId,
    pub event_type: String,
    pub event_key: String,
    pub created_at: Timestamp,
}

impl Notification {
    /// Storage key: `deal_id ‖ event_type ‖ 0x00 ‖ event_key`.
    pub fn key_for(deal_id: &DealId, event_type: &str, event_key: &str) -> Vec<u8> {
        let mut k = deal_id.as_bytes().to_vec();
        k.extend_from_slice(event_type.as_bytes());
        k.push(0);
        k.extend_from_slice(event_key.as_bytes());
        k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry_boundary() {
        let lease = Lease {
            deal_id: DealId::derive("d", 1, &[0u8; 16]),
            owner_id: "worker-1".into(),
            until: 100,
        };
        assert!(!lease.is_expired(99));
        assert!(lease.is_expired(100));
    }

    #[test]
    fn account_keys_do_not_collide() {
        // The separator prevents ("AB", "C") colliding with ("A", "BC").
        let a = Account::key_for(&ChainId::new("AB"), "C");
        let b = Account::key_for(&ChainId::new("A"), "BC");
        assert_ne!(a, b);
    }
}
