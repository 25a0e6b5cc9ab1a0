//! The deal aggregate: two trade legs, per-party details and escrows, the
//! stage machine's current position, and the commission terms for each side.
//!
//! Stage transitions themselves live in `swapx-engine`; this module only
//! defines the data and the small invariant helpers the engine builds on.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::types::{AccessToken, Asset, ChainId, DealId, Party, Timestamp};

// ── Stage ────────────────────────────────────────────────────────────────────

/// Deal lifecycle position.
///
/// Legal transitions (enforced by the engine):
/// Created → Collection → {Waiting, Reverted}; Waiting → {Swap, Collection};
/// Swap → Closed; Reverted → Closed. Closed is terminal (post-close refunds
/// do not change the stage).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Stage {
    Created,
    Collection,
    Waiting,
    Swap,
    Reverted,
    Closed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "CREATED",
            Stage::Collection => "COLLECTION",
            Stage::Waiting => "WAITING",
            Stage::Swap => "SWAP",
            Stage::Reverted => "REVERTED",
            Stage::Closed => "CLOSED",
        }
    }

    /// Active deals are visited by the deal tick. Closed deals are only
    /// revisited through the post-close sweep.
    pub fn is_active(self) -> bool {
        !matches!(self, Stage::Closed)
    }

    /// Whether `expires_at` is enforced in this stage. The timer runs only
    /// during COLLECTION; it is suspended in WAITING (kept for a reorg
    /// return) and gone from SWAP onwards.
    pub fn deadline_enforced(self) -> bool {
        matches!(self, Stage::Collection)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Trade legs and party data ────────────────────────────────────────────────

/// What one party owes: `amount` of `asset` on `chain_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub chain_id: ChainId,
    pub asset: Asset,
    pub amount: Amount,
}

/// Addresses supplied by a party once they commit to the deal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartyDetails {
    /// Where refunds and surplus go.
    pub payback_address: String,
    /// Where the counterparty's trade amount goes.
    pub recipient_address: String,
    #[serde(default)]
    pub email: Option<String>,
    pub filled_at: Timestamp,
    /// Set once the party's deposits satisfied the lock condition at least
    /// once; informational for status reporting.
    #[serde(default)]
    pub locked: bool,
}

/// Reference to an HD-derived escrow account. The broker holds the derivation
/// reference, never key material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscrowRef {
    pub chain_id: ChainId,
    pub address: String,
    /// Opaque derivation reference understood by the owning chain adapter.
    pub key_ref: String,
}

// ── Commission ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum CommissionMode {
    /// Basis points of the trade amount, charged in the trade asset.
    PercentBps,
    /// Fixed USD value converted to the chain's native currency at quote
    /// time. Used for unknown/exotic tokens.
    FixedUsdNative,
}

/// Commission terms for one side. `amount`/`asset` are recomputed on every
/// evaluation until `frozen_at` is set (entry to WAITING); frozen terms are
/// immutable thereafter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commission {
    pub mode: CommissionMode,
    pub amount: Amount,
    pub asset: Asset,
    #[serde(default)]
    pub frozen_at: Option<Timestamp>,
}

impl Commission {
    pub fn is_frozen(&self) -> bool {
        self.frozen_at.is_some()
    }

    /// Freeze the current terms. No-op when already frozen: the first freeze
    /// wins, protecting FIXED_USD_NATIVE sides from price swings.
    pub fn freeze(&mut self, now: Timestamp) {
        if self.frozen_at.is_none() {
            self.frozen_at = Some(now);
        }
    }
}

// ── Deal ─────────────────────────────────────────────────────────────────────

/// One OTC swap between Alice and Bob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub name: String,
    pub created_at: Timestamp,
    /// Absolute collection deadline. Enforced only while
    /// `stage.deadline_enforced()`; see [`Stage`].
    pub expires_at: Timestamp,
    pub timeout_seconds: i64,

    pub alice: TradeLeg,
    pub bob: TradeLeg,

    #[serde(default)]
    pub alice_details: Option<PartyDetails>,
    #[serde(default)]
    pub bob_details: Option<PartyDetails>,

    #[serde(default)]
    pub escrow_a: Option<EscrowRef>,
    #[serde(default)]
    pub escrow_b: Option<EscrowRef>,

    pub stage: Stage,

    /// Seconds left on the collection timer when the deal entered WAITING.
    /// Restored on a reorg return to COLLECTION, discarded on entry to SWAP.
    #[serde(default)]
    pub collection_remaining_secs: Option<i64>,

    pub commission_a: Commission,
    pub commission_b: Commission,

    pub token_a: AccessToken,
    pub token_b: AccessToken,
}

impl Deal {
    pub fn leg(&self, party: Party) -> &TradeLeg {
        match party {
            Party::Alice => &self.alice,
            Party::Bob => &self.bob,
        }
    }

    pub fn details(&self, party: Party) -> Option<&PartyDetails> {
        match party {
            Party::Alice => self.alice_details.as_ref(),
            Party::Bob => self.bob_details.as_ref(),
        }
    }

    pub fn details_mut(&mut self, party: Party) -> &mut Option<PartyDetails> {
        match party {
            Party::Alice => &mut self.alice_details,
            Party::Bob => &mut self.bob_details,
        }
    }

    pub fn escrow(&self, party: Party) -> Option<&EscrowRef> {
        match party {
            Party::Alice => self.escrow_a.as_ref(),
            Party::Bob => self.escrow_b.as_ref(),
        }
    }

    pub fn set_escrow(&mut self, party: Party, escrow: EscrowRef) {
        match party {
            Party::Alice => self.escrow_a = Some(escrow),
            Party::Bob => self.escrow_b = Some(escrow),
        }
    }

    pub fn commission(&self, party: Party) -> &Commission {
        match party {
            Party::Alice => &self.commission_a,
            Party::Bob => &self.commission_b,
        }
    }

    pub fn commission_mut(&mut self, party: Party) -> &mut Commission {
        match party {
            Party::Alice => &mut self.commission_a,
            Party::Bob => &mut self.commission_b,
        }
    }

    pub fn token(&self, party: Party) -> &AccessToken {
        match party {
            Party::Alice => &self.token_a,
            Party::Bob => &self.token_b,
        }
    }

    pub fn verify_token(&self, party: Party, token: &AccessToken) -> bool {
        self.token(party) == token
    }

    pub fn both_details_filled(&self) -> bool {
        self.alice_details.is_some() && self.bob_details.is_some()
    }

    /// The remaining collection time when the deal left COLLECTION, used to
    /// resume the timer after a reorg sends a WAITING deal back.
    pub fn remaining_collection_secs(&self, now: Timestamp) -> i64 {
        (self.expires_at - now).max(0)
    }
}
