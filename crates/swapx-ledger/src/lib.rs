//! swapx-ledger — the broker's durable store.
//!
//! A sled-backed transactional store for deals, deposits, the outbound queue,
//! nonce accounts, leases, events and notification dedup rows. Multi-step
//! updates (seq allocation, nonce reservation, lease acquisition) are
//! serialized through an internal write mutex; readers go straight to sled.

mod db;

pub use db::{DepositUpsert, EnqueueOutcome, Ledger, PhaseFilter};
