//! swapx-core — domain types for the SwapX OTC swap broker.
//!
//! Everything the broker persists or passes between components lives here:
//! - [`deal::Deal`] — one cross-chain swap between two parties
//! - [`deposit::Deposit`] — a confirmed inbound transfer on an escrow address
//! - [`queue::QueueItem`] — one intended outbound transfer
//! - [`account::Account`] / [`account::Lease`] / [`account::Event`] — ledger
//!   bookkeeping rows
//! - [`amount::Amount`] — arbitrary-precision decimal with canonical string form
//! - [`error::SwapxError`] — the single error enum shared across crates
//! - [`config::BrokerConfig`] — environment-driven process configuration

pub mod account;
pub mod amount;
pub mod config;
pub mod constants;
pub mod deal;
pub mod deposit;
pub mod error;
pub mod queue;
pub mod types;

pub use amount::Amount;
pub use error::SwapxError;
pub use types::{Asset, ChainId, DealId, Party, Timestamp};
