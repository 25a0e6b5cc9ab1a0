//! swapx-engine — the deal orchestration engine.
//!
//! Four pieces, pure ones first:
//! - [`lock`] — is a side locked? (pure sums over eligible deposits)
//! - [`planner`] — distribution / refund plans (pure, commission-from-surplus)
//! - [`watcher`] — deposit polling with reorg detection
//! - [`engine`] — the per-deal state machine driven by the deal tick

pub mod engine;
pub mod lock;
pub mod planner;
pub mod watcher;

pub use engine::DealEngine;
pub use lock::{evaluate_lock, LockStatus};
pub use watcher::DepositWatcher;
