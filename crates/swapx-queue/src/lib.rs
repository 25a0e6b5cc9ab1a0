//! swapx-queue — the outbound queue worker.
//!
//! The queue tick drains the persistent outbound queue: strictly in `seq`
//! order within a `(deal, from)` sender, in parallel across senders, with
//! phase barriers across the senders of one deal. Account chains get nonce
//! reservation, gas funding from the tank wallet and same-nonce gas bumps;
//! a nonce anomaly halts the sender until an operator reset.

mod audit;
mod worker;

pub use audit::verify_sender_nonces;
pub use worker::QueueWorker;
