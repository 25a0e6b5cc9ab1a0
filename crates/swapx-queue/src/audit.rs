//! Nonce-integrity audit.
//!
//! For each account-chain sender address, the nonces held by non-COMPLETED
//! queue items must form a contiguous, duplicate-free range. Anything else
//! means two items will fight over a nonce slot (or one will never confirm)
//! and no automatic correction is safe: the sender is halted for an operator.

use swapx_core::queue::QueueItem;

/// Check the open items of one `(chain, address)` sender. Returns a
/// description of the first anomaly found, `None` when the range is sound.
///
/// Items that have not been assigned a nonce yet are outside the range and
/// ignored.
pub fn verify_sender_nonces(items: &[QueueItem]) -> Option<String> {
    let mut nonces: Vec<u64> = items
        .iter()
        .filter(|i| i.is_open())
        .filter_map(|i| i.original_nonce.or_else(|| i.submitted_tx.as_ref().and_then(|s| s.nonce())))
        .collect();
    nonces.sort_unstable();

    for pair in nonces.windows(2) {
        if pair[1] == pair[0] {
            return Some(format!("duplicate nonce {}", pair[0]));
        }
        if pair[1] != pair[0] + 1 {
            return Some(format!("nonce gap between {} and {}", pair[0], pair[1]));
        }
    }
    None
}
