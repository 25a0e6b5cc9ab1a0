use std::fmt;

use zeroize::Zeroizing;

use swapx_core::types::{ChainId, DealId, Party};

/// Deterministic escrow key derivation from the hot-wallet seed.
///
/// `key_ref = BLAKE3-derive_key("swapx escrow v1", seed ‖ chain ‖ deal_id ‖ party)`.
///
/// The deal id in the preimage guarantees an address is never reused across
/// deals; no index persistence is needed because the mapping is a pure
/// function of durable inputs. Adapters turn the key_ref into an on-chain
/// address with their own encoding.
pub struct EscrowDeriver {
    seed: Zeroizing<String>,
}

const DERIVE_CONTEXT: &str = "swapx escrow v1";

impl EscrowDeriver {
    pub fn new(seed: Zeroizing<String>) -> Self {
        Self { seed }
    }

    /// 32-byte derived key for `(chain, deal, party)`.
    pub fn derive(&self, chain_id: &ChainId, deal_id: &DealId, party: Party) -> [u8; 32] {
        let mut material = Vec::with_capacity(self.seed.len() + 64);
        material.extend_from_slice(self.seed.as_bytes());
        material.extend_from_slice(chain_id.as_str().as_bytes());
        material.extend_from_slice(deal_id.as_bytes());
        material.extend_from_slice(party.as_str().as_bytes());
        blake3::derive_key(DERIVE_CONTEXT, &material)
    }

    /// Hex key reference handed to adapters and stored on the deal.
    pub fn key_ref(&self, chain_id: &ChainId, deal_id: &DealId, party: Party) -> String {
        hex::encode(self.derive(chain_id, deal_id, party))
    }
}

impl fmt::Debug for EscrowDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EscrowDeriver {{ seed: <redacted> }}")
    }
}
