use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Per-(chain, address) transaction sequence number (account-based chains).
pub type Nonce = u64;

// ── DealId ───────────────────────────────────────────────────────────────────

/// 32-byte deal identifier: BLAKE3 of `(name, created_at, entropy)`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DealId(pub [u8; 32]);

impl DealId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive a fresh deal id. The entropy makes ids unique even for
    /// identically-named deals created in the same second.
    pub fn derive(name: &str, created_at: Timestamp, entropy: &[u8; 16]) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(name.as_bytes());
        h.update(&created_at.to_be_bytes());
        h.update(entropy);
        Self(*h.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DealId({}…)", &self.to_hex()[..16])
    }
}

// ── ChainId / Asset ──────────────────────────────────────────────────────────

/// Short uppercase chain identifier, e.g. `ETH`, `UNICITY`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl ChainId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

/// Asset ticker within a chain, e.g. `ETH`, `ALPHA`. The native currency of a
/// chain is configured per [`crate::config::ChainProfile`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset(pub String);

impl Asset {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Asset({})", self.0)
    }
}

// ── Party ────────────────────────────────────────────────────────────────────

/// The two sides of a deal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Party {
    Alice,
    Bob,
}

impl Party {
    pub fn other(self) -> Self {
        match self {
            Party::Alice => Party::Bob,
            Party::Bob => Party::Alice,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Party::Alice => "alice",
            Party::Bob => "bob",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alice" | "a" => Some(Party::Alice),
            "bob" | "b" => Some(Party::Bob),
            _ => None,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── AccessToken ──────────────────────────────────────────────────────────────

/// Per-party bearer token minted at deal creation. Required by
/// `fillPartyDetails` and `cancelDeal`; compared in constant length (32 bytes).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken(pub [u8; 32]);

impl AccessToken {
    /// Mint a token bound to `(deal_id, party)` with caller-supplied entropy.
    pub fn mint(deal_id: &DealId, party: Party, entropy: &[u8; 16]) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(deal_id.as_bytes());
        h.update(party.as_str().as_bytes());
        h.update(entropy);
        Self(*h.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(…)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deal_id_hex_roundtrip() {
        let id = DealId::derive("test-deal", 1_700_000_000, &[7u8; 16]);
        let hex = id.to_hex();
        assert_eq!(DealId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn deal_id_unique_per_entropy() {
        let a = DealId::derive("same", 1, &[0u8; 16]);
        let b = DealId::derive("same", 1, &[1u8; 16]);
        assert_ne!(a, b);
    }

    #[test]
    fn chain_id_uppercased() {
        assert_eq!(ChainId::new("eth").as_str(), "ETH");
    }

    #[test]
    fn access_token_bound_to_party() {
        let id = DealId::derive("d", 1, &[0u8; 16]);
        let a = AccessToken::mint(&id, Party::Alice, &[9u8; 16]);
        let b = AccessToken::mint(&id, Party::Bob, &[9u8; 16]);
        assert_ne!(a, b);
    }
}
