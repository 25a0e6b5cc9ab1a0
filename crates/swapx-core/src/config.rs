//! Environment-driven broker configuration.
//!
//! Recognised keys (see README of the deployment repo for full operator docs):
//!   HOT_WALLET_SEED              HD root for escrow derivation
//!   TANK_WALLET_KEY              key funding gas for account-chain escrows
//!   TANK_WALLET_ADDRESS          the tank wallet's on-chain address
//!   <CHAIN>_RPC                  account-chain gateway endpoint
//!   <CHAIN>_ELECTRUM             UTXO-chain gateway endpoint
//!   <CHAIN>_CONFIRMATIONS        finality threshold (SWAP)
//!   <CHAIN>_COLLECT_CONFIRMS     lock threshold (COLLECTION), ≤ CONFIRMATIONS
//!   <CHAIN>_OPERATOR_ADDRESS     commission destination
//!   <CHAIN>_NATIVE               native asset ticker (default: chain id)
//!   <CHAIN>_DECIMALS             native decimals (default 8)
//!   <CHAIN>_ASSET_DECIMALS       per-asset overrides, "ALPHA=8,USDT=6"
//!   <CHAIN>_EXOTIC_ASSETS        assets quoted at FIXED_USD_NATIVE commission
//!   COMMISSION_BPS               default 30
//!   COMMISSION_USD_FIXED         default 10
//!   PRODUCTION_MODE              "true"/"1"
//!   ALLOWED_CHAINS               comma-separated chain ids
//!   ALLOWED_ASSETS               comma-separated tickers
//!   MAX_AMOUNTS                  "ETH:ETH=10,UNICITY:ALPHA=1000000"
//!   GAS_BUMP_AFTER_SECS / GAS_BUMP_PERCENT / LEASE_TTL_SECS
//!   DEAL_TICK_SECS / QUEUE_TICK_SECS
//!
//! Whether a chain is UTXO- or account-style follows from which endpoint key
//! it was configured with: `_ELECTRUM` means UTXO, `_RPC` means account.

use std::collections::BTreeMap;
use std::fmt;

use zeroize::Zeroizing;

use crate::amount::Amount;
use crate::constants::{
    DEFAULT_ASSET_DECIMALS, DEFAULT_COMMISSION_BPS, DEFAULT_COMMISSION_USD_FIXED,
    DEFAULT_DEAL_TICK_SECS, DEFAULT_GAS_BUMP_AFTER_SECS, DEFAULT_GAS_BUMP_PERCENT,
    DEFAULT_LEASE_TTL_SECS, DEFAULT_QUEUE_TICK_SECS,
};
use crate::error::SwapxError;
use crate::types::{Asset, ChainId};

// ── ChainProfile ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChainKind {
    /// Output-based chain; outbound ordering comes from phases.
    Utxo,
    /// Account/nonce chain; outbound ordering comes from nonce reservation.
    Account,
}

#[derive(Clone, Debug)]
pub struct ChainProfile {
    pub chain_id: ChainId,
    pub kind: ChainKind,
    pub endpoint: String,
    /// Finality threshold: confirmations required in WAITING (and for
    /// outbound completion).
    pub confirmations: u32,
    /// Lock threshold: confirmations required in COLLECTION.
    pub collect_confirms: u32,
    pub operator_address: String,
    pub native_asset: Asset,
    pub native_decimals: u32,
    asset_decimals: BTreeMap<Asset, u32>,
    /// Assets whose commission is quoted as FIXED_USD_NATIVE instead of
    /// percent-of-trade.
    exotic_assets: Vec<Asset>,
}

impl ChainProfile {
    pub fn is_exotic(&self, asset: &Asset) -> bool {
        self.exotic_assets.contains(asset)
    }

    pub fn decimals_for(&self, asset: &Asset) -> u32 {
        if let Some(d) = self.asset_decimals.get(asset) {
            return *d;
        }
        if *asset == self.native_asset {
            return self.native_decimals;
        }
        DEFAULT_ASSET_DECIMALS
    }
}

// ── BrokerConfig ─────────────────────────────────────────────────────────────

pub struct BrokerConfig {
    pub hot_wallet_seed: Option<Zeroizing<String>>,
    pub tank_wallet_key: Option<Zeroizing<String>>,
    pub tank_wallet_address: Option<String>,

    pub chains: BTreeMap<ChainId, ChainProfile>,

    pub commission_bps: u32,
    pub commission_usd_fixed: Amount,

    pub production_mode: bool,
    pub allowed_assets: Option<Vec<Asset>>,
    pub max_amounts: BTreeMap<(ChainId, Asset), Amount>,

    pub gas_bump_after_secs: i64,
    pub gas_bump_percent: u32,
    pub lease_ttl_secs: i64,
    pub deal_tick_secs: u64,
    pub queue_tick_secs: u64,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("hot_wallet_seed", &self.hot_wallet_seed.as_ref().map(|_| "<redacted>"))
            .field("tank_wallet_key", &self.tank_wallet_key.as_ref().map(|_| "<redacted>"))
            .field("chains", &self.chains.keys().collect::<Vec<_>>())
            .field("commission_bps", &self.commission_bps)
            .field("production_mode", &self.production_mode)
            .finish_non_exhaustive()
    }
}

impl BrokerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, SwapxError> {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Pure construction from a key→value map, for tests.
    pub fn from_env_map(vars: &BTreeMap<String, String>) -> Result<Self, SwapxError> {
        let chains = discover_chains(vars)?;

        let commission_bps = parse_or(vars, "COMMISSION_BPS", DEFAULT_COMMISSION_BPS)?;
        let commission_usd_fixed = match vars.get("COMMISSION_USD_FIXED") {
            Some(v) => Amount::parse(v)?,
            None => Amount::parse(DEFAULT_COMMISSION_USD_FIXED)
                .map_err(|e| SwapxError::InvalidConfig(e.to_string()))?,
        };

        let allowed_assets = vars.get("ALLOWED_ASSETS").map(|v| {
            v.split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| Asset::new(s.trim()))
                .collect()
        });

        let max_amounts = match vars.get("MAX_AMOUNTS") {
            Some(v) => parse_max_amounts(v)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            hot_wallet_seed: vars.get("HOT_WALLET_SEED").map(|s| Zeroizing::new(s.clone())),
            tank_wallet_key: vars.get("TANK_WALLET_KEY").map(|s| Zeroizing::new(s.clone())),
            tank_wallet_address: vars.get("TANK_WALLET_ADDRESS").cloned(),
            chains,
            commission_bps,
            commission_usd_fixed,
            production_mode: parse_bool(vars.get("PRODUCTION_MODE")),
            allowed_assets,
            max_amounts,
            gas_bump_after_secs: parse_or(vars, "GAS_BUMP_AFTER_SECS", DEFAULT_GAS_BUMP_AFTER_SECS)?,
            gas_bump_percent: parse_or(vars, "GAS_BUMP_PERCENT", DEFAULT_GAS_BUMP_PERCENT)?,
            lease_ttl_secs: parse_or(vars, "LEASE_TTL_SECS", DEFAULT_LEASE_TTL_SECS)?,
            deal_tick_secs: parse_or(vars, "DEAL_TICK_SECS", DEFAULT_DEAL_TICK_SECS)?,
            queue_tick_secs: parse_or(vars, "QUEUE_TICK_SECS", DEFAULT_QUEUE_TICK_SECS)?,
        })
    }

    pub fn chain(&self, chain_id: &ChainId) -> Result<&ChainProfile, SwapxError> {
        self.chains
            .get(chain_id)
            .ok_or_else(|| SwapxError::ChainNotConfigured(chain_id.to_string()))
    }

    /// Admission check applied at `createDeal`. Rejects unknown chains,
    /// disallowed assets and over-limit amounts.
    pub fn admit(&self, chain_id: &ChainId, asset: &Asset, amount: &Amount) -> Result<(), SwapxError> {
        self.chain(chain_id)?;
        if let Some(allowed) = &self.allowed_assets {
            if !allowed.contains(asset) {
                return Err(SwapxError::AssetNotAllowed(asset.to_string()));
            }
        }
        if let Some(max) = self.max_amounts.get(&(chain_id.clone(), asset.clone())) {
            if amount > max {
                return Err(SwapxError::AmountTooLarge {
                    chain: chain_id.to_string(),
                    asset: asset.to_string(),
                    amount: amount.to_canonical_string(),
                    max: max.to_canonical_string(),
                });
            }
        }
        Ok(())
    }
}

// ── Parsing helpers ──────────────────────────────────────────────────────────

fn discover_chains(vars: &BTreeMap<String, String>) -> Result<BTreeMap<ChainId, ChainProfile>, SwapxError> {
    // Chains come from ALLOWED_CHAINS when given, otherwise from every
    // configured endpoint key.
    let names: Vec<String> = match vars.get("ALLOWED_CHAINS") {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => {
            let mut names: Vec<String> = vars
                .keys()
                .filter_map(|k| {
                    k.strip_suffix("_RPC")
                        .or_else(|| k.strip_suffix("_ELECTRUM"))
                        .map(str::to_string)
                })
                .collect();
            names.sort();
            names.dedup();
            names
        }
    };

    let mut chains = BTreeMap::new();
    for name in names {
        let chain_id = ChainId::new(&name);
        let (endpoint, kind) = match (
            vars.get(&format!("{name}_RPC")),
            vars.get(&format!("{name}_ELECTRUM")),
        ) {
            (Some(rpc), None) => (rpc.clone(), ChainKind::Account),
            (None, Some(el)) => (el.clone(), ChainKind::Utxo),
            (Some(_), Some(_)) => {
                return Err(SwapxError::InvalidConfig(format!(
                    "{name}: both _RPC and _ELECTRUM configured"
                )))
            }
            (None, None) => {
                return Err(SwapxError::InvalidConfig(format!(
                    "{name}: no endpoint ({name}_RPC or {name}_ELECTRUM)"
                )))
            }
        };

        let confirmations: u32 = parse_or(vars, &format!("{name}_CONFIRMATIONS"), 6)?;
        let collect_confirms: u32 =
            parse_or(vars, &format!("{name}_COLLECT_CONFIRMS"), confirmations)?;
        if collect_confirms > confirmations {
            return Err(SwapxError::InvalidConfig(format!(
                "{name}: COLLECT_CONFIRMS ({collect_confirms}) > CONFIRMATIONS ({confirmations})"
            )));
        }

        let operator_address = vars
            .get(&format!("{name}_OPERATOR_ADDRESS"))
            .cloned()
            .ok_or_else(|| {
                SwapxError::InvalidConfig(format!("{name}: missing {name}_OPERATOR_ADDRESS"))
            })?;

        let native_asset = vars
            .get(&format!("{name}_NATIVE"))
            .map(|s| Asset::new(s.trim()))
            .unwrap_or_else(|| Asset::new(&name));
        let native_decimals: u32 =
            parse_or(vars, &format!("{name}_DECIMALS"), DEFAULT_ASSET_DECIMALS)?;

        let asset_decimals = match vars.get(&format!("{name}_ASSET_DECIMALS")) {
            Some(v) => parse_asset_decimals(v)?,
            None => BTreeMap::new(),
        };

        let exotic_assets = vars
            .get(&format!("{name}_EXOTIC_ASSETS"))
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| Asset::new(s.trim()))
                    .collect()
            })
            .unwrap_or_default();

        chains.insert(
            chain_id.clone(),
            ChainProfile {
                chain_id,
                kind,
                endpoint,
                confirmations,
                collect_confirms,
                operator_address,
                native_asset,
                native_decimals,
                asset_decimals,
                exotic_assets,
            },
        );
    }
    Ok(chains)
}

fn parse_or<T: std::str::FromStr>(
    vars: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, SwapxError>
where
    T::Err: fmt::Display,
{
    match vars.get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| SwapxError::InvalidConfig(format!("{key}={v}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(v: Option<&String>) -> bool {
    matches!(v.map(|s| s.trim()), Some("true") | Some("1") | Some("TRUE"))
}

fn parse_asset_decimals(v: &str) -> Result<BTreeMap<Asset, u32>, SwapxError> {
    let mut out = BTreeMap::new();
    for pair in v.split(',').filter(|s| !s.trim().is_empty()) {
        let (asset, dec) = pair
            .split_once('=')
            .ok_or_else(|| SwapxError::InvalidConfig(format!("asset decimals entry {pair:?}")))?;
        let dec: u32 = dec
            .trim()
            .parse()
            .map_err(|e| SwapxError::InvalidConfig(format!("asset decimals {pair:?}: {e}")))?;
        out.insert(Asset::new(asset.trim()), dec);
    }
    Ok(out)
}

fn parse_max_amounts(v: &str) -> Result<BTreeMap<(ChainId, Asset), Amount>, SwapxError> {
    let mut out = BTreeMap::new();
    for entry in v.split(',').filter(|s| !s.trim().is_empty()) {
        let (key, amount) = entry
            .split_once('=')
            .ok_or_else(|| SwapxError::InvalidConfig(format!("MAX_AMOUNTS entry {entry:?}")))?;
        let (chain, asset) = key
            .split_once(':')
            .ok_or_else(|| SwapxError::InvalidConfig(format!("MAX_AMOUNTS key {key:?}")))?;
        out.insert(
            (ChainId::new(chain.trim()), Asset::new(asset.trim())),
            Amount::parse(amount.trim())?,
        );
    }
    Ok(out)
}
