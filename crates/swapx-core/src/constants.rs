//! Process-wide defaults. Anything an operator may reasonably tune is only a
//! default here and can be overridden through [`crate::config::BrokerConfig`].

/// Default commission in basis points (0.30%).
pub const DEFAULT_COMMISSION_BPS: u32 = 30;

/// Default fixed-USD commission for exotic tokens, in whole USD.
pub const DEFAULT_COMMISSION_USD_FIXED: &str = "10";

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Deal-tick period: stage evaluation cadence.
pub const DEFAULT_DEAL_TICK_SECS: u64 = 30;

/// Queue-tick period: outbound dispatch cadence.
pub const DEFAULT_QUEUE_TICK_SECS: u64 = 5;

/// Per-deal lease TTL. Upper bound on work orphaned by a crashed tick.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 90;

/// How long a SUBMITTED item may sit unconfirmed before a same-nonce
/// gas-bump resubmission.
pub const DEFAULT_GAS_BUMP_AFTER_SECS: i64 = 180;

/// Gas-price bump per resubmission, in percent.
pub const DEFAULT_GAS_BUMP_PERCENT: u32 = 15;

/// Fallback gas price (wei) when an adapter reports none on submission.
pub const DEFAULT_GAS_PRICE_WEI: u128 = 1_000_000_000;

/// Adapter confirmation count signalling a reorged / absent transaction.
pub const REORGED_CONFIRMS: i64 = -1;

/// Fallback fractional digits when a chain profile has no explicit decimals
/// for an asset.
pub const DEFAULT_ASSET_DECIMALS: u32 = 8;

/// Max quote age accepted when freezing a FIXED_USD_NATIVE commission.
pub const MAX_QUOTE_AGE_SECS: i64 = 300;

/// Page cap for event queries over RPC.
pub const MAX_EVENT_PAGE: usize = 200;
