use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use swapx_core::config::BrokerConfig;
use swapx_core::constants::MAX_EVENT_PAGE;
use swapx_core::deal::{Commission, CommissionMode, Deal, PartyDetails, Stage, TradeLeg};
use swapx_core::deposit::Deposit;
use swapx_core::types::{AccessToken, Asset, ChainId, DealId, Party};
use swapx_core::{Amount, SwapxError};
use swapx_engine::DealEngine;
use swapx_ledger::Ledger;

use crate::api::SwapxApiServer;
use crate::types::{
    RpcCreateDeal, RpcDealCreated, RpcDealStatus, RpcDealSummary, RpcEscrow, RpcEvent,
    RpcFillDetails, RpcSideTotals, RpcTradeLeg,
};

/// Deals may not park in COLLECTION forever.
const MAX_TIMEOUT_SECS: i64 = 30 * 24 * 3_600;

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

fn to_rpc_err(e: SwapxError) -> ErrorObject<'static> {
    match &e {
        SwapxError::DealNotFound(_) => rpc_err(-32001, e.to_string()),
        SwapxError::InvalidToken
        | SwapxError::InvalidInput(_)
        | SwapxError::InvalidAmount(_)
        | SwapxError::ChainNotConfigured(_)
        | SwapxError::ChainNotAllowed(_)
        | SwapxError::AssetNotAllowed(_)
        | SwapxError::AmountTooLarge { .. } => rpc_err(-32602, e.to_string()),
        SwapxError::NotCancellable { .. }
        | SwapxError::DetailsAlreadyFilled(_)
        | SwapxError::WrongStage { .. } => rpc_err(-32000, e.to_string()),
        _ => rpc_err(-32603, e.to_string()),
    }
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub ledger: Arc<Ledger>,
    pub engine: Arc<DealEngine>,
    pub config: Arc<BrokerConfig>,
    /// Optional ping channel to the deal-tick driver: a deal mutated over RPC
    /// is re-evaluated without waiting for the next periodic tick.
    pub tick_tx: Option<tokio::sync::mpsc::Sender<DealId>>,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }

    fn nudge_driver(&self, deal_id: &DealId) {
        if let Some(tx) = &self.state.tick_tx {
            if tx.try_send(deal_id.clone()).is_err() {
                // Full channel is fine; the periodic tick covers it.
                warn!(deal_id = %deal_id, "tick trigger channel full");
            }
        }
    }

    fn parse_leg(&self, leg: &RpcTradeLeg) -> Result<TradeLeg, SwapxError> {
        let chain_id = ChainId::new(&leg.chain_id);
        let asset = Asset::new(&leg.asset);
        let amount = Amount::parse(&leg.amount)?;
        if !amount.is_positive() {
            return Err(SwapxError::InvalidAmount("trade amount must be positive".into()));
        }
        self.state.config.admit(&chain_id, &asset, &amount)?;
        Ok(TradeLeg { chain_id, asset, amount })
    }

    /// Initial commission terms for a leg: percent-of-trade for known assets,
    /// fixed-USD-in-native for configured exotics. Amounts are resolved by
    /// the engine on the first COLLECTION tick.
    fn initial_commission(&self, leg: &TradeLeg) -> Result<Commission, SwapxError> {
        let profile = self.state.config.chain(&leg.chain_id)?;
        Ok(if profile.is_exotic(&leg.asset) {
            Commission {
                mode: CommissionMode::FixedUsdNative,
                amount: Amount::zero(),
                asset: profile.native_asset.clone(),
                frozen_at: None,
            }
        } else {
            Commission {
                mode: CommissionMode::PercentBps,
                amount: Amount::zero(),
                asset: leg.asset.clone(),
                frozen_at: None,
            }
        })
    }

    fn side_totals(&self, deal: &Deal, party: Party) -> Result<RpcSideTotals, SwapxError> {
        let deposits: Vec<Deposit> = match deal.escrow(party) {
            Some(escrow) => self.state.ledger.deposits_for_address(&deal.id, &escrow.address)?,
            None => Vec::new(),
        };
        let confirmed = Amount::sum(
            deposits
                .iter()
                .filter(|d| !d.is_orphaned() && d.asset == deal.leg(party).asset)
                .map(|d| &d.amount),
        );
        Ok(RpcSideTotals {
            confirmed: confirmed.to_canonical_string(),
            deposit_count: deposits.len() as u32,
            locked: deal.details(party).map(|d| d.locked).unwrap_or(false),
        })
    }
}

#[async_trait]
impl SwapxApiServer for RpcServer {
    async fn create_deal(&self, request: RpcCreateDeal) -> RpcResult<RpcDealCreated> {
        if request.timeout_seconds <= 0 || request.timeout_seconds > MAX_TIMEOUT_SECS {
            return Err(rpc_err(-32602, "timeout_seconds out of range"));
        }
        let alice = self.parse_leg(&request.alice).map_err(to_rpc_err)?;
        let bob = self.parse_leg(&request.bob).map_err(to_rpc_err)?;

        let now = chrono::Utc::now().timestamp();
        let name = request
            .name
            .unwrap_or_else(|| format!("{}/{}", alice.asset, bob.asset));
        let id = DealId::derive(&name, now, &rand::random::<[u8; 16]>());
        let token_a = AccessToken::mint(&id, Party::Alice, &rand::random::<[u8; 16]>());
        let token_b = AccessToken::mint(&id, Party::Bob, &rand::random::<[u8; 16]>());

        let commission_a = self.initial_commission(&alice).map_err(to_rpc_err)?;
        let commission_b = self.initial_commission(&bob).map_err(to_rpc_err)?;

        let deal = Deal {
            id: id.clone(),
            name: name.clone(),
            created_at: now,
            // Provisional; the collection timer restarts when both details
            // are in.
            expires_at: now + request.timeout_seconds,
            timeout_seconds: request.timeout_seconds,
            alice,
            bob,
            alice_details: None,
            bob_details: None,
            escrow_a: None,
            escrow_b: None,
            stage: Stage::Created,
            collection_remaining_secs: None,
            commission_a,
            commission_b,
            token_a: token_a.clone(),
            token_b: token_b.clone(),
        };
        self.state.ledger.put_deal(&deal).map_err(to_rpc_err)?;
        self.state
            .ledger
            .append_event(&id, now, format!("deal created: {name}"))
            .map_err(to_rpc_err)?;
        info!(deal_id = %id, name = %name, "deal created");

        Ok(RpcDealCreated {
            deal_id: id.to_hex(),
            token_a: token_a.to_hex(),
            token_b: token_b.to_hex(),
        })
    }

    async fn fill_party_details(&self, request: RpcFillDetails) -> RpcResult<bool> {
        let deal_id = DealId::from_hex(&request.deal_id)
            .map_err(|e| rpc_err(-32602, format!("invalid deal id: {e}")))?;
        let party = Party::from_str_loose(&request.party)
            .ok_or_else(|| rpc_err(-32602, "party must be \"alice\" or \"bob\""))?;
        let token = AccessToken::from_hex(&request.token)
            .map_err(|e| rpc_err(-32602, format!("invalid token: {e}")))?;
        if request.payback_address.trim().is_empty() || request.recipient_address.trim().is_empty() {
            return Err(rpc_err(-32602, "payback and recipient addresses are required"));
        }

        let mut deal = self
            .state
            .ledger
            .get_deal(&deal_id)
            .map_err(to_rpc_err)?
            .ok_or_else(|| to_rpc_err(SwapxError::DealNotFound(request.deal_id.clone())))?;

        if !deal.verify_token(party, &token) {
            return Err(to_rpc_err(SwapxError::InvalidToken));
        }
        if deal.stage != Stage::Created {
            return Err(to_rpc_err(SwapxError::WrongStage {
                deal_id: deal_id.to_hex(),
                stage: deal.stage.to_string(),
            }));
        }
        if deal.details(party).is_some() {
            return Err(to_rpc_err(SwapxError::DetailsAlreadyFilled(deal_id.to_hex())));
        }

        let now = chrono::Utc::now().timestamp();
        *deal.details_mut(party) = Some(PartyDetails {
            payback_address: request.payback_address.trim().to_string(),
            recipient_address: request.recipient_address.trim().to_string(),
            email: request.email,
            filled_at: now,
            locked: false,
        });
        self.state.ledger.put_deal(&deal).map_err(to_rpc_err)?;
        self.state
            .ledger
            .append_event(&deal_id, now, format!("details filled for {party}"))
            .map_err(to_rpc_err)?;
        info!(deal_id = %deal_id, party = %party, "party details filled");

        self.nudge_driver(&deal_id);
        Ok(true)
    }

    async fn status(&self, deal_id: String) -> RpcResult<RpcDealStatus> {
        let id = DealId::from_hex(&deal_id)
            .map_err(|e| rpc_err(-32602, format!("invalid deal id: {e}")))?;
        let deal = self
            .state
            .ledger
            .get_deal(&id)
            .map_err(to_rpc_err)?
            .ok_or_else(|| to_rpc_err(SwapxError::DealNotFound(deal_id)))?;

        let events = self
            .state
            .ledger
            .events_for_deal(&id, 0, MAX_EVENT_PAGE)
            .map_err(to_rpc_err)?
            .into_iter()
            .map(|e| RpcEvent {
                time: e.time,
                message: e.message,
            })
            .collect();

        let escrow = |e: &swapx_core::deal::EscrowRef| RpcEscrow {
            chain_id: e.chain_id.to_string(),
            address: e.address.clone(),
        };

        Ok(RpcDealStatus {
            deal_id: deal.id.to_hex(),
            name: deal.name.clone(),
            stage: deal.stage.to_string(),
            created_at: deal.created_at,
            expires_at: deal.expires_at,
            escrow_a: deal.escrow_a.as_ref().map(escrow),
            escrow_b: deal.escrow_b.as_ref().map(escrow),
            alice_totals: self.side_totals(&deal, Party::Alice).map_err(to_rpc_err)?,
            bob_totals: self.side_totals(&deal, Party::Bob).map_err(to_rpc_err)?,
            events,
        })
    }

    async fn cancel_deal(&self, deal_id: String, token: String) -> RpcResult<bool> {
        let id = DealId::from_hex(&deal_id)
            .map_err(|e| rpc_err(-32602, format!("invalid deal id: {e}")))?;
        let token = AccessToken::from_hex(&token)
            .map_err(|e| rpc_err(-32602, format!("invalid token: {e}")))?;

        let deal = self
            .state
            .ledger
            .get_deal(&id)
            .map_err(to_rpc_err)?
            .ok_or_else(|| to_rpc_err(SwapxError::DealNotFound(deal_id)))?;
        if !deal.verify_token(Party::Alice, &token) && !deal.verify_token(Party::Bob, &token) {
            return Err(to_rpc_err(SwapxError::InvalidToken));
        }

        let now = chrono::Utc::now().timestamp();
        self.state
            .engine
            .cancel_deal(&id, now)
            .await
            .map_err(to_rpc_err)?;
        Ok(true)
    }

    async fn list_deals(&self) -> RpcResult<Vec<RpcDealSummary>> {
        let mut deals = self.state.ledger.iter_all_deals().map_err(to_rpc_err)?;
        deals.sort_by_key(|d| std::cmp::Reverse(d.created_at));
        Ok(deals
            .into_iter()
            .map(|d| RpcDealSummary {
                deal_id: d.id.to_hex(),
                name: d.name,
                stage: d.stage.to_string(),
                created_at: d.created_at,
                expires_at: d.expires_at,
            })
            .collect())
    }

    async fn get_events(&self, deal_id: String, offset: u32, limit: u32) -> RpcResult<Vec<RpcEvent>> {
        let id = DealId::from_hex(&deal_id)
            .map_err(|e| rpc_err(-32602, format!("invalid deal id: {e}")))?;
        let limit = (limit as usize).min(MAX_EVENT_PAGE);
        Ok(self
            .state
            .ledger
            .events_for_deal(&id, offset as usize, limit)
            .map_err(to_rpc_err)?
            .into_iter()
            .map(|e| RpcEvent {
                time: e.time,
                message: e.message,
            })
            .collect())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
