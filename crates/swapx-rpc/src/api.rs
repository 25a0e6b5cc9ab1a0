use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{RpcCreateDeal, RpcDealCreated, RpcDealStatus, RpcDealSummary, RpcEvent, RpcFillDetails};

/// SwapX broker JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "swapx_" via `namespace = "swapx"`.
#[rpc(server, namespace = "swapx")]
pub trait SwapxApi {
    /// Create a deal between two trade legs. Returns the deal id and one
    /// bearer token per party; tokens gate `fillPartyDetails` and
    /// `cancelDeal`.
    #[method(name = "createDeal")]
    async fn create_deal(&self, request: RpcCreateDeal) -> RpcResult<RpcDealCreated>;

    /// Fill one party's payback/recipient addresses. Allowed once per party,
    /// only before collection starts.
    #[method(name = "fillPartyDetails")]
    async fn fill_party_details(&self, request: RpcFillDetails) -> RpcResult<bool>;

    /// Full deal status: stage, escrows, per-side totals and the event log.
    #[method(name = "status")]
    async fn status(&self, deal_id: String) -> RpcResult<RpcDealStatus>;

    /// Cancel a deal. Permitted only while the deal is CREATED and no
    /// deposit has been observed.
    #[method(name = "cancelDeal")]
    async fn cancel_deal(&self, deal_id: String, token: String) -> RpcResult<bool>;

    /// All deals, newest first.
    #[method(name = "listDeals")]
    async fn list_deals(&self) -> RpcResult<Vec<RpcDealSummary>>;

    /// Paged event log for a deal.
    #[method(name = "getEvents")]
    async fn get_events(&self, deal_id: String, offset: u32, limit: u32) -> RpcResult<Vec<RpcEvent>>;
}
