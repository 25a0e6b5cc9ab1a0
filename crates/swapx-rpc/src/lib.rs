//! swapx-rpc — the broker's external JSON-RPC 2.0 surface.
//!
//! Upstream callers create deals, fill party details, poll status and (in
//! narrow circumstances) cancel. Bad input is rejected synchronously with a
//! domain error and no state change; everything that mutates a deal pings
//! the deal-tick driver so the state machine reacts without waiting a full
//! tick.

pub mod api;
pub mod server;
pub mod types;

pub use api::SwapxApiServer;
pub use server::{RpcServer, RpcServerState};
