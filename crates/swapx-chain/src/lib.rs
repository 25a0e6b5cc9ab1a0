//! swapx-chain — the chain adapter capability.
//!
//! The orchestration core never speaks a wire protocol. Everything a chain
//! can do for the broker is behind [`adapter::ChainAdapter`]; implementations
//! are selected by chain id from an [`registry::AdapterRegistry`] built at
//! startup. Two implementations ship here:
//! - [`rpc::RpcChainAdapter`] — JSON-RPC 2.0 client against a chain gateway
//! - [`mock::MockChain`] — deterministic in-memory chain for tests

pub mod adapter;
pub mod hd;
pub mod mock;
pub mod registry;
pub mod rpc;

pub use adapter::{
    AdapterDeposit, BrokerSplit, ChainAdapter, DepositPage, EscrowAccountRef, ExistingTransfer,
    FeeBudget, NativeQuote, SendOptions,
};
pub use hd::EscrowDeriver;
pub use registry::AdapterRegistry;
