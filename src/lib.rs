//! Traceability ledger for agricultural products.
//!
//! Lifecycle stage events are validated per product by the [`registry`],
//! chained into proof-of-work blocks by [`chain`], evaluated against delivery
//! agreements by [`contracts`] and folded into farmer scores by
//! [`reputation`]. [`trace`] composes read-only views over all of them.
//!
//! Applications build a [`node::Node`] from a [`config::NodeConfig`] and
//! drive it through the cloneable [`node::NodeHandle`]. State is persisted
//! through the [`storage::LedgerStore`] seam and rebuilt on startup.

pub mod chain;
pub mod clock;
pub mod config;
pub mod contracts;
pub mod crypto;
pub mod errors;
pub mod node;
pub mod registry;
pub mod reputation;
pub mod storage;
pub mod trace;
pub mod types;

pub use errors::{ChainError, ChainResult};
pub use node::{Node, NodeHandle, StageReceipt};
