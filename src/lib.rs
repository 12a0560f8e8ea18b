//! Reconciles pipeline parameter credentials left ambiguous by a platform migration.
//!
//! Flows are fetched per project and classified by the placeholder markers they carry;
//! credential records are grouped by the primary pipeline they belong to; each group
//! gets a repair plan that the executor may apply against the credential store.
#![forbid(unsafe_code)]

pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod execute;
pub mod flow;
pub mod graph;
pub mod http;
pub mod inventory;
pub mod memory;
pub mod model;
pub mod path_safety;
pub mod plan;
pub mod reconcile;
pub mod sender;
pub mod store;

pub use error::{RepairError, Result};
pub use flow::FlowDocument;
pub use plan::{RepairAction, plan_repairs};
pub use reconcile::{Disposition, Reconciler, RunReport};
