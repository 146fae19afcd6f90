//! Metal CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for bare-metal allocation:
//! - `Server`, `ServerClass`: the inventory and its declarative groupings
//! - `ServerBinding`, `MetalMachine`: claims and the infrastructure requests behind them
//! - `Machine`, `Cluster`: read-only Cluster API owners

pub mod capi;
pub mod conditions;
pub mod conversion;
pub mod metal_machine;
pub mod references;
pub mod server;
pub mod server_binding;
pub mod server_class;

pub use capi::*;
pub use conditions::{Condition, ConditionSeverity, ConditionStatus};
pub use metal_machine::*;
pub use references::*;
pub use server::*;
pub use server_binding::*;
pub use server_class::*;
