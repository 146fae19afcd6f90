//! Metal Store
//!
//! Typed access to the resources the metal allocator reads and writes: servers,
//! server classes, bindings, MetalMachines and their Cluster API owners, plus the
//! workload cluster nodes that receive provider IDs.
//!
//! # Example
//!
//! ```no_run
//! use metal_store::{KubeStore, MetalStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeStore::new(client, None);
//!
//! // A server is claimed iff a binding with its name exists
//! match store.get_server_binding("4c4c4544-0047-3310-8030-b4c04f4d3732").await {
//!     Ok(binding) => println!("claimed by {}", binding.spec.metal_machine_ref.name),
//!     Err(e) if e.is_not_found() => println!("free"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod metal_trait;
pub mod workload;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeStore;
pub use error::StoreError;
pub use metal_trait::MetalStore;
pub use workload::{KubeWorkloadClient, WorkloadClusterClient};
#[cfg(feature = "test-util")]
pub use mock::{MockMetalStore, MockWorkloadClient};
