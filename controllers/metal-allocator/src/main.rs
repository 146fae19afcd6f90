//! Metal Allocator
//!
//! Cluster API infrastructure controller for bare metal:
//! - MetalMachine: claims a server, directly or from a ServerClass pool
//! - ServerBinding: the claim itself, one per server, created atomically
//! - Server: recreates bindings missing for an existing claim
//! - ServerClass: materializes the servers qualifying for each class
//!
//! Claims are made by creating a `ServerBinding` named after the server, so the API
//! server's create-uniqueness arbitrates between competing allocators.

mod backoff;
mod config;
mod controller;
mod error;
mod index;
mod metrics;
mod patch;
mod qualification;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::config::AllocatorConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configure rustls crypto provider (ring) before any TLS client is built
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting Metal Allocator");

    let config = AllocatorConfig::from_env()?;
    config.log();

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
