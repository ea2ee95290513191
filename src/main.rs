//! Streamline User Operator
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! streamline-user-operator
//!
//! # Watch one namespace with a custom log level
//! RUST_LOG=debug streamline-user-operator --namespace kafka
//! ```

use clap::Parser;
use kube::Client;
use std::sync::Arc;
use streamline_user_operator::broker::HttpBrokerAdmin;
use streamline_user_operator::{OperatorArgs, UserController};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = OperatorArgs::parse();
    let config = args.reconciler_config()?;
    let broker_config = args.broker_admin_config();

    info!("Starting Streamline User Operator");
    info!(
        "Watching namespace: {}",
        args.watch_namespace().unwrap_or("all")
    );
    info!(broker = %broker_config.base_url, "Using broker admin API");

    let broker = Arc::new(HttpBrokerAdmin::new(broker_config)?);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let controller = Arc::new(UserController::new(
        client,
        broker,
        config,
        args.watch_namespace().map(str::to_string),
    ));

    let user_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("User controller error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = user_handle => {
            if let Err(e) = result {
                error!("User controller task failed: {}", e);
            }
        }
    }

    info!("Streamline User Operator shutting down");
    Ok(())
}
