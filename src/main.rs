//! Restore Kubernetes Operator
//!
//! Watches Restore resources and drives them to completion, and fills
//! claims that name a Restore as their data source.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! restore-operator
//!
//! # Watch a single namespace with debug logging
//! RUST_LOG=debug restore-operator --namespace databases
//! ```

use clap::Parser;
use kube::Client;
use restore_operator::leader_election::{self, LeaderElector, LeaseSettings};
use restore_operator::{Args, RestoreController, RestoreSettings, VolumePopulatorController};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let settings = RestoreSettings::from(&args);

    info!("Starting Restore Kubernetes Operator");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );
    info!(
        operator_namespace = %settings.operator_namespace,
        tools_image = %settings.tools_image,
        "Restore settings loaded"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // acquire the lease before any controller starts
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns, LeaseSettings::default());
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let namespace = (!args.namespace.is_empty()).then(|| args.namespace.clone());
    let restore_controller = Arc::new(RestoreController::new(
        client.clone(),
        settings.clone(),
        namespace.clone(),
    ));
    let populator_controller = Arc::new(VolumePopulatorController::new(
        client.clone(),
        settings,
        namespace,
    ));

    let restore_handle = {
        let controller = Arc::clone(&restore_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Restore controller error: {}", e);
            }
        })
    };

    let populator_handle = {
        let controller = Arc::clone(&populator_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Volume populator controller error: {}", e);
            }
        })
    };

    let renewal = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match renewal {
            Some(e) => e.hold().await,
            None => std::future::pending::<()>().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = restore_handle => {
            if let Err(e) = result {
                error!("Restore controller task failed: {}", e);
            }
        }
        result = populator_handle => {
            if let Err(e) = result {
                error!("Volume populator controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // hand the lease to a standby replica right away
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Restore Operator shutting down");
    Ok(())
}
