//! Skiperator operator - reconciles Applications, SKIPJobs and Routings

mod cli;
mod controller_runner;

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use skiperator_common::crd::{Application, Routing, SkipJob};
use skiperator_common::telemetry::init_logging;
use skiperator_common::ServerVersion;

use cli::Cli;
use controller_runner::{
    build_application_controller, build_routing_controller, build_skipjob_controller,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [Application::crd(), SkipJob::crd(), Routing::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_logging(cli.log_format.into())?;

    let client = Client::try_default().await?;
    let server_version = match cli.server_version {
        Some(version) => version,
        None => discover_server_version(&client).await?,
    };
    let config = Arc::new(cli.operator_config(server_version));
    tracing::info!(
        %server_version,
        gateway_namespace = %config.gateway_namespace,
        internal_domains = ?config.internal_domains,
        "starting skiperator"
    );

    let application = build_application_controller(client.clone(), config.clone());
    let skipjob = build_skipjob_controller(client.clone(), config.clone());
    let routing = build_routing_controller(client, config);

    tokio::select! {
        _ = application => {
            tracing::info!("Application controller completed");
        }
        _ = skipjob => {
            tracing::info!("SKIPJob controller completed");
        }
        _ = routing => {
            tracing::info!("Routing controller completed");
        }
    }
    Ok(())
}

async fn discover_server_version(client: &Client) -> anyhow::Result<ServerVersion> {
    let info = client.apiserver_version().await?;
    ServerVersion::parse(&info.major, &info.minor).ok_or_else(|| {
        anyhow::anyhow!(
            "unrecognised API server version {}.{}",
            info.major,
            info.minor
        )
    })
}
