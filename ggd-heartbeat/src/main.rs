//! GGD Heartbeat - device agent entry point
//!
//! Parses the command line, sets up logging, wires discovery and the MQTT
//! connector into the heartbeat loop and maps Ctrl-C onto cancellation.

use anyhow::{Context, Result};
use clap::Parser;
use ggd_heartbeat::cli::Cli;
use ggd_heartbeat::{Discoverer, GreengrassDiscoveryClient, GroupConfig, HeartbeatLoop, MqttConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    info!("GGD heartbeat starting for device {}", cli.device_name);
    if let Some(frequency) = cli.frequency {
        warn!(
            "--frequency {} is not applied; heartbeats are sent after a random delay below 10s",
            frequency
        );
    }

    let settings = cli.settings();
    let credentials = cli.credentials();
    let config = GroupConfig::load(&cli.config_file, &cli.device_name)
        .await
        .with_context(|| format!("Failed to load group config {}", cli.config_file.display()))?;

    info!(
        "Discovery using CA: {} certificate: {} prv_key: {}",
        credentials.root_ca.display(),
        credentials.certificate.display(),
        credentials.private_key.display()
    );
    let provider = GreengrassDiscoveryClient::new(
        config.endpoint.clone(),
        &credentials,
        settings.discovery_timeout,
    )
    .await
    .context("Failed to set up discovery client")?;

    let agent_span = tracing::info_span!("ggd", device = %config.identity.name);
    let discoverer = Discoverer::new(provider, config.endpoint.clone(), &cli.group_ca_dir)
        .with_retry_count(settings.retry_count)
        .with_max_groups(settings.max_groups)
        .with_span(tracing::info_span!(parent: &agent_span, "discovery"));
    let connector = MqttConnector::new(credentials, &settings)
        .with_span(tracing::info_span!(parent: &agent_span, "channel"));

    let heartbeat_span = tracing::info_span!(
        parent: &agent_span,
        "heartbeat",
        thing_name = %config.identity.thing_name
    );
    let mut heartbeat = HeartbeatLoop::new(config.identity, discoverer, connector, settings)
        .with_span(heartbeat_span);

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, exiting heartbeat");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    // Failures are reported through the log only; the exit status stays 0.
    match heartbeat.run(cancel).await {
        Ok(summary) => info!("Heartbeat finished ({} published)", summary.published),
        Err(e) => error!("Heartbeat ended in {}: {}", heartbeat.state(), e),
    }

    Ok(())
}
