//! Gateway Agent - edge gateway agent
//!
//! Startup sequence:
//! - `.env` + config file + `GATEWAY_AGENT_*` overrides
//! - optional bootstrap from the provisioning service
//! - MQTT control channel and broker connections
//! - bridge loops, heartbeat sweep and the admin HTTP API

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gateway_agent::bootstrap::{bootstrap, BootstrapConfig};
use gateway_agent::transport::broker::{self, BrokerPublisher};
use gateway_agent::transport::mqtt::{self, MqttPublisher};
use gateway_agent::{bridge, http, AgentService, Config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let mut config = Config::load(Config::path_from_env())
        .await
        .context("Failed to load configuration")?;
    config.apply_env().context("Invalid environment override")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("gateway_agent={}", config.log.level))),
        )
        .init();

    info!("Gateway agent starting...");

    let bootstrap_cfg = BootstrapConfig::from_env().context("Invalid bootstrap settings")?;
    if let Some(fetched) = bootstrap(&bootstrap_cfg, config.clone())
        .await
        .context("Bootstrap failed")?
    {
        config = fetched;
    }
    config.validate().context("Invalid configuration")?;

    let client_id = format!("gateway-agent-{}", Uuid::new_v4());
    let (mqtt_client, eventloop) = mqtt::connect(&config.mqtt, &client_id).context("Invalid MQTT settings")?;
    let local = MqttPublisher::new(mqtt_client.clone(), &config.mqtt);
    let qos = local.qos();

    let nats = broker::connect(&config.server.nats_url)
        .await
        .context("Failed to connect to broker")?;
    info!("Connected to broker at {}", config.server.nats_url);

    let service = Arc::new(AgentService::new(
        config.clone(),
        Arc::new(local),
        Arc::new(BrokerPublisher::new(nats.clone())),
    ));

    service.spawn_sweeper();
    tokio::spawn(bridge::run_mqtt(service.clone(), mqtt_client, eventloop, qos));
    tokio::spawn(bridge::run_heartbeats(service.clone(), nats));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API on {addr}"))?;
    info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, http::build_router(service))
        .await
        .context("HTTP server failed")?;
    Ok(())
}
