// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Digi worker - runs the deployment job worker against Postgres.

use std::sync::Arc;
use tracing::{info, warn};

use digi_clients::{
    CaddyAdminClient, CloudflareClient, DnsConfig, DnsProvider, DockerConfig, DockerEngineClient,
    HypervisorConfig, ProxmoxClient, ProxyConfig, RailpackBuilder,
};
use digi_orchestrator::cache::{Cache, MemoryCache, RedisCache};
use digi_orchestrator::config::Config;
use digi_orchestrator::migrations;
use digi_orchestrator::persistence::PostgresPersistence;
use digi_orchestrator::pubsub::{MemoryPubSub, PubSub, RedisPubSub};
use digi_orchestrator::runtime::OrchestratorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "digi_orchestrator=info,digi_clients=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        edge_proxy = %config.edge_proxy_url,
        redis = config.redis_url.is_some(),
        dns = config.dns_api_token.is_some(),
        platform = %config.platform_name,
        "Starting digi worker"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database");

    migrations::run(&pool).await?;
    info!("Database migrations applied");

    let (cache, pubsub): (Arc<dyn Cache>, Arc<dyn PubSub>) = match &config.redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url).await?;
            let pubsub = RedisPubSub::connect(url).await?;
            info!("Using Redis cache and pub/sub");
            (Arc::new(cache), Arc::new(pubsub))
        }
        None => {
            info!("No Redis configured; using in-process cache and pub/sub");
            (Arc::new(MemoryCache::new()), Arc::new(MemoryPubSub::new()))
        }
    };

    let mut builder = OrchestratorRuntime::builder()
        .persistence(Arc::new(PostgresPersistence::new(pool)))
        .hypervisor(Arc::new(ProxmoxClient::new(HypervisorConfig::default())?))
        .proxy(Arc::new(CaddyAdminClient::new(ProxyConfig::default())?))
        .engine(Arc::new(DockerEngineClient::new(
            DockerConfig::default().with_api_port(config.docker_api_port),
        )?))
        .image_builder(Arc::new(RailpackBuilder::default()))
        .cache(cache)
        .pubsub(pubsub)
        .settings(config.orchestrator_settings())
        .worker_config(config.worker_config());

    if let Some(token) = &config.dns_api_token {
        let mut dns_config = DnsConfig::default().with_api_token(token);
        if let Some(url) = &config.dns_api_url {
            dns_config = dns_config.with_api_url(url);
        }
        let dns: Arc<dyn DnsProvider> = Arc::new(CloudflareClient::new(dns_config)?);
        builder = builder.dns(dns);
    } else {
        warn!("No DNS API token configured; DNS records will not be managed");
    }

    let runtime = builder.build()?.start().await?;
    info!("Digi worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Digi worker shut down");

    Ok(())
}
