//! AdServe: ad selection and budget enforcement service.
//!
//! Main entry point that wires the stores, cache tier and analytics mirror
//! into the serving engine and starts the HTTP server.

use adserve_analytics::AnalyticsLogger;
use adserve_api::ApiServer;
use adserve_cache::{CacheStore, LocalCache, RedisCache};
use adserve_core::config::AppConfig;
use adserve_core::{DeliverySink, NoOpSink};
use adserve_engine::{EngineParts, EngineSettings, ServingEngine};
use adserve_store::{MemoryStore, PgStore};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_LOG_FILTER: &str = "adserve=info,adserve_engine=info,adserve_api=info,adserve_store=info,adserve_cache=info,adserve_analytics=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = "adserve")]
#[command(about = "Ad selection and budget enforcement service")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "ADSERVE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "ADSERVE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "ADSERVE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Use the in-memory store even when a database URL is configured
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// JSON catalog to seed the in-memory store with
    #[arg(long, env = "ADSERVE__DATABASE__SEED_PATH")]
    seed: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("AdServe starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if cli.in_memory {
        config.database.url.clear();
    }
    if let Some(seed) = cli.seed {
        config.database.seed_path = Some(seed);
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        in_memory = config.uses_in_memory_store(),
        redis = config.redis.enabled,
        clickhouse = config.clickhouse.enabled,
        "Configuration loaded"
    );

    let parts = match open_store(&config).await? {
        Store::Memory(store) => EngineParts::from_store(store),
        Store::Postgres(store) => EngineParts::from_store(store),
    };
    let parts = parts
        .with_cache(open_cache(&config).await)
        .with_sink(open_sink(&config).await);

    let engine = Arc::new(ServingEngine::new(parts, EngineSettings::from_config(&config)));
    let api_server = ApiServer::new(config.clone(), engine);

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    info!("AdServe is ready to serve traffic");

    // Blocks until shutdown
    api_server.start_http().await?;

    Ok(())
}

enum Store {
    Memory(Arc<MemoryStore>),
    Postgres(Arc<PgStore>),
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Store> {
    if config.uses_in_memory_store() {
        let store = match &config.database.seed_path {
            Some(path) => MemoryStore::load_seed_file(path)?,
            None => {
                warn!("In-memory store without a seed catalog, every placement will 404");
                MemoryStore::new()
            }
        };
        info!("Using in-memory store");
        return Ok(Store::Memory(Arc::new(store)));
    }

    let store = PgStore::connect(&config.database).await?;
    store.ensure_schema().await?;
    info!("Connected to PostgreSQL");
    Ok(Store::Postgres(Arc::new(store)))
}

/// Redis when enabled and reachable; the process-local cache when Redis is
/// disabled; no cache tier when Redis is enabled but unreachable.
async fn open_cache(config: &AppConfig) -> Option<Arc<dyn CacheStore>> {
    if !config.redis.enabled {
        let local = Arc::new(LocalCache::new());
        let for_maintenance = local.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = for_maintenance.evict_expired();
                if evicted > 0 {
                    info!(evicted = evicted, "Evicted expired daily counters");
                }
            }
        });
        info!("Redis disabled, using process-local cache tier");
        return Some(local);
    }

    match RedisCache::new(&config.redis).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(e) => {
            error!(
                error = %e,
                fallback = "durable_only",
                "Failed to connect to Redis, daily budgets will not be enforced"
            );
            None
        }
    }
}

async fn open_sink(config: &AppConfig) -> Arc<dyn DeliverySink> {
    if !config.clickhouse.enabled {
        return Arc::new(NoOpSink);
    }
    match AnalyticsLogger::new(&config.clickhouse, config.node_id.clone()).await {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            error!(error = %e, "Failed to connect to ClickHouse, analytics disabled");
            Arc::new(NoOpSink)
        }
    }
}
