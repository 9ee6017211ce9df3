use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `ADSERVE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Base URL used when building click-through links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command budget; a slower cache is treated as unreachable.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Empty means the in-memory store is used.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// JSON catalog loaded into the in-memory store at startup.
    #[serde(default)]
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Relative weights of the ranking signals, out of 100.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_ctr_weight")]
    pub ctr_weight: f64,
    #[serde(default = "default_headroom_weight")]
    pub headroom_weight: f64,
    #[serde(default = "default_targeting_weight")]
    pub targeting_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Floor for the daily counter expiry so writes just before UTC midnight
    /// don't create keys with near-zero TTLs.
    #[serde(default = "default_daily_counter_min_ttl_secs")]
    pub daily_counter_min_ttl_secs: u64,
}

// Default functions
fn default_node_id() -> String {
    "adserve-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_redis_enabled() -> bool {
    true
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_op_timeout_ms() -> u64 {
    50
}
fn default_max_connections() -> u32 {
    32
}
fn default_acquire_timeout_ms() -> u64 {
    3000
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "adserve".to_string()
}
fn default_batch_size() -> usize {
    5000
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_ctr_weight() -> f64 {
    50.0
}
fn default_headroom_weight() -> f64 {
    20.0
}
fn default_targeting_weight() -> f64 {
    30.0
}
fn default_daily_counter_min_ttl_secs() -> u64 {
    60
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            urls: default_redis_urls(),
            connect_timeout_ms: default_connect_timeout_ms(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            seed_path: None,
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ctr_weight: default_ctr_weight(),
            headroom_weight: default_headroom_weight(),
            targeting_weight: default_targeting_weight(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_counter_min_ttl_secs: default_daily_counter_min_ttl_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            metrics: MetricsConfig::default(),
            scoring: ScoringConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file and environment variables.
    /// Environment variables win over the file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("ADSERVE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("redis.urls"),
            )
            .build()?;
        config.try_deserialize()
    }

    pub fn uses_in_memory_store(&self) -> bool {
        self.database.url.trim().is_empty()
    }
}
