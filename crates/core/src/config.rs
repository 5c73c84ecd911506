use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_CONTROLLER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Connection settings for the external automation engine (n8n).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    /// Public base for webhook URLs handed back to the dashboard.
    #[serde(default = "default_engine_url")]
    pub webhook_base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Serve from the in-process engine instead of `base_url`.
    #[serde(default)]
    pub in_memory: bool,
    #[serde(default = "default_engine_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_status_history_limit")]
    pub status_history_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum pending records claimed per campaign per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum recipient sends in flight across all campaigns.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

// Default functions
fn default_node_id() -> String {
    "controller-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_engine_url() -> String {
    "http://localhost:5678".to_string()
}
fn default_engine_timeout_ms() -> u64 {
    10_000
}
fn default_status_history_limit() -> usize {
    20
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    16
}
fn default_page_size() -> usize {
    20
}
fn default_max_page_size() -> usize {
    100
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
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

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            webhook_base_url: default_engine_url(),
            api_key: None,
            in_memory: false,
            timeout_ms: default_engine_timeout_ms(),
            status_history_limit: default_status_history_limit(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_ms: default_tick_interval_ms(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CAMPAIGN_CONTROLLER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
