use serde::{Deserialize, Serialize};

/// Main configuration structure for the switchyard daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Socket transport configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Event router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Completion orchestrator configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Conversation lock configuration
    #[serde(default)]
    pub locks: LocksConfig,

    /// Injection router and chain breaker configuration
    #[serde(default)]
    pub injection: InjectionConfig,

    /// Correlation tracer configuration
    #[serde(default)]
    pub tracer: TracerConfig,

    /// Maintenance daemon configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Completion provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Socket transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Path of the Unix domain socket
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Maximum bytes accepted on a single request line
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_socket_path() -> String {
    ".switchyard/switchyard.sock".to_string()
}

const fn default_max_line_bytes() -> usize {
    1024 * 1024
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Event router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RouterConfig {
    /// Upper bound on a single handler invocation
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Capacity of the subscriber broadcast channel
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

const fn default_handler_timeout_ms() -> u64 {
    5_000
}

const fn default_broadcast_capacity() -> usize {
    1024
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Completion orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Deadline applied when a request does not carry one
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Upper bound for request-supplied deadlines
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// How long terminal requests stay queryable
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,

    /// Waiting requests allowed per session
    #[serde(default = "default_max_queue_per_session")]
    pub max_queue_per_session: usize,
}

const fn default_request_timeout_ms() -> u64 {
    300_000
}

const fn default_max_timeout_ms() -> u64 {
    1_800_000
}

const fn default_terminal_retention_secs() -> u64 {
    600
}

const fn default_max_queue_per_session() -> usize {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            terminal_retention_secs: default_terminal_retention_secs(),
            max_queue_per_session: default_max_queue_per_session(),
        }
    }
}

/// Conversation lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LocksConfig {
    /// Lock lifetime without renewal
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// How long `old -> new` conversation rotations are remembered
    #[serde(default = "default_rotation_retention_secs")]
    pub rotation_retention_secs: u64,
}

const fn default_lock_ttl_ms() -> u64 {
    600_000
}

const fn default_rotation_retention_secs() -> u64 {
    3_600
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            rotation_retention_secs: default_rotation_retention_secs(),
        }
    }
}

/// Injection router and chain breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InjectionConfig {
    /// Enable automatic injection of tagged results
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deepest chain allowed before the breaker trips
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,

    /// Injections allowed per chain within `window_secs`
    #[serde(default = "default_max_injections_per_window")]
    pub max_injections_per_window: u32,

    /// Sliding window length for the rate check
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How long `next`-mode entries are buffered before flushing
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_max_chain_depth() -> u32 {
    5
}

const fn default_max_injections_per_window() -> u32 {
    20
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_coalesce_window_ms() -> u64 {
    250
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chain_depth: default_max_chain_depth(),
            max_injections_per_window: default_max_injections_per_window(),
            window_secs: default_window_secs(),
            coalesce_window_ms: default_coalesce_window_ms(),
        }
    }
}

/// Correlation tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TracerConfig {
    /// Age after which trace nodes are pruned
    #[serde(default = "default_trace_retention_secs")]
    pub retention_secs: u64,

    /// Serialized size above which payloads are truncated
    #[serde(default = "default_max_data_bytes")]
    pub max_data_bytes: usize,

    /// Additional key patterns (regex) to redact
    #[serde(default)]
    pub redact_keys: Vec<String>,
}

const fn default_trace_retention_secs() -> u64 {
    3_600
}

const fn default_max_data_bytes() -> usize {
    8 * 1024
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_trace_retention_secs(),
            max_data_bytes: default_max_data_bytes(),
            redact_keys: Vec::new(),
        }
    }
}

/// Maintenance daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MaintenanceConfig {
    /// Seconds between sweeps
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
}

const fn default_maintenance_interval_secs() -> u64 {
    30
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval_secs(),
        }
    }
}

/// Completion provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderConfig {
    /// Provider kind: mock or claude_cli
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    /// Path to claude CLI executable
    #[serde(default = "default_claude_path")]
    pub claude_path: String,

    /// Model passed to the provider when a request names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Working directory for provider processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Extra command-line flags
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_provider_kind() -> String {
    "claude_cli".to_string()
}

fn default_claude_path() -> String {
    "claude".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            claude_path: default_claude_path(),
            model: None,
            working_dir: None,
            extra_args: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
