use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
    pub llm: LlmConfig,
    pub rca: RcaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Log and metric backend endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Loki server URL (LogQL)
    pub loki_url: String,
    /// Cortex server URL (PromQL)
    pub cortex_url: String,
    /// Loki query timeout in seconds (default: 30)
    pub loki_timeout_seconds: u64,
    /// Cortex query timeout in seconds (default: 30)
    pub cortex_timeout_seconds: u64,
}

/// LLM provider selection and per-provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider to use: "anthropic" or "ollama"
    pub provider: String,
    pub anthropic_api_key: String,
    pub anthropic_model: String,
    /// Anthropic API request timeout (default: 120)
    pub anthropic_timeout_seconds: u64,
    pub ollama_base_url: String,
    pub ollama_model: String,
    /// Ollama request timeout (local models are slower, default: 300)
    pub ollama_timeout_seconds: u64,
}

/// Correlation and agent-loop tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RcaConfig {
    /// Time window in seconds for correlating related alerts (default: 300)
    pub correlation_window_seconds: i64,
    /// Maximum iterations of the agent loop (default: 10)
    pub max_iterations: u32,
    /// Enable LLM-based semantic correlation (default: true)
    pub semantic_correlation_enabled: bool,
    /// Structural score considered a strong label match (default: 8).
    /// Recognized operator knob; the correlation engine arbitrates every
    /// surviving candidate semantically regardless of score.
    pub correlation_score_threshold: i64,
    /// Inline expert context appended to the agent system prompt
    pub expert_context: String,
    /// Path to a file with expert context (takes precedence over the inline value)
    pub expert_context_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "argus")]
#[command(version, about = "Argus - Automated Root Cause Analysis for Infrastructure Alerts")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// LLM provider to use (overrides config file)
    #[arg(long, value_name = "PROVIDER")]
    pub llm_provider: Option<String>,

    /// Logging level (overrides config file, e.g. "info,argus_rca=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (a `.env` file is honored if present)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(cli_args)
    }

    pub fn load_with_args(cli_args: CommandLineArgs) -> Result<Self, anyhow::Error> {
        // Load .env before reading environment overrides
        dotenvy::dotenv().ok();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables mirror the config keys: DATABASE_URL, LOKI_URL,
    /// CORTEX_URL, LLM_PROVIDER, ANTHROPIC_API_KEY, ANTHROPIC_MODEL,
    /// ANTHROPIC_TIMEOUT_SECONDS, OLLAMA_BASE_URL, OLLAMA_MODEL,
    /// OLLAMA_TIMEOUT_SECONDS, CORRELATION_WINDOW_SECONDS, RCA_MAX_ITERATIONS,
    /// SEMANTIC_CORRELATION_ENABLED, CORRELATION_SCORE_THRESHOLD,
    /// RCA_EXPERT_CONTEXT, RCA_EXPERT_CONTEXT_FILE, LOKI_TIMEOUT_SECONDS,
    /// CORTEX_TIMEOUT_SECONDS, LOG_LEVEL, HOST, PORT, DEBUG.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!("Invalid PORT '{}' ignored", port),
            }
        }
        if let Ok(debug) = std::env::var("DEBUG") {
            if let Ok(v) = debug.parse() {
                self.server.debug = v;
            }
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
            tracing::info!("Override database.url from env");
        }
        if let Ok(url) = std::env::var("LOKI_URL") {
            self.observability.loki_url = url;
        }
        if let Ok(url) = std::env::var("CORTEX_URL") {
            self.observability.cortex_url = url;
        }
        if let Ok(v) = std::env::var("LOKI_TIMEOUT_SECONDS") {
            Self::parse_into(&mut self.observability.loki_timeout_seconds, "LOKI_TIMEOUT_SECONDS", &v);
        }
        if let Ok(v) = std::env::var("CORTEX_TIMEOUT_SECONDS") {
            Self::parse_into(&mut self.observability.cortex_timeout_seconds, "CORTEX_TIMEOUT_SECONDS", &v);
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider;
            tracing::info!("Override llm.provider from env: {}", self.llm.provider);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = key;
        }
        if let Ok(model) = std::env::var("ANTHROPIC_MODEL") {
            self.llm.anthropic_model = model;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_TIMEOUT_SECONDS") {
            Self::parse_into(&mut self.llm.anthropic_timeout_seconds, "ANTHROPIC_TIMEOUT_SECONDS", &v);
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = url;
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            self.llm.ollama_model = model;
        }
        if let Ok(v) = std::env::var("OLLAMA_TIMEOUT_SECONDS") {
            Self::parse_into(&mut self.llm.ollama_timeout_seconds, "OLLAMA_TIMEOUT_SECONDS", &v);
        }
        if let Ok(v) = std::env::var("CORRELATION_WINDOW_SECONDS") {
            Self::parse_into(&mut self.rca.correlation_window_seconds, "CORRELATION_WINDOW_SECONDS", &v);
        }
        if let Ok(v) = std::env::var("RCA_MAX_ITERATIONS") {
            Self::parse_into(&mut self.rca.max_iterations, "RCA_MAX_ITERATIONS", &v);
        }
        if let Ok(v) = std::env::var("SEMANTIC_CORRELATION_ENABLED") {
            Self::parse_into(&mut self.rca.semantic_correlation_enabled, "SEMANTIC_CORRELATION_ENABLED", &v);
        }
        if let Ok(v) = std::env::var("CORRELATION_SCORE_THRESHOLD") {
            Self::parse_into(&mut self.rca.correlation_score_threshold, "CORRELATION_SCORE_THRESHOLD", &v);
        }
        if let Ok(ctx) = std::env::var("RCA_EXPERT_CONTEXT") {
            self.rca.expert_context = ctx;
        }
        if let Ok(path) = std::env::var("RCA_EXPERT_CONTEXT_FILE") {
            self.rca.expert_context_file = path;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }
    }

    fn parse_into<T: std::str::FromStr>(slot: &mut T, name: &str, value: &str) {
        match value.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("Invalid {} '{}' ignored", name, value),
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(url) = &args.database_url {
            self.database.url = url.clone();
            tracing::info!("Override database.url from CLI");
        }
        if let Some(provider) = &args.llm_provider {
            self.llm.provider = provider.clone();
            tracing::info!("Override llm.provider from CLI: {}", self.llm.provider);
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.rca.max_iterations == 0 {
            anyhow::bail!("rca.max_iterations must be > 0");
        }
        if self.rca.correlation_window_seconds <= 0 {
            anyhow::bail!("rca.correlation_window_seconds must be > 0");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8000, debug: false }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/argus.db?mode=rwc".to_string() }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            loki_url: "http://localhost:3100".to_string(),
            cortex_url: "http://localhost:9009".to_string(),
            loki_timeout_seconds: 30,
            cortex_timeout_seconds: 30,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            anthropic_api_key: String::new(),
            anthropic_model: "claude-sonnet-4-20250514".to_string(),
            anthropic_timeout_seconds: 120,
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            ollama_timeout_seconds: 300,
        }
    }
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            correlation_window_seconds: 300,
            max_iterations: 10,
            semantic_correlation_enabled: true,
            correlation_score_threshold: 8,
            expert_context: String::new(),
            expert_context_file: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,argus_rca=debug".to_string(), file: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.rca.correlation_window_seconds, 300);
        assert_eq!(config.rca.max_iterations, 10);
        assert!(config.rca.semantic_correlation_enabled);
        assert_eq!(config.rca.correlation_score_threshold, 8);
        assert_eq!(config.observability.loki_timeout_seconds, 30);
        assert_eq!(config.observability.cortex_timeout_seconds, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            port = 9100

            [rca]
            correlation_window_seconds = 120
            semantic_correlation_enabled = false
            "#,
        )
        .expect("valid config");
        assert_eq!(parsed.server.port, 9100);
        assert_eq!(parsed.rca.correlation_window_seconds, 120);
        assert!(!parsed.rca.semantic_correlation_enabled);
        // Untouched sections keep defaults
        assert_eq!(parsed.llm.provider, "anthropic");
    }

    #[test]
    fn zero_port_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
