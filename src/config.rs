// =============================================================================
// AppConfig — environment-driven startup configuration
// =============================================================================
//
// Every tunable the orchestrator needs at process start lives here, read
// once from the environment in `AppConfig::from_env`. Unlike the tunables a
// running engine might hot-reload from disk, these are fixed for the life
// of the process: database coordinates, the upstream base URL, the shared
// encryption key, and the session/supervisor policy numbers.
// =============================================================================

use crate::error::ConfigError;

fn env_var(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError(format!("missing required env var {key}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_var_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError(format!("env var {key} is not a valid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Database connection settings, assembled into a `postgres://` URL.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Policy numbers for `PositionSupervisor`'s auto-close sweep.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorPolicy {
    pub max_holding_secs: i64,
    pub profit_target: rust_decimal::Decimal,
    pub loss_cutoff: rust_decimal::Decimal,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            max_holding_secs: 300,
            profit_target: dec!(100),
            loss_cutoff: dec!(-50),
        }
    }
}

/// Top-level process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub api_base_url: String,
    pub match_trade_broker_id: String,
    pub encryption_key: String,
    pub session_refresh_interval_minutes: u64,
    pub session_max_retry_attempts: u32,
    pub cors_origins: Vec<String>,
    pub log_level: String,
    pub supervisor_policy: SupervisorPolicy,
}

impl AppConfig {
    /// Reads every setting from the process environment. Fails fast with a
    /// `ConfigError` rather than starting with a partially-usable config —
    /// in particular a missing or malformed `ENCRYPTION_KEY` is fatal here,
    /// never silently downgraded to an unencrypted fallback later.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database = DatabaseConfig {
            host: env_var_or("DB_HOST", "localhost"),
            port: env_var_parsed("DB_PORT", 5432u16)?,
            name: env_var("DB_NAME")?,
            user: env_var("DB_USER")?,
            password: env_var("DB_PASSWORD")?,
        };

        let encryption_key = env_var("ENCRYPTION_KEY")?;
        crate::vault::validate_key_material(&encryption_key)
            .map_err(|e| ConfigError(format!("ENCRYPTION_KEY is invalid: {e}")))?;

        let cors_origins = env_var_or("CORS_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database,
            api_base_url: env_var("API_BASE_URL")?,
            match_trade_broker_id: env_var("MATCH_TRADE_BROKER_ID")?,
            encryption_key,
            session_refresh_interval_minutes: env_var_parsed(
                "SESSION_REFRESH_INTERVAL_MINUTES",
                10,
            )?,
            session_max_retry_attempts: env_var_parsed("SESSION_MAX_RETRY_ATTEMPTS", 3)?,
            cors_origins,
            log_level: env_var_or("LOG_LEVEL", "info"),
            supervisor_policy: SupervisorPolicy::default(),
        })
    }
}
