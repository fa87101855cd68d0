use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_env_or, parse_env, Environment};
use service_core::error::AppError;
use std::time::Duration;

/// Upper bound for `WOPI_TOKEN_TTL_SECONDS` (30 days).
pub const MAX_TOKEN_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;
/// Upper bound for `WOPI_TOKEN_EXPIRY_GRACE_SECONDS` (1 day).
pub const MAX_EXPIRY_GRACE_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct WopiConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub token_store: TokenStoreConfig,
    pub token: TokenConfig,
    pub storage: StorageConfig,
    pub retry: StorageRetryConfig,
    pub discovery: DiscoveryConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenStoreConfig {
    pub backend: TokenStoreBackend,
    pub redis_url: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreBackend {
    Redis,
    /// Process-local store. Tokens are not shared between instances, so this
    /// backend is refused in production.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub ttl_seconds: u64,
    /// Extra lifetime of the stored record past `expires_at`, so a token that
    /// just lapsed is reported as expired instead of unknown.
    pub expiry_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: String,
    pub max_file_size: u64,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageRetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Where this service reaches the editor host (may be a private address).
    pub editor_url: String,
    /// Origin browsers use for the editor; relative action URLs resolve against it.
    pub public_editor_url: String,
    /// Origin the editor host uses to call back into this service.
    pub wopi_base_url: String,
    pub cache_ttl_seconds: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub require_signatures: bool,
    pub signing_client_id: String,
    pub signing_secret: Secret<String>,
}

impl WopiConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common_config = core_config::Config::load()?;

        let environment = Environment::current()?;
        let is_prod = environment.is_prod();

        let editor_url = get_env("EDITOR_URL", Some("http://localhost:9980"), is_prod)?;
        let public_editor_url = get_env_or("EDITOR_PUBLIC_URL", &editor_url);

        let config = WopiConfig {
            common: common_config,
            environment,
            log_level: get_env_or("LOG_LEVEL", "info"),
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok(),
            token_store: TokenStoreConfig {
                backend: get_env("TOKEN_STORE_BACKEND", Some("redis"), false)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
                redis_url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            token: TokenConfig {
                ttl_seconds: parse_env("WOPI_TOKEN_TTL_SECONDS", "86400")?,
                expiry_grace_seconds: parse_env("WOPI_TOKEN_EXPIRY_GRACE_SECONDS", "300")?,
            },
            storage: StorageConfig {
                root: get_env("STORAGE_ROOT", Some("storage"), is_prod)?,
                max_file_size: parse_env("STORAGE_MAX_FILE_SIZE", "524288000")?,
                chunk_size: parse_env("STORAGE_CHUNK_SIZE", "65536")?,
            },
            retry: StorageRetryConfig {
                max_retries: parse_env("STORAGE_RETRY_MAX", "1")?,
                initial_backoff_ms: parse_env("STORAGE_RETRY_BACKOFF_MS", "100")?,
            },
            discovery: DiscoveryConfig {
                editor_url,
                public_editor_url,
                wopi_base_url: get_env("WOPI_BASE_URL", Some("http://localhost:8080"), is_prod)?,
                cache_ttl_seconds: parse_env("DISCOVERY_CACHE_TTL_SECONDS", "300")?,
                request_timeout_seconds: parse_env("DISCOVERY_TIMEOUT_SECONDS", "10")?,
            },
            security: SecurityConfig {
                require_signatures: parse_env("REQUIRE_SIGNATURES", if is_prod { "true" } else { "false" })?,
                signing_client_id: get_env_or("SIGNING_CLIENT_ID", "backend"),
                signing_secret: Secret::new(get_env(
                    "SIGNING_SECRET",
                    Some("dev-signing-secret"),
                    is_prod,
                )?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.environment.is_prod() && self.token_store.backend == TokenStoreBackend::Memory {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_STORE_BACKEND=memory is not allowed in production"
            )));
        }
        if self.token.ttl_seconds == 0 || self.token.ttl_seconds > MAX_TOKEN_TTL_SECONDS {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "WOPI_TOKEN_TTL_SECONDS must be between 1 and {}",
                MAX_TOKEN_TTL_SECONDS
            )));
        }
        if self.token.expiry_grace_seconds > MAX_EXPIRY_GRACE_SECONDS {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "WOPI_TOKEN_EXPIRY_GRACE_SECONDS must be at most {}",
                MAX_EXPIRY_GRACE_SECONDS
            )));
        }
        if self.storage.chunk_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORAGE_CHUNK_SIZE must be positive"
            )));
        }
        for (key, value) in [
            ("EDITOR_URL", &self.discovery.editor_url),
            ("EDITOR_PUBLIC_URL", &self.discovery.public_editor_url),
            ("WOPI_BASE_URL", &self.discovery.wopi_base_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("{} is not a valid URL: {}", key, e))
            })?;
        }
        Ok(())
    }

    pub fn retry_config(&self) -> service_core::retry::RetryConfig {
        service_core::retry::RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            ..Default::default()
        }
    }
}

impl std::str::FromStr for TokenStoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(TokenStoreBackend::Redis),
            "memory" => Ok(TokenStoreBackend::Memory),
            _ => Err(format!("Invalid token store backend: {}", s)),
        }
    }
}
