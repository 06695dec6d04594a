//! Server configuration from the environment

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Where daily quota counters live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaBackend {
    Memory,
    Postgres,
    Redis,
}

impl QuotaBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QuotaBackend::Memory),
            "postgres" => Ok(QuotaBackend::Postgres),
            "redis" => Ok(QuotaBackend::Redis),
            other => Err(ConfigError::Invalid {
                name: "QUOTA_BACKEND",
                reason: format!("expected memory, postgres or redis, got {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Absent means every store is in memory
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub quota_backend: QuotaBackend,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub plan_catalog_path: Option<String>,
    pub billing_intent_webhook_url: Option<String>,
    pub analysis_service_url: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = optional("DATABASE_URL");
        let redis_url = optional("REDIS_URL");

        let quota_backend = match optional("QUOTA_BACKEND") {
            Some(value) => QuotaBackend::parse(&value)?,
            None if redis_url.is_some() => QuotaBackend::Redis,
            None if database_url.is_some() => QuotaBackend::Postgres,
            None => QuotaBackend::Memory,
        };

        let jwt_expiry_hours = match optional("JWT_EXPIRY_HOURS") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "JWT_EXPIRY_HOURS",
                reason: format!("not a number: {}", value),
            })?,
            None => 24,
        };

        let config = Self {
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url,
            redis_url,
            quota_backend,
            jwt_secret: optional("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            jwt_expiry_hours,
            plan_catalog_path: optional("PLAN_CATALOG_PATH"),
            billing_intent_webhook_url: optional("BILLING_INTENT_WEBHOOK_URL"),
            analysis_service_url: optional("ANALYSIS_SERVICE_URL"),
            allowed_origins: optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: "must be at least 32 characters".to_string(),
            });
        }
        match self.quota_backend {
            QuotaBackend::Postgres if self.database_url.is_none() => {
                Err(ConfigError::Missing("DATABASE_URL"))
            }
            QuotaBackend::Redis if self.redis_url.is_none() => Err(ConfigError::Missing("REDIS_URL")),
            _ => Ok(()),
        }
    }

    /// Minimal in-memory configuration for tests
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: None,
            redis_url: None,
            quota_backend: QuotaBackend::Memory,
            jwt_secret: jwt_secret.to_string(),
            jwt_expiry_hours: 1,
            plan_catalog_path: None,
            billing_intent_webhook_url: None,
            analysis_service_url: None,
            allowed_origins: vec![],
        }
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
