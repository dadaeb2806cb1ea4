//! Process-wide configuration, loaded once at startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GuardianError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    pub period_secs: u64,
    pub page_size: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            period_secs: 10,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub enabled: bool,
    pub provider: String,
    /// Base URL of the chat-completions endpoint, e.g.
    /// `https://api.openai.com`. `/v1/chat/completions` is appended by the
    /// classifier itself.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout_secs: u64,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub inter_batch_delay_secs: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "generic-http".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            request_timeout_secs: 30,
            batch_size: 20,
            flush_interval_secs: 60,
            inter_batch_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_address: String,
    pub bind_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Root configuration object. Constructed once in `main` via [`GuardianConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    pub upstream: UpstreamSettings,
    pub poll: PollSettings,
    pub store_path: PathBuf,
    pub classifier: ClassifierSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl GuardianConfig {
    /// Layers, lowest to highest precedence: compiled-in defaults, an
    /// optional JSON file named by `GUARDIAN_CONFIG`, then `GUARDIAN_`
    /// prefixed environment variables (double-underscore separated for
    /// nesting, e.g. `GUARDIAN_UPSTREAM__URL`).
    pub fn load() -> Result<Self, GuardianError> {
        let defaults = serde_json::json!({
            "upstream": { "url": "", "username": "", "password": "" },
            "poll": { "period_secs": 10, "page_size": 100 },
            "store_path": "data/guardian.db",
            "classifier": {
                "enabled": true,
                "provider": "generic-http",
                "endpoint": "http://localhost:11434",
                "api_key": "",
                "model": "gpt-4o-mini",
                "request_timeout_secs": 30,
                "batch_size": 20,
                "flush_interval_secs": 60,
                "inter_batch_delay_secs": 60
            },
            "server": { "bind_address": "0.0.0.0", "bind_port": 8080 },
            "logging": { "level": "info", "format": "pretty" }
        });

        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults).map_err(|e| {
            GuardianError::ConfigInvalid(format!("invalid built-in defaults: {e}"))
        })?);

        if let Ok(path) = std::env::var("GUARDIAN_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GUARDIAN")
                .separator("__")
                .try_parsing(true),
        );

        let settled = builder
            .build()
            .map_err(|e| GuardianError::ConfigInvalid(e.to_string()))?;

        let cfg: GuardianConfig = settled
            .try_deserialize()
            .map_err(|e| GuardianError::ConfigInvalid(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), GuardianError> {
        if self.upstream.url.is_empty() {
            return Err(GuardianError::ConfigInvalid("upstream.url is required".into()));
        }
        if self.upstream.username.is_empty() || self.upstream.password.is_empty() {
            return Err(GuardianError::ConfigInvalid(
                "upstream.username and upstream.password are required".into(),
            ));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(GuardianError::ConfigInvalid("store_path is required".into()));
        }
        Ok(())
    }

    /// Configuration as exposed by `GET /api/settings`: secrets are reduced
    /// to a presence boolean, never serialized verbatim.
    pub fn to_redacted_json(&self) -> serde_json::Value {
        serde_json::json!({
            "upstream": {
                "url": self.upstream.url,
                "username": self.upstream.username,
                "password_set": !self.upstream.password.is_empty(),
            },
            "poll": self.poll,
            "store_path": self.store_path,
            "classifier": {
                "enabled": self.classifier.enabled,
                "provider": self.classifier.provider,
                "endpoint": self.classifier.endpoint,
                "api_key_set": !self.classifier.api_key.is_empty(),
                "model": self.classifier.model,
                "request_timeout_secs": self.classifier.request_timeout_secs,
                "batch_size": self.classifier.batch_size,
                "flush_interval_secs": self.classifier.flush_interval_secs,
                "inter_batch_delay_secs": self.classifier.inter_batch_delay_secs,
            },
            "server": self.server,
            "logging": self.logging,
        })
    }
}
