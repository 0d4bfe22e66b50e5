//! Configuration Loader
//!
//! Environment-aware loading with the `config` crate. Sources are layered in
//! increasing precedence:
//!
//! 1. compiled defaults
//! 2. `{config_dir}/coordinator.toml`
//! 3. `{config_dir}/coordinator.{environment}.toml`
//! 4. `TASKER_RPC__SECTION__KEY` environment variables
//! 5. the deployment's legacy variables (`RABBITMQ_URL`, queue names, AI timeout)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::{
    mask_url_credentials, CoordinatorConfig, ReplyConfig, CRAWL_DESTINATION, INFER_DESTINATION,
};

const ENV_PREFIX: &str = "TASKER_RPC";

/// Loaded, validated configuration plus the context it was loaded in
#[derive(Debug)]
pub struct ConfigManager {
    config: CoordinatorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_variables(config_dir, environment, None)
    }

    /// Load with an explicit variable map standing in for the process
    /// environment; `None` reads the real environment
    pub fn load_with_variables(
        config_dir: Option<PathBuf>,
        environment: &str,
        variables: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading coordinator configuration"
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment, &variables)?;
        let lookup = |key: &str| match &variables {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        };
        Self::apply_legacy_overrides(&mut config, lookup)?;

        config.validate()?;

        let sanitized = Self::sanitize_config_for_logging(&config);
        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&sanitized)
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %environment,
            broker_url = %mask_url_credentials(&config.broker.url),
            destinations = config.destinations.len(),
            "⚙️ CONFIG: Coordinator configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Get the current environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Get the configuration directory
    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Sanitized JSON form of the configuration, safe to print
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Detect current environment from environment variables
    pub fn detect_environment() -> String {
        std::env::var("TASKER_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        variables: &Option<HashMap<String, String>>,
    ) -> ConfigResult<CoordinatorConfig> {
        let defaults = Config::try_from(&CoordinatorConfig::default())?;
        let base_file = config_directory.join("coordinator.toml");
        let env_file = config_directory.join(format!("coordinator.{environment}.toml"));

        let mut env_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);
        if let Some(vars) = variables {
            env_source = env_source.source(Some(vars.clone()));
        }

        Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file).format(FileFormat::Toml).required(false))
            .add_source(File::from(env_file).format(FileFormat::Toml).required(false))
            .add_source(env_source)
            .build()?
            .try_deserialize()
            .map_err(ConfigurationError::deserialization_error)
    }

    /// Apply the bare `RABBITMQ_URL`-style variables older deployments set
    fn apply_legacy_overrides<F>(config: &mut CoordinatorConfig, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("RABBITMQ_URL") {
            config.broker.url = url;
        }

        if let Some(crawl) = config.destinations.get_mut(CRAWL_DESTINATION) {
            if let Some(queue) = lookup("RABBITMQ_CRAWLING_REQUEST_QUEUE") {
                crawl.request_queue = queue;
            }
            if let Some(queue) = lookup("RABBITMQ_CRAWLING_RESPONSE_QUEUE") {
                crawl.reply = ReplyConfig::SharedQueue { queue };
            }
        }

        if let Some(infer) = config.destinations.get_mut(INFER_DESTINATION) {
            if let Some(queue) = lookup("AI_QUEUE_NAME") {
                infer.request_queue = queue;
            }
            if let Some(raw) = lookup("AI_SERVICE_TIMEOUT") {
                let seconds = raw.trim().parse::<u64>().map_err(|e| {
                    ConfigurationError::environment_override("AI_SERVICE_TIMEOUT", e.to_string())
                })?;
                infer.default_timeout_seconds = Some(seconds);
            }
        }

        Ok(())
    }

    /// Sanitize configuration for safe logging by masking sensitive fields
    fn sanitize_config_for_logging(config: &CoordinatorConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        if let Some(url) = config_json.pointer_mut("/broker/url") {
            if let Some(raw) = url.as_str() {
                *url = serde_json::Value::String(mask_url_credentials(raw));
            }
        }
        let sensitive_patterns = ["password", "secret", "token", "credential"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    if sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern))
                    {
                        *val = serde_json::Value::String("[MASKED]".to_string());
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}
