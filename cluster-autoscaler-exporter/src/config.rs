//! Configuration for the cluster-autoscaler exporter.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use caexporter_common::{LoggingConfig, load_config, parse_config};

use crate::extractor::ExtractMode;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] caexporter_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Where the autoscaler status lives in the cluster.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Status document parsing settings.
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kubernetes API and ConfigMap location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Namespace holding the status ConfigMap (default: "kube-system").
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name of the status ConfigMap (default: "cluster-autoscaler-status").
    #[serde(default = "default_configmap")]
    pub configmap: String,

    /// Data key holding the status document (default: "status").
    #[serde(default = "default_data_key")]
    pub data_key: String,

    /// Kubernetes API request timeout in seconds (default: 10).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Explicit kubeconfig file. In-cluster credentials or the default
    /// kubeconfig are used when unset.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one.
    #[serde(default)]
    pub context: Option<String>,
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

fn default_configmap() -> String {
    "cluster-autoscaler-status".to_string()
}

fn default_data_key() -> String {
    "status".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            configmap: default_configmap(),
            data_key: default_data_key(),
            request_timeout_secs: default_request_timeout(),
            kubeconfig: None,
            context: None,
        }
    }
}

impl KubernetesConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// Status extraction configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Parsing mode: "auto", "structured" or "legacy".
    #[serde(default)]
    pub mode: ExtractMode,
}

/// Paths served by the HTTP server besides the metrics endpoint.
const RESERVED_PATHS: [&str; 3] = ["/", "/health", "/ready"];

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kubernetes.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }

        for (field, value) in [
            ("namespace", &self.kubernetes.namespace),
            ("configmap", &self.kubernetes.configmap),
            ("data_key", &self.kubernetes.data_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "kubernetes.{} must not be empty",
                    field
                )));
            }
        }

        // Validate listen address format
        if self.web.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.web.listen
            )));
        }

        // Validate path starts with /
        if !self.web.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if RESERVED_PATHS.contains(&self.web.path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is reserved",
                self.web.path
            )));
        }

        // Route captures would turn the path into a pattern
        if self.web.path.contains([':', '*']) {
            return Err(ConfigError::Validation(format!(
                "Metrics path must not contain ':' or '*': {}",
                self.web.path
            )));
        }

        Ok(())
    }
}
