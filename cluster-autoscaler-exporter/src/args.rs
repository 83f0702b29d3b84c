//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ConfigError, ExporterConfig};

/// Prometheus exporter for cluster-autoscaler activity timestamps.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "cluster-autoscaler-exporter")]
#[command(about = "Export cluster-autoscaler last activity times as Prometheus metrics")]
#[command(version)]
pub struct ExporterArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on for web interface and telemetry (overrides config).
    #[arg(long = "web.listen-address")]
    pub listen_address: Option<String>,

    /// Path under which to expose metrics (overrides config).
    #[arg(long = "web.telemetry-path")]
    pub telemetry_path: Option<String>,

    /// Kubernetes API request timeout in seconds (overrides config).
    #[arg(long = "collector.request-timeout")]
    pub request_timeout: Option<u64>,

    /// Set the log level to debug.
    #[arg(long = "log.debug")]
    pub log_debug: bool,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ExporterArgs {
    /// Load the config file (or defaults) and apply command line overrides.
    pub fn load_config(&self) -> Result<ExporterConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ExporterConfig::load_from_file(path)?,
            None => ExporterConfig::default(),
        };

        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Override config values given on the command line.
    pub fn apply_to(&self, config: &mut ExporterConfig) {
        if let Some(listen) = &self.listen_address {
            config.web.listen = listen.clone();
        }
        if let Some(path) = &self.telemetry_path {
            config.web.path = path.clone();
        }
        if let Some(timeout) = self.request_timeout {
            config.kubernetes.request_timeout_secs = timeout;
        }
        if let Some(level) = &self.log_level {
            config.logging = config.logging.with_level(level.as_str());
        }
        if self.log_debug {
            config.logging = config.logging.with_level("debug");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_flags() {
        let args = ExporterArgs::try_parse_from(["cluster-autoscaler-exporter"]).unwrap();
        let config = args.load_config().unwrap();

        assert_eq!(config.web.listen, "0.0.0.0:8080");
        assert_eq!(config.web.path, "/metrics");
        assert_eq!(config.kubernetes.request_timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_dotted_flags() {
        let args = ExporterArgs::try_parse_from([
            "cluster-autoscaler-exporter",
            "--web.listen-address",
            "127.0.0.1:9100",
            "--web.telemetry-path=/ca/metrics",
            "--collector.request-timeout",
            "3",
            "--log.debug",
        ])
        .unwrap();

        let config = args.load_config().unwrap();

        assert_eq!(config.web.listen, "127.0.0.1:9100");
        assert_eq!(config.web.path, "/ca/metrics");
        assert_eq!(config.kubernetes.request_timeout_secs, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_log_debug_wins_over_log_level() {
        let args = ExporterArgs {
            log_level: Some("warn".to_string()),
            log_debug: true,
            ..Default::default()
        };

        let mut config = ExporterConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                kubernetes: {{ namespace: "autoscaler", request_timeout_secs: 30 }},
                web: {{ listen: "0.0.0.0:9000" }}
            }}"#
        )
        .unwrap();

        let args = ExporterArgs {
            config: Some(file.path().to_path_buf()),
            request_timeout: Some(5),
            ..Default::default()
        };

        let config = args.load_config().unwrap();

        assert_eq!(config.kubernetes.namespace, "autoscaler");
        assert_eq!(config.kubernetes.request_timeout_secs, 5);
        assert_eq!(config.web.listen, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = ExporterArgs {
            request_timeout: Some(0),
            ..Default::default()
        };

        assert!(matches!(
            args.load_config(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_version_flag() {
        let err = ExporterArgs::try_parse_from(["cluster-autoscaler-exporter", "--version"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
