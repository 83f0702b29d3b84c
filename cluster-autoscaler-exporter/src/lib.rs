//! Prometheus exporter for cluster-autoscaler activity.
//!
//! On every scrape this crate reads the `cluster-autoscaler-status` ConfigMap,
//! extracts the last probe times of the overall, scale-up and scale-down
//! activities, and exposes them via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ Kubernetes API  │<────│    Collector    │<────│   HTTP Server   │
//! │   (ConfigMap)   │     │ (fetch/extract) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! cluster-autoscaler-exporter --web.listen-address 0.0.0.0:8080 --collector.request-timeout 10
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod args;
pub mod collector;
pub mod config;
pub mod extractor;
pub mod http;
pub mod source;

pub use args::ExporterArgs;
pub use collector::{ScrapeError, ScrapeOutcome, SharedCollector, StatusCollector};
pub use config::ExporterConfig;
pub use extractor::{Activity, ActivityTimestamps, ExtractError, ExtractMode, StatusExtractor};
pub use http::HttpServer;
pub use source::{ConfigMapRef, KubeStatusSource, SourceError, StatusSource};
