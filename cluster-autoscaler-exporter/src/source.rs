//! Reading the autoscaler status ConfigMap.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::KubernetesConfig;

/// Location of the status document: one data key of one ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl ConfigMapRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
        }
    }
}

impl From<&KubernetesConfig> for ConfigMapRef {
    fn from(config: &KubernetesConfig) -> Self {
        Self::new(&config.namespace, &config.configmap, &config.data_key)
    }
}

impl fmt::Display for ConfigMapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.key)
    }
}

/// Errors returned when fetching the status document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The request did not complete within the timeout.
    #[error("request for {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    /// The ConfigMap does not exist.
    #[error("configmap {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// The ConfigMap exists but has no such data key.
    #[error("configmap {target} has no data key {key:?}")]
    MissingKey { target: String, key: String },

    /// Any other API or transport failure.
    #[error("kubernetes API error: {0}")]
    Connection(String),

    /// The client could not be constructed.
    #[error("failed to create kubernetes client: {0}")]
    Client(String),
}

/// Something that can produce the raw status document.
pub trait StatusSource: Send + Sync + 'static {
    /// Fetch the current value of `target`.
    fn fetch(
        &self,
        target: &ConfigMapRef,
    ) -> impl Future<Output = Result<String, SourceError>> + Send;
}

/// Fetch `target`, failing with [`SourceError::Timeout`] once `timeout` elapses.
pub async fn fetch_with_timeout<S: StatusSource>(
    source: &S,
    target: &ConfigMapRef,
    timeout: Duration,
) -> Result<String, SourceError> {
    match tokio::time::timeout(timeout, source.fetch(target)).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout {
            target: target.to_string(),
            after: timeout,
        }),
    }
}

/// [`StatusSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStatusSource {
    client: Client,
}

impl KubeStatusSource {
    /// Build a client from the configured kubeconfig, or from in-cluster
    /// credentials and the default kubeconfig when none is given.
    pub async fn connect(config: &KubernetesConfig) -> Result<Self, SourceError> {
        let options = KubeConfigOptions {
            context: config.context.clone(),
            ..Default::default()
        };

        let mut kube_config = match (&config.kubeconfig, &config.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    SourceError::Client(format!("reading {}: {}", path.display(), e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| SourceError::Client(e.to_string()))?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| SourceError::Client(e.to_string()))?,
            (None, None) => Config::infer()
                .await
                .map_err(|e| SourceError::Client(e.to_string()))?,
        };

        kube_config.connect_timeout = Some(config.request_timeout());
        kube_config.read_timeout = Some(config.request_timeout());

        info!(cluster_url = %kube_config.cluster_url, "Creating Kubernetes client");

        let client = Client::try_from(kube_config).map_err(|e| SourceError::Client(e.to_string()))?;

        Ok(Self::from_client(client))
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl StatusSource for KubeStatusSource {
    async fn fetch(&self, target: &ConfigMapRef) -> Result<String, SourceError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &target.namespace);

        let configmap = api
            .get_opt(&target.name)
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?
            .ok_or_else(|| SourceError::NotFound {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
            })?;

        let document = configmap
            .data
            .and_then(|mut data| data.remove(&target.key))
            .ok_or_else(|| SourceError::MissingKey {
                target: format!("{}/{}", target.namespace, target.name),
                key: target.key.clone(),
            })?;

        debug!(configmap = %target, bytes = document.len(), "Fetched status document");
        Ok(document)
    }
}
