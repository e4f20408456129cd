//! Orchestrator API access.
//!
//! Server resolution needs to read Services and Endpoints; the narrow
//! [`ClusterClient`] trait keeps that dependency behind a seam so tests can
//! serve canned objects.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{Client, api::Api};

use crate::error::{Error, Result};

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints>;
}

/// Production client backed by the `kube` crate.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Auto-discover cluster configuration: in-cluster service account,
    /// `KUBECONFIG`, or `~/.kube/config`.
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Cluster(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        services
            .get(name)
            .await
            .map_err(|e| Error::Cluster(e.to_string()))
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        endpoints
            .get(name)
            .await
            .map_err(|e| Error::Cluster(e.to_string()))
    }
}
