//! Server-address resolution for provisioned volumes.
//!
//! A volume is only useful if other pods can reach its export, so the
//! address written into the volume's NFS source depends on how this pod is
//! deployed: fronted by a service, pinned to a node with hostPorts, or
//! addressed directly by pod IP.

use std::collections::HashSet;
use std::env;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Endpoints;
use tracing::info;

use crate::cluster::ClusterClient;
use crate::command::CommandRunner;
use crate::error::{Error, Result};

pub const POD_IP_ENV: &str = "POD_IP";
pub const SERVICE_ENV: &str = "SERVICE_NAME";
pub const NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const NODE_ENV: &str = "NODE_NAME";

/// Ports a service fronting this pod must expose: nfsd, mountd, and rpcbind
/// over both transports.
const REQUIRED_PORTS: [(i32, &str); 4] =
    [(2049, "TCP"), (20048, "TCP"), (111, "UDP"), (111, "TCP")];

/// Deployment topology inputs, captured from the pod environment.
#[derive(Debug, Clone, Default)]
pub struct PodEnv {
    pub pod_ip: Option<String>,
    pub service_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub node_name: Option<String>,
}

impl PodEnv {
    pub fn from_env() -> Self {
        fn non_empty(key: &str) -> Option<String> {
            env::var(key).ok().filter(|v| !v.is_empty())
        }
        Self {
            pod_ip: non_empty(POD_IP_ENV),
            service_name: non_empty(SERVICE_ENV),
            pod_namespace: non_empty(NAMESPACE_ENV),
            node_name: non_empty(NODE_ENV),
        }
    }
}

pub struct ServerResolver {
    cluster: Arc<dyn ClusterClient>,
    runner: Arc<dyn CommandRunner>,
}

impl ServerResolver {
    pub fn new(cluster: Arc<dyn ClusterClient>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cluster, runner }
    }

    /// Resolve the address to publish as the NFS server of a new volume.
    /// The result is recomputed on every call, never cached.
    pub async fn resolve(&self, env: &PodEnv) -> Result<String> {
        let Some(service) = env.service_name.as_deref() else {
            if let Some(node) = env.node_name.as_deref() {
                info!(node, "service env unset, using node name as the NFS server (hostPort topology)");
                return Ok(node.to_string());
            }
            let fallback = self.local_ip(env)?;
            info!(server = %fallback, "service and node envs unset, using the pod IP as the NFS server");
            return Ok(fallback);
        };

        // From here on failures surface rather than falling back: a named
        // service means the deployment expects a persistent address, and
        // provisioning volumes with a throwaway one would be worse than
        // refusing.
        let Some(namespace) = env.pod_namespace.as_deref() else {
            return Err(Error::NamespaceUnset {
                service: service.to_string(),
            });
        };

        let pod_ip = self.local_ip(env)?;
        let svc = self.cluster.get_service(namespace, service).await?;
        let endpoints = self.cluster.get_endpoints(namespace, service).await?;

        if !service_routes_to(&endpoints, &pod_ip) {
            return Err(Error::ServiceInvalid {
                service: service.to_string(),
                pod_ip,
            });
        }

        match svc.spec.and_then(|s| s.cluster_ip) {
            Some(ip) if !ip.is_empty() && ip != "None" => Ok(ip),
            _ => Err(Error::NoClusterIp {
                service: service.to_string(),
            }),
        }
    }

    /// This pod's own IP, from the environment or `hostname -i`.
    fn local_ip(&self, env: &PodEnv) -> Result<String> {
        if let Some(ip) = env.pod_ip.as_deref() {
            return Ok(ip.to_string());
        }
        let out = self.runner.run("hostname", &["-i"])?;
        Ok(out.trim().to_string())
    }
}

/// A service fronts this pod iff some endpoints subset has exactly one
/// address, that address is the pod's IP, and its port set is exactly the
/// required NFS ports.
fn service_routes_to(endpoints: &Endpoints, pod_ip: &str) -> bool {
    let required: HashSet<(i32, &str)> = REQUIRED_PORTS.into_iter().collect();
    for subset in endpoints.subsets.as_deref().unwrap_or_default() {
        let addresses = subset.addresses.as_deref().unwrap_or_default();
        if addresses.len() != 1 || addresses[0].ip != pod_ip {
            continue;
        }
        let actual: HashSet<(i32, &str)> = subset
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| (p.port, p.protocol.as_deref().unwrap_or("TCP")))
            .collect();
        if actual == required {
            return true;
        }
    }
    false
}
