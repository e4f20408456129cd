//! Shared fixtures for provisioner tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServiceSpec,
};
use tempfile::TempDir;

use crate::cluster::ClusterClient;
use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::export::KernelExporter;
use crate::provisioner::{NfsProvisioner, VolumeOptions};
use crate::quota::{DummyQuotaer, XfsQuotaer};
use crate::server::PodEnv;

/// Records every invocation and fails chosen occurrences on demand.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    fail_on: Mutex<HashMap<String, Vec<usize>>>,
    outputs: Mutex<HashMap<String, String>>,
    seen: Mutex<HashMap<String, usize>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the `occurrence`-th (1-based) invocation of `program`.
    pub fn fail_occurrence(&self, program: &str, occurrence: usize) {
        self.fail_on
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push(occurrence);
    }

    /// Canned stdout for every invocation of `program`.
    pub fn set_output(&self, program: &str, stdout: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(program.to_string(), stdout.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// The argument vectors of every invocation of `program`, in order.
    pub fn calls_for(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        self.calls.lock().unwrap().push((
            program.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
        ));

        let occurrence = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(program.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let injected = self
            .fail_on
            .lock()
            .unwrap()
            .get(program)
            .is_some_and(|o| o.contains(&occurrence));
        if injected {
            return Err(Error::Command {
                program: program.to_string(),
                message: "injected failure".to_string(),
            });
        }

        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(program)
            .cloned()
            .unwrap_or_default())
    }
}

/// Serves canned Service/Endpoints objects.
#[derive(Default)]
pub struct FakeCluster {
    service: Mutex<Option<Service>>,
    endpoints: Mutex<Option<Endpoints>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_service(&self, service: Service) {
        *self.service.lock().unwrap() = Some(service);
    }

    pub fn set_endpoints(&self, endpoints: Endpoints) {
        *self.endpoints.lock().unwrap() = Some(endpoints);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Service> {
        self.service
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Cluster(format!("service {name} not found")))
    }

    async fn get_endpoints(&self, _namespace: &str, name: &str) -> Result<Endpoints> {
        self.endpoints
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Cluster(format!("endpoints {name} not found")))
    }
}

/// A service with the given cluster IP (pass `"None"` for headless).
pub fn valid_service(cluster_ip: &str) -> Service {
    Service {
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Endpoints with one subset routing the full NFS port set to `ip`.
pub fn valid_endpoints(ip: &str) -> Endpoints {
    let port = |number: i32, protocol: &str| EndpointPort {
        port: number,
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };
    Endpoints {
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: ip.to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![
                port(2049, "TCP"),
                port(20048, "TCP"),
                port(111, "UDP"),
                port(111, "TCP"),
            ]),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Isolated export root and config files for one provisioner under test.
pub struct TestFixture {
    pub root: TempDir,
    pub exports_path: PathBuf,
    pub projects_path: PathBuf,
    pub projid_path: PathBuf,
    pub runner: Arc<FakeRunner>,
    pub cluster: Arc<FakeCluster>,
    _etc: TempDir,
}

impl TestFixture {
    pub fn new() -> Self {
        let root = TempDir::new().expect("create export root");
        let etc = TempDir::new().expect("create config dir");
        Self {
            exports_path: etc.path().join("exports"),
            projects_path: etc.path().join("projects"),
            projid_path: etc.path().join("projid"),
            root,
            runner: FakeRunner::new(),
            cluster: FakeCluster::new(),
            _etc: etc,
        }
    }

    pub fn pod_env() -> PodEnv {
        PodEnv {
            pod_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        }
    }

    fn kernel_exporter(&self) -> KernelExporter {
        KernelExporter::with_config_path(self.exports_path.clone(), true, self.runner.clone())
            .expect("construct kernel exporter")
    }

    /// Kernel exporter + dummy quotaer, pod-IP topology.
    pub fn provisioner(&self) -> NfsProvisioner {
        NfsProvisioner::with_parts(
            self.root.path(),
            self.cluster.clone(),
            Box::new(self.kernel_exporter()),
            Box::new(DummyQuotaer),
            self.runner.clone(),
            Self::pod_env(),
        )
        .expect("construct provisioner")
    }

    /// Kernel exporter + XFS quotaer writing to this fixture's project
    /// tables.
    pub fn provisioner_with_xfs(&self) -> NfsProvisioner {
        let quotaer = XfsQuotaer::with_project_files(
            self.root.path(),
            self.projects_path.clone(),
            self.projid_path.clone(),
            self.runner.clone(),
        )
        .expect("construct xfs quotaer");
        NfsProvisioner::with_parts(
            self.root.path(),
            self.cluster.clone(),
            Box::new(self.kernel_exporter()),
            Box::new(quotaer),
            self.runner.clone(),
            Self::pod_env(),
        )
        .expect("construct provisioner")
    }

    pub fn options(pv_name: &str, requested_bytes: i64) -> VolumeOptions {
        VolumeOptions {
            pv_name: pv_name.to_string(),
            requested_bytes,
            access_modes: vec!["ReadWriteMany".to_string()],
            selector: None,
            reclaim_policy: "Delete".to_string(),
            parameters: HashMap::new(),
        }
    }

    pub fn volume_path(&self, pv_name: &str) -> PathBuf {
        self.root.path().join(pv_name)
    }

    pub fn exports_contents(&self) -> String {
        std::fs::read_to_string(&self.exports_path).unwrap_or_default()
    }
}
