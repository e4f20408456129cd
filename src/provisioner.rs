//! The provisioning state machine.
//!
//! Each provision touches three independent resources: a directory on the
//! backing filesystem, an export entry in the NFS server config, and a
//! project quota. Any of them may fail, so every successful step pushes an
//! undo closure; a failure unwinds the stack in reverse so nothing leaks.
//! Delete runs the same steps backwards, best-effort.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{NFSVolumeSource, PersistentVolume, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use nix::sys::statvfs::statvfs;
use tracing::{info, warn};

use crate::cluster::ClusterClient;
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::error::{Error, Result};
use crate::export::{Exporter, GaneshaExporter, KernelExporter};
use crate::identity;
use crate::quota::{DummyQuotaer, Quotaer, XfsQuotaer};
use crate::server::{PodEnv, ServerResolver};

/// Value of the created-by annotation.
pub const CREATED_BY: &str = "nfs-dynamic-provisioner";

pub const ANN_CREATED_BY: &str = "kubernetes.io/createdby";
/// The exact block appended to the exporter config, needed for deletion.
pub const ANN_EXPORT_BLOCK: &str = "EXPORT_block";
pub const ANN_EXPORT_ID: &str = "Export_Id";
/// The exact lines appended to the project tables, needed for deletion.
pub const ANN_PROJECT_BLOCK: &str = "Project_block";
pub const ANN_PROJECT_ID: &str = "Project_Id";
/// Identity of the instance that provisioned the volume.
pub const ANN_PROVISIONER_ID: &str = "Provisioner_Id";
/// Supplemental-gid annotation understood by the orchestrator.
pub const ANN_VOLUME_GID: &str = "pv.beta.kubernetes.io/gid";

/// What the controller collaborator hands us for one claim.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub pv_name: String,
    pub requested_bytes: i64,
    pub access_modes: Vec<String>,
    pub selector: Option<LabelSelector>,
    pub reclaim_policy: String,
    pub parameters: HashMap<String, String>,
}

enum Gid {
    None,
    Group(u64),
}

struct CreatedVolume {
    server: String,
    path: String,
    sup_group: Option<u64>,
    export_block: String,
    export_id: u32,
    project_block: String,
    project_id: u32,
}

/// Undo closures accumulated during a provision. Unwound in reverse on
/// failure; dropped untouched on success.
struct Rollback<'a> {
    steps: Vec<(&'static str, Box<dyn FnOnce() -> Result<()> + 'a>)>,
}

impl<'a> Rollback<'a> {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn push(&mut self, what: &'static str, step: impl FnOnce() -> Result<()> + 'a) {
        self.steps.push((what, Box::new(step)));
    }

    /// Run the accumulated steps in reverse. Failures are logged, never
    /// returned; the error that triggered the unwind is the one the caller
    /// reports.
    fn unwind(self) {
        for (what, step) in self.steps.into_iter().rev() {
            if let Err(e) = step() {
                warn!(step = what, error = %e, "rollback step failed");
            }
        }
    }

    /// Discard the undo steps after a fully successful provision.
    fn commit(self) {}
}

pub struct NfsProvisioner {
    export_root: PathBuf,
    exporter: Box<dyn Exporter>,
    quotaer: Box<dyn Quotaer>,
    resolver: ServerResolver,
    runner: Arc<dyn CommandRunner>,
    env: PodEnv,
    /// Stable identity persisted in the export root; stamped onto every
    /// volume we provision.
    identity: String,
}

impl NfsProvisioner {
    /// Build a provisioner with the chosen exporter and quotaer variants.
    /// Construction failures are deployment bugs; callers treat them as
    /// fatal.
    pub fn new(
        export_root: impl Into<PathBuf>,
        cluster: Arc<dyn ClusterClient>,
        use_ganesha: bool,
        ganesha_config: impl Into<PathBuf>,
        root_squash: bool,
        enable_xfs_quota: bool,
    ) -> Result<Self> {
        let export_root = export_root.into();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);

        let exporter: Box<dyn Exporter> = if use_ganesha {
            Box::new(GaneshaExporter::new(
                ganesha_config.into(),
                root_squash,
                Arc::clone(&runner),
            )?)
        } else {
            Box::new(KernelExporter::new(root_squash, Arc::clone(&runner))?)
        };

        let quotaer: Box<dyn Quotaer> = if enable_xfs_quota {
            Box::new(XfsQuotaer::new(&export_root, Arc::clone(&runner))?)
        } else {
            Box::new(DummyQuotaer)
        };

        Self::with_parts(
            export_root,
            cluster,
            exporter,
            quotaer,
            runner,
            PodEnv::from_env(),
        )
    }

    /// Construction from pre-built parts; the seam tests use.
    pub fn with_parts(
        export_root: impl Into<PathBuf>,
        cluster: Arc<dyn ClusterClient>,
        exporter: Box<dyn Exporter>,
        quotaer: Box<dyn Quotaer>,
        runner: Arc<dyn CommandRunner>,
        env: PodEnv,
    ) -> Result<Self> {
        let export_root = export_root.into();
        if !export_root.is_dir() {
            return Err(Error::ExportRootMissing { path: export_root });
        }
        let identity = identity::load_or_create(&export_root)?;
        Ok(Self {
            resolver: ServerResolver::new(cluster, Arc::clone(&runner)),
            export_root,
            exporter,
            quotaer,
            runner,
            env,
            identity,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Provision the storage asset for a claim and return the volume object
    /// that mounts it, annotated with everything delete needs later.
    pub async fn provision(&self, options: &VolumeOptions) -> Result<PersistentVolume> {
        let created = self.create_volume(options).await?;

        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_CREATED_BY.to_string(), CREATED_BY.to_string());
        annotations.insert(ANN_EXPORT_BLOCK.to_string(), created.export_block);
        annotations.insert(ANN_EXPORT_ID.to_string(), created.export_id.to_string());
        annotations.insert(ANN_PROJECT_BLOCK.to_string(), created.project_block);
        annotations.insert(ANN_PROJECT_ID.to_string(), created.project_id.to_string());
        annotations.insert(ANN_PROVISIONER_ID.to_string(), self.identity.clone());
        if let Some(gid) = created.sup_group {
            annotations.insert(ANN_VOLUME_GID.to_string(), gid.to_string());
        }

        let mut capacity = BTreeMap::new();
        capacity.insert(
            "storage".to_string(),
            Quantity(options.requested_bytes.to_string()),
        );

        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name.clone()),
                labels: Some(BTreeMap::new()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy.clone()),
                access_modes: Some(options.access_modes.clone()),
                capacity: Some(capacity),
                nfs: Some(NFSVolumeSource {
                    server: created.server,
                    path: created.path,
                    read_only: Some(false),
                }),
                ..Default::default()
            }),
            status: None,
        };

        info!(pv = %options.pv_name, "provisioned volume");
        Ok(pv)
    }

    /// Create the storage asset: directory, export, quota, in that order so
    /// rollback can proceed in strict reverse.
    async fn create_volume(&self, options: &VolumeOptions) -> Result<CreatedVolume> {
        let gid = self.validate_options(options)?;

        let server = self.resolver.resolve(&self.env).await?;

        let path = self.export_root.join(&options.pv_name);
        let path_str = path.to_string_lossy().into_owned();

        self.create_directory(&path, &gid)?;

        let mut undo = Rollback::new();
        undo.push("remove volume directory", || {
            fs::remove_dir_all(&path).map_err(Error::from)
        });

        let (export_block, export_id) = match self.exporter.add_export_block(&path_str) {
            Ok(added) => added,
            Err(e) => {
                undo.unwind();
                return Err(Error::AddExportBlock {
                    path: path_str,
                    source: Box::new(e),
                });
            }
        };
        {
            let block = export_block.clone();
            undo.push("remove export block", move || {
                self.exporter.remove_export_block(&block, export_id)
            });
        }

        if let Err(e) = self.exporter.export(&path_str) {
            undo.unwind();
            return Err(Error::ExportBlock {
                block: export_block,
                source: Box::new(e),
            });
        }
        undo.push("unexport", || self.exporter.unexport(&path_str));

        let (project_block, project_id) =
            match self.quotaer.add_project(&path_str, options.requested_bytes) {
                Ok(added) => added,
                Err(e) => {
                    undo.unwind();
                    return Err(Error::AddProject {
                        path: path_str,
                        source: Box::new(e),
                    });
                }
            };
        {
            let block = project_block.clone();
            undo.push("remove project", move || {
                self.quotaer.remove_project(&block, project_id)
            });
        }

        if let Err(e) = self
            .quotaer
            .set_quota(project_id, &path_str, options.requested_bytes)
        {
            undo.unwind();
            return Err(Error::SetQuota {
                path: path_str,
                source: Box::new(e),
            });
        }

        undo.commit();
        Ok(CreatedVolume {
            server,
            path: path_str,
            sup_group: match gid {
                Gid::None => None,
                Gid::Group(g) => Some(g),
            },
            export_block,
            export_id,
            project_block,
            project_id,
        })
    }

    fn validate_options(&self, options: &VolumeOptions) -> Result<Gid> {
        let mut gid = Gid::None;
        for (key, value) in &options.parameters {
            match key.to_lowercase().as_str() {
                "gid" => {
                    if value.eq_ignore_ascii_case("none") {
                        gid = Gid::None;
                    } else {
                        match value.parse::<u64>() {
                            Ok(group) if group != 0 => gid = Gid::Group(group),
                            _ => return Err(Error::InvalidGid(value.clone())),
                        }
                    }
                }
                _ => return Err(Error::UnknownParameter(key.clone())),
            }
        }

        if options.selector.is_some() {
            return Err(Error::SelectorUnsupported);
        }

        let stat = statvfs(&self.export_root).map_err(|e| Error::Io(e.into()))?;
        let available = (stat.fragment_size() * stat.blocks_available()) as i64;
        if options.requested_bytes > available {
            return Err(Error::InsufficientCapacity {
                available,
                requested: options.requested_bytes,
            });
        }

        Ok(gid)
    }

    /// Create the volume directory with permissions and ownership derived
    /// from the gid parameter.
    fn create_directory(&self, path: &Path, gid: &Gid) -> Result<()> {
        if path.exists() {
            return Err(Error::PathAlreadyExists {
                path: path.to_path_buf(),
            });
        }

        // With a gid the mode drops to group-only; execute is still needed
        // so the kubelet can stat the directory during unmount.
        let perm: u32 = match gid {
            Gid::None => 0o777,
            Gid::Group(_) => 0o071,
        };
        fs::DirBuilder::new().mode(perm).create(path)?;

        let path_arg = path.to_string_lossy();
        let mode_arg = format!("{perm:o}");
        // The mkdir mode is filtered through the umask; chmod isn't.
        if let Err(e) = self.runner.run("chmod", &[&mode_arg, &path_arg]) {
            remove_dir_logged(path);
            return Err(e);
        }

        if let Gid::Group(group) = gid {
            let group_arg = group.to_string();
            if let Err(e) = self.runner.run("chgrp", &[&group_arg, &path_arg]) {
                remove_dir_logged(path);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Tear down everything provision built for this volume. Refuses
    /// volumes owned by another instance; otherwise every step is attempted
    /// and the first failure is reported after the rest have run, because
    /// the collaborator retries and partial cleanup beats none.
    pub async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let annotations = volume.metadata.annotations.as_ref();
        let ann = |key: &'static str| -> Result<&str> {
            annotations
                .and_then(|a| a.get(key))
                .map(String::as_str)
                .ok_or(Error::MissingAnnotation(key))
        };

        let owner = ann(ANN_PROVISIONER_ID)?;
        if owner != self.identity {
            return Err(Error::ForeignVolume {
                owner: owner.to_string(),
            });
        }

        let export_block = ann(ANN_EXPORT_BLOCK)?;
        let export_id = parse_id(ann(ANN_EXPORT_ID)?, ANN_EXPORT_ID)?;
        let project_block = ann(ANN_PROJECT_BLOCK)?;
        let project_id = parse_id(ann(ANN_PROJECT_ID)?, ANN_PROJECT_ID)?;

        let name = volume
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidVolume("volume has no name".to_string()))?;
        let path = self.export_root.join(name);
        let path_str = path.to_string_lossy().into_owned();

        let mut first_err: Option<Error> = None;
        let mut record = |what: &'static str, result: Result<()>| {
            if let Err(e) = result {
                warn!(step = what, error = %e, "delete step failed, continuing");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        record("unexport", self.exporter.unexport(&path_str));
        record(
            "remove export block",
            self.exporter.remove_export_block(export_block, export_id),
        );
        record(
            "remove project",
            self.quotaer.remove_project(project_block, project_id),
        );
        record(
            "remove volume directory",
            match fs::remove_dir_all(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::from(e)),
                _ => Ok(()),
            },
        );

        match first_err {
            None => {
                info!(pv = name, "deleted volume");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}

fn parse_id(value: &str, key: &'static str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::InvalidVolume(format!("annotation {key} is not a valid id: {value}")))
}

fn remove_dir_logged(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "failed to remove volume directory");
    }
}
