//! Error types for the provisioner.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Provisioner errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter: {0:?}")]
    UnknownParameter(String),

    #[error(
        "invalid value for parameter gid: {0}. valid values are: 'none' or a non-zero integer"
    )]
    InvalidGid(String),

    #[error("claim.Spec.Selector is not supported")]
    SelectorUnsupported,

    #[error("insufficient available space {available} bytes to satisfy claim for {requested} bytes")]
    InsufficientCapacity { available: i64, requested: i64 },

    #[error("export root {} does not exist", path.display())]
    ExportRootMissing { path: PathBuf },

    #[error("the path {} already exists", path.display())]
    PathAlreadyExists { path: PathBuf },

    #[error("{program} failed with {message}")]
    Command { program: String, message: String },

    #[error("cluster API error: {0}")]
    Cluster(String),

    #[error("service {service} is set but the namespace env isn't; no way to get the service cluster IP")]
    NamespaceUnset { service: String },

    #[error(
        "service {service} is not valid; check that it has one endpoint with this pod's IP {pod_ip} and ports 2049/TCP, 20048/TCP, 111/UDP, 111/TCP"
    )]
    ServiceInvalid { service: String, pod_ip: String },

    #[error("service {service} is valid but it doesn't have a cluster IP")]
    NoClusterIp { service: String },

    #[error("volume is owned by another provisioner instance: {owner}")]
    ForeignVolume { owner: String },

    #[error("volume is missing annotation {0}")]
    MissingAnnotation(&'static str),

    #[error("invalid volume object: {0}")]
    InvalidVolume(String),

    #[error("{root} is not usable for XFS project quotas: {reason}")]
    XfsUnsupported { root: String, reason: String },

    #[error("error adding export block for path {path}: {source}")]
    AddExportBlock { path: String, source: Box<Error> },

    #[error("error exporting export block {block}: {source}")]
    ExportBlock { block: String, source: Box<Error> },

    #[error("error adding project for path {path}: {source}")]
    AddProject { path: String, source: Box<Error> },

    #[error("error setting quota for path {path}: {source}")]
    SetQuota { path: String, source: Box<Error> },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when a delete was refused because the volume belongs to another
    /// provisioner instance. The controller collaborator treats this as
    /// "ignore, another replica owns it" rather than a failure.
    pub fn is_not_mine(&self) -> bool {
        matches!(self, Error::ForeignVolume { .. })
    }
}
