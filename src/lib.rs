//! Dynamic NFS persistent-volume provisioner.
//!
//! When a storage claim selects this provisioner, [`NfsProvisioner::provision`]
//! carves a private directory out of the export root, publishes it as an NFS
//! export, fences it with an XFS project quota, and returns a
//! `PersistentVolume` that mounts the new share at a cluster-reachable
//! address. [`NfsProvisioner::delete`] unwinds all of it.
//!
//! The controller loop that watches claims and invokes these methods is an
//! external collaborator; this crate is the provisioning state machine only.

pub mod cluster;
pub mod command;
mod configfile;
pub mod error;
pub mod export;
pub mod identity;
pub mod provisioner;
pub mod quota;
pub mod server;

pub use cluster::{ClusterClient, KubeClusterClient};
pub use command::{CommandRunner, SystemCommandRunner};
pub use error::{Error, Result};
pub use export::{Exporter, GaneshaExporter, KernelExporter};
pub use provisioner::{NfsProvisioner, VolumeOptions};
pub use quota::{DummyQuotaer, Quotaer, XfsQuotaer};
pub use server::{PodEnv, ServerResolver};

#[cfg(test)]
pub(crate) mod test_util;
