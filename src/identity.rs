//! Per-instance identity persisted next to the export root.
//!
//! Every provisioned volume is stamped with this identity so an instance
//! never deletes a volume another instance created.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::error::Result;

/// Name of the file where the provisioner stores its identity.
pub const IDENTITY_FILE: &str = "nfs-provisioner.identity";

/// Load this instance's identity from the export root, generating and
/// persisting a fresh UUID on first start. Any I/O failure here is a
/// deployment problem; callers treat it as fatal.
pub fn load_or_create(export_root: &Path) -> Result<String> {
    let path = export_root.join(IDENTITY_FILE);

    if path.exists() {
        let read = fs::read_to_string(&path)?;
        return Ok(read.trim().to_string());
    }

    let identity = Uuid::new_v4().to_string();
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(identity.as_bytes())?;
    file.sync_all()?;
    info!(path = %path.display(), "wrote new provisioner identity");

    Ok(identity)
}
