//! XFS project-quota backend.
//!
//! Projects are recorded in the standard project tables (`/etc/projects`
//! maps id to path, `/etc/projid` maps name to id) and registered and
//! limited with `xfs_quota`. The export root must already sit on an XFS
//! filesystem mounted with project quotas; that is checked once at
//! construction, never at provision time.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::statfs::{XFS_SUPER_MAGIC, statfs};
use regex::Regex;
use tracing::warn;

use super::Quotaer;
use crate::command::CommandRunner;
use crate::configfile::{append_block, max_config_id, read_config, remove_block};
use crate::error::{Error, Result};
use crate::export::IdAllocator;

const DEFAULT_PROJECTS: &str = "/etc/projects";
const DEFAULT_PROJID: &str = "/etc/projid";
const ID_FLOOR: u32 = 1;

pub struct XfsQuotaer {
    export_root: PathBuf,
    projects_path: PathBuf,
    projid_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    /// Guards the id counter and both project files.
    ids: Mutex<IdAllocator>,
}

impl XfsQuotaer {
    pub fn new(export_root: &Path, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        check_project_quota_support(export_root)?;
        Self::with_project_files(
            export_root,
            PathBuf::from(DEFAULT_PROJECTS),
            PathBuf::from(DEFAULT_PROJID),
            runner,
        )
    }

    /// Use non-default project tables and skip the filesystem probe. The id
    /// counter is seeded from the largest id across both files.
    pub(crate) fn with_project_files(
        export_root: &Path,
        projects_path: PathBuf,
        projid_path: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let projects = read_config(&projects_path)?;
        let projid = read_config(&projid_path)?;
        let projects_re = Regex::new(r"(?m)^(\d+):").expect("static regex");
        let projid_re = Regex::new(r"(?m):(\d+)$").expect("static regex");
        let observed = max_config_id(&projects, &projects_re)
            .max(max_config_id(&projid, &projid_re));
        Ok(Self {
            export_root: export_root.to_path_buf(),
            projects_path,
            projid_path,
            runner,
            ids: Mutex::new(IdAllocator::new(observed, ID_FLOOR)),
        })
    }

    fn xfs_quota(&self, command: &str) -> Result<()> {
        let root = self.export_root.to_string_lossy();
        self.runner
            .run("xfs_quota", &["-x", "-c", command, &root])
            .map(drop)
    }
}

impl Quotaer for XfsQuotaer {
    fn add_project(&self, path: &str, _limit_bytes: i64) -> Result<(String, u32)> {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);

        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        let id = ids.next_id();
        let projects_line = format!("{id}:{path}\n");
        let projid_line = format!("{name}:{id}\n");

        append_block(&self.projects_path, &projects_line)?;
        if let Err(e) = append_block(&self.projid_path, &projid_line) {
            log_undo_failure(remove_block(&self.projects_path, &projects_line, id));
            return Err(e);
        }

        // Tie the directory tree to the project id.
        if let Err(e) = self.xfs_quota(&format!("project -s -p {path} {id}")) {
            log_undo_failure(remove_block(&self.projid_path, &projid_line, id));
            log_undo_failure(remove_block(&self.projects_path, &projects_line, id));
            return Err(e);
        }

        Ok((format!("{projects_line}{projid_line}"), id))
    }

    fn set_quota(&self, id: u32, _path: &str, limit_bytes: i64) -> Result<()> {
        self.xfs_quota(&format!("limit -p bhard={limit_bytes} {id}"))
    }

    fn remove_project(&self, block: &str, id: u32) -> Result<()> {
        let _ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = block.lines();
        match (lines.next(), lines.next()) {
            (Some(projects_line), Some(projid_line)) => {
                remove_block(&self.projects_path, &format!("{projects_line}\n"), id)?;
                remove_block(&self.projid_path, &format!("{projid_line}\n"), id)?;
                Ok(())
            }
            _ => {
                warn!(id, "project block is not two lines, nothing to remove");
                Ok(())
            }
        }
    }
}

fn log_undo_failure(result: Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "failed to undo partial project registration");
    }
}

/// Verify that `export_root` is backed by XFS mounted with project quotas.
fn check_project_quota_support(export_root: &Path) -> Result<()> {
    let unsupported = |reason: String| Error::XfsUnsupported {
        root: export_root.display().to_string(),
        reason,
    };

    let stat = statfs(export_root).map_err(|e| unsupported(format!("statfs: {e}")))?;
    if stat.filesystem_type() != XFS_SUPER_MAGIC {
        return Err(unsupported("not an XFS filesystem".to_string()));
    }

    let root = fs::canonicalize(export_root)?;
    let mounts = fs::read_to_string("/proc/self/mounts")?;
    let mount_options = mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let _fs_type = fields.next()?;
            let options = fields.next()?;
            root.starts_with(mount_point)
                .then(|| (mount_point.len(), options))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, options)| options)
        .ok_or_else(|| unsupported("no mount entry covers the export root".to_string()))?;

    if !mount_options
        .split(',')
        .any(|opt| opt == "prjquota" || opt == "pquota")
    {
        return Err(unsupported(
            "mounted without the prjquota/pquota option".to_string(),
        ));
    }

    Ok(())
}
