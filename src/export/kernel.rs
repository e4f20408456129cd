//! Kernel NFS server backend driven by `/etc/exports`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use regex::Regex;

use super::{Exporter, IdAllocator};
use crate::command::CommandRunner;
use crate::configfile::{append_block, max_config_id, read_config, remove_block};
use crate::error::Result;

const DEFAULT_CONFIG: &str = "/etc/exports";
const ID_FLOOR: u32 = 1;

pub struct KernelExporter {
    config_path: PathBuf,
    root_squash: bool,
    runner: Arc<dyn CommandRunner>,
    /// Guards the id counter and all config-file rewrites. `export` and
    /// `unexport` run outside the lock; they invoke `exportfs`, which may
    /// block.
    ids: Mutex<IdAllocator>,
}

impl KernelExporter {
    pub fn new(root_squash: bool, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        Self::with_config_path(PathBuf::from(DEFAULT_CONFIG), root_squash, runner)
    }

    /// Use a non-default exports file. The id counter is seeded from the
    /// largest `fsid` already present so restarts never reissue a live id.
    pub fn with_config_path(
        config_path: PathBuf,
        root_squash: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let contents = read_config(&config_path)?;
        let fsid = Regex::new(r"fsid=(\d+)").expect("static regex");
        let ids = IdAllocator::new(max_config_id(&contents, &fsid), ID_FLOOR);
        Ok(Self {
            config_path,
            root_squash,
            runner,
            ids: Mutex::new(ids),
        })
    }

    fn format_block(&self, path: &str, id: u32) -> String {
        let squash = if self.root_squash {
            "root_squash"
        } else {
            "no_root_squash"
        };
        // fsid distinguishes separate exports of the same filesystem.
        format!("{path} *(rw,insecure,{squash},fsid={id},no_subtree_check)\n")
    }
}

impl Exporter for KernelExporter {
    fn add_export_block(&self, path: &str) -> Result<(String, u32)> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        let id = ids.next_id();
        let block = self.format_block(path, id);
        append_block(&self.config_path, &block)?;
        Ok((block, id))
    }

    fn export(&self, _path: &str) -> Result<()> {
        // Re-sync the kernel export table with the config file.
        self.runner.run("exportfs", &["-r"]).map(drop)
    }

    fn remove_export_block(&self, block: &str, id: u32) -> Result<()> {
        let _ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        remove_block(&self.config_path, block, id)
    }

    fn unexport(&self, path: &str) -> Result<()> {
        let target = format!("*:{path}");
        self.runner.run("exportfs", &["-u", &target]).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeRunner;
    use std::fs;
    use tempfile::TempDir;

    fn exporter(dir: &TempDir, root_squash: bool, runner: Arc<FakeRunner>) -> KernelExporter {
        KernelExporter::with_config_path(dir.path().join("exports"), root_squash, runner).unwrap()
    }

    #[test]
    fn first_block_gets_id_one() {
        let dir = TempDir::new().unwrap();
        let exporter = exporter(&dir, true, FakeRunner::new());

        let (block, id) = exporter.add_export_block("/export/pvc-a").unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            block,
            "/export/pvc-a *(rw,insecure,root_squash,fsid=1,no_subtree_check)\n"
        );
        assert_eq!(fs::read_to_string(dir.path().join("exports")).unwrap(), block);
    }

    #[test]
    fn counter_is_seeded_from_existing_fsids() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("exports"),
            "/export/old *(rw,insecure,root_squash,fsid=41,no_subtree_check)\n",
        )
        .unwrap();
        let exporter = exporter(&dir, true, FakeRunner::new());

        let (_, id) = exporter.add_export_block("/export/new").unwrap();
        assert_eq!(id, 42);
    }

    #[test]
    fn no_root_squash_changes_only_the_block_text() {
        let dir = TempDir::new().unwrap();
        let exporter = exporter(&dir, false, FakeRunner::new());

        let (block, _) = exporter.add_export_block("/export/pvc-a").unwrap();
        assert!(block.contains(",no_root_squash,"));
    }

    #[test]
    fn remove_strips_exactly_one_block() {
        let dir = TempDir::new().unwrap();
        let exporter = exporter(&dir, true, FakeRunner::new());

        let (block_a, id_a) = exporter.add_export_block("/export/pvc-a").unwrap();
        let (block_b, _) = exporter.add_export_block("/export/pvc-b").unwrap();

        exporter.remove_export_block(&block_a, id_a).unwrap();
        let contents = fs::read_to_string(dir.path().join("exports")).unwrap();
        assert!(!contents.contains("pvc-a"));
        assert!(contents.contains(&block_b));
    }

    #[test]
    fn remove_of_unknown_block_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let exporter = exporter(&dir, true, FakeRunner::new());
        exporter
            .remove_export_block("/export/ghost *(rw,fsid=9)\n", 9)
            .unwrap();
    }

    #[test]
    fn export_resyncs_the_kernel_table() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let exporter = exporter(&dir, true, runner.clone());

        exporter.export("/export/pvc-a").unwrap();
        assert_eq!(runner.calls_for("exportfs"), vec![vec!["-r".to_string()]]);
    }

    #[test]
    fn unexport_targets_the_path() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let exporter = exporter(&dir, true, runner.clone());

        exporter.unexport("/export/pvc-a").unwrap();
        assert_eq!(
            runner.calls_for("exportfs"),
            vec![vec!["-u".to_string(), "*:/export/pvc-a".to_string()]]
        );
    }
}
