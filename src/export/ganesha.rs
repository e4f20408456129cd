//! NFS-Ganesha backend with a structured config file.
//!
//! Blocks are committed to the running server over its D-Bus export
//! manager interface rather than by reloading a table, so the server picks
//! up a single EXPORT without disturbing the others.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::warn;

use super::{Exporter, IdAllocator};
use crate::command::CommandRunner;
use crate::configfile::{append_block, max_config_id, read_config, remove_block};
use crate::error::Result;

const ID_FLOOR: u32 = 1;

const DBUS_DEST: &str = "--dest=org.ganesha.nfsd";
const DBUS_OBJECT: &str = "/org/ganesha/nfsd/ExportMgr";

pub struct GaneshaExporter {
    config_path: PathBuf,
    root_squash: bool,
    runner: Arc<dyn CommandRunner>,
    ids: Mutex<IdAllocator>,
}

impl GaneshaExporter {
    /// The id counter is seeded from the largest `Export_Id` already in the
    /// config so restarts never reissue a live id.
    pub fn new(
        config_path: PathBuf,
        root_squash: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let contents = read_config(&config_path)?;
        let export_id = Regex::new(r"Export_Id = (\d+);").expect("static regex");
        let ids = IdAllocator::new(max_config_id(&contents, &export_id), ID_FLOOR);
        Ok(Self {
            config_path,
            root_squash,
            runner,
            ids: Mutex::new(ids),
        })
    }

    fn format_block(&self, path: &str, id: u32) -> String {
        let squash = if self.root_squash {
            "root_id_squash"
        } else {
            "no_root_squash"
        };
        format!(
            "\nEXPORT\n{{\n\
             \tExport_Id = {id};\n\
             \tPath = {path};\n\
             \tPseudo = {path};\n\
             \tAccess_Type = RW;\n\
             \tSquash = {squash};\n\
             \tSecType = sys;\n\
             \tFilesystem_id = {id}.{id};\n\
             \tFSAL {{\n\t\tName = VFS;\n\t}}\n}}\n"
        )
    }

    /// Recover the export id for `path` from the config. Delete calls
    /// unexport before removing the block, so scanning the file works even
    /// after a process restart with no in-memory state.
    fn find_export_id(&self, path: &str) -> Result<Option<u32>> {
        let contents = read_config(&self.config_path)?;
        let needle = format!("Path = {path};");
        let Some(pos) = contents.find(&needle) else {
            return Ok(None);
        };
        let head = &contents[..pos];
        let Some(id_pos) = head.rfind("Export_Id = ") else {
            return Ok(None);
        };
        let digits: String = head[id_pos + "Export_Id = ".len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        Ok(digits.parse().ok())
    }
}

impl Exporter for GaneshaExporter {
    fn add_export_block(&self, path: &str) -> Result<(String, u32)> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        let id = ids.next_id();
        let block = self.format_block(path, id);
        append_block(&self.config_path, &block)?;
        Ok((block, id))
    }

    fn export(&self, path: &str) -> Result<()> {
        let config = self.config_path.display().to_string();
        self.runner
            .run(
                "dbus-send",
                &[
                    "--print-reply",
                    "--system",
                    DBUS_DEST,
                    DBUS_OBJECT,
                    "org.ganesha.nfsd.exportmgr.AddExport",
                    &format!("string:{config}"),
                    &format!("string:EXPORT(Path={path})"),
                ],
            )
            .map(drop)
    }

    fn remove_export_block(&self, block: &str, id: u32) -> Result<()> {
        let _ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        remove_block(&self.config_path, block, id)
    }

    fn unexport(&self, path: &str) -> Result<()> {
        let Some(id) = self.find_export_id(path)? else {
            warn!(path, "no EXPORT block for path in config, nothing to unexport");
            return Ok(());
        };
        // Ganesha's management interface takes the id as a 16-bit value.
        self.runner
            .run(
                "dbus-send",
                &[
                    "--print-reply",
                    "--system",
                    DBUS_DEST,
                    DBUS_OBJECT,
                    "org.ganesha.nfsd.exportmgr.RemoveExport",
                    &format!("uint16:{id}"),
                ],
            )
            .map(drop)
    }
}
