//! NFS export management.
//!
//! Two interchangeable backends make a directory network-visible: the
//! in-kernel server driven by `/etc/exports` and NFS-Ganesha with its
//! structured config file. Both hand out ids from a monotonic counter
//! seeded from whatever the config already contains.

mod ganesha;
mod kernel;

pub use ganesha::GaneshaExporter;
pub use kernel::KernelExporter;

use crate::error::Result;

/// Backend-agnostic contract for making a directory network-visible.
pub trait Exporter: Send + Sync {
    /// Allocate an id, format a backend-specific export block for `path`,
    /// and append it atomically to the config. Returns the exact text and
    /// the id; the text is what [`Exporter::remove_export_block`] must be
    /// handed to undo this.
    fn add_export_block(&self, path: &str) -> Result<(String, u32)>;

    /// Make the block added for `path` live on the running server.
    fn export(&self, path: &str) -> Result<()>;

    /// Remove the exact text `block` from the config and reclaim any
    /// in-memory bookkeeping for `id`. An absent block is logged and
    /// ignored; this must never remove a different block.
    fn remove_export_block(&self, block: &str, id: u32) -> Result<()>;

    /// Remove the live export for `path`.
    fn unexport(&self, path: &str) -> Result<()>;
}

/// Monotonic id source. Freed ids are never handed out again; the counter
/// only grows for the lifetime of the process, which keeps rollback simple
/// at the cost of eventually exhausting the 32-bit space under extreme
/// churn.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    /// Start above the largest id observed in the on-disk config, or at
    /// `floor` when nothing has been written yet.
    pub(crate) fn new(observed_max: Option<u32>, floor: u32) -> Self {
        let next = match observed_max {
            Some(max) => max.saturating_add(1).max(floor),
            None => floor,
        };
        Self { next }
    }

    pub(crate) fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}
