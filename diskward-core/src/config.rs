//! Tunables for the operation engines.
use crate::size::MIB;

/// Engine configuration, passed explicitly into [`crate::workflow::Workflow`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Bytes per read/write call for imaging and erasure.
    pub block_size: usize,
    /// Granularity at which unreadable regions are retried and zero-filled.
    pub sector_size: usize,
    /// Reserved-block percentage applied to new ext4 filesystems.
    pub ext4_reserved_percent: u8,
    /// Write a `sha256sum`-style sidecar next to each image.
    pub write_checksum_file: bool,
    /// Tools that must be on `PATH` before any operation is offered.
    pub required_tools: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 4 * MIB as usize,
            sector_size: 512,
            ext4_reserved_percent: 1,
            write_checksum_file: true,
            required_tools: vec!["lsblk".to_string()],
        }
    }
}
