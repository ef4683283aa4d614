//! Pre-flight space accounting for image targets.
use crate::device::Device;
use crate::error::{DiskError, DiskResult};
use std::io;
use std::path::Path;

/// Reports free space for the filesystem holding a directory.
pub trait FreeSpace {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceReport {
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub sufficient: bool,
}

impl SpaceReport {
    pub fn new(required_bytes: u64, available_bytes: u64) -> Self {
        Self {
            required_bytes,
            available_bytes,
            sufficient: required_bytes <= available_bytes,
        }
    }

    pub fn ensure_sufficient(&self) -> DiskResult<()> {
        if self.sufficient {
            Ok(())
        } else {
            Err(DiskError::SpaceInsufficient {
                required: self.required_bytes,
                available: self.available_bytes,
            })
        }
    }
}

pub struct SpaceValidator {
    free_space: Box<dyn FreeSpace>,
}

impl SpaceValidator {
    pub fn new(free_space: impl FreeSpace + 'static) -> Self {
        Self {
            free_space: Box::new(free_space),
        }
    }

    /// Compares the device's full size with the free space next to `target`.
    pub fn check(&self, device: &Device, target: &Path) -> DiskResult<SpaceReport> {
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(DiskError::TargetDirectoryMissing(parent.to_path_buf()));
        }

        let available = self.free_space.available_bytes(parent)?;
        let report = SpaceReport::new(device.size_bytes, available);
        tracing::debug!(
            required = report.required_bytes,
            available = report.available_bytes,
            dir = %parent.display(),
            "space check"
        );
        Ok(report)
    }
}
