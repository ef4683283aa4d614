//! The error taxonomy shared by every engine.
use crate::size::format_size;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("Device not found: {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("Confirmation for {} did not match; operation aborted", .0.display())]
    Aborted(PathBuf),

    #[error(
        "Insufficient space for image: required {}, available {}",
        human(.required),
        human(.available)
    )]
    SpaceInsufficient { required: u64, available: u64 },

    #[error("Target directory does not exist: {}", .0.display())]
    TargetDirectoryMissing(PathBuf),

    #[error("Copy failed after {} ({reason}); partial image left in place", human(.copied))]
    CopyFailure { copied: u64, reason: String },

    #[error("Erase failed on pass {pass} of {passes} after {} written ({reason}); device is partially erased", human(.written))]
    EraseFailure {
        pass: usize,
        passes: usize,
        written: u64,
        reason: String,
    },

    #[error(transparent)]
    Format(#[from] FormatFailure),

    #[error("Required tools are not installed: {}", .0.join(", "))]
    ToolUnavailable(Vec<String>),

    #[error("This operation requires root privileges")]
    PrivilegeRequired,

    #[error("Device {} is mounted at {}; unmount it first", .device.display(), .mount_point.display())]
    DeviceMounted { device: PathBuf, mount_point: PathBuf },

    #[error("Audit log write failed: {0}")]
    Audit(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DiskError {
    /// True for errors raised before any mutation of the device or target.
    pub fn is_validation(&self) -> bool {
        match self {
            DiskError::DeviceNotFound(_)
            | DiskError::Aborted(_)
            | DiskError::SpaceInsufficient { .. }
            | DiskError::TargetDirectoryMissing(_)
            | DiskError::ToolUnavailable(_)
            | DiskError::PrivilegeRequired
            | DiskError::DeviceMounted { .. } => true,
            DiskError::Format(failure) => failure.is_validation(),
            DiskError::CopyFailure { .. }
            | DiskError::EraseFailure { .. }
            | DiskError::Audit(_)
            | DiskError::Io(_) => false,
        }
    }
}

/// Why a filesystem could not be created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatFailure {
    #[error("Unsupported filesystem '{0}' (expected one of: ext4, ntfs, fat32, exfat, btrfs)")]
    Unsupported(String),

    #[error("Label '{label}' is too long for {kind} (maximum {max} bytes)")]
    InvalidLabel {
        kind: &'static str,
        label: String,
        max: usize,
    },

    #[error("Required tool '{tool}' is not installed")]
    ToolMissing { tool: String },

    #[error("'{tool}' rejected the device: {detail}")]
    Rejected { tool: String, detail: String },
}

impl FormatFailure {
    fn is_validation(&self) -> bool {
        matches!(
            self,
            FormatFailure::Unsupported(_) | FormatFailure::InvalidLabel { .. }
        )
    }
}

fn human(bytes: &u64) -> String {
    format_size(*bytes)
}

pub type DiskResult<T> = Result<T, DiskError>;
