//! Filesystem creation.
//!
//! A [`FilesystemKind`] maps to exactly one [`FormatRequest`] (tool plus
//! arguments). Requests are validated before the collaborator is involved,
//! so an unknown kind or an unusable label never reaches a `mkfs` tool.
use crate::audit::AuditLog;
use crate::confirm::Authorization;
use crate::device::Device;
use crate::error::{DiskResult, FormatFailure};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4,
    Ntfs,
    Fat32,
    Exfat,
    Btrfs,
}

impl FilesystemKind {
    pub const ALL: [FilesystemKind; 5] = [
        FilesystemKind::Ext4,
        FilesystemKind::Ntfs,
        FilesystemKind::Fat32,
        FilesystemKind::Exfat,
        FilesystemKind::Btrfs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Ntfs => "ntfs",
            FilesystemKind::Fat32 => "fat32",
            FilesystemKind::Exfat => "exfat",
            FilesystemKind::Btrfs => "btrfs",
        }
    }

    pub fn tool(&self) -> &'static str {
        match self {
            FilesystemKind::Ext4 => "mkfs.ext4",
            FilesystemKind::Ntfs => "mkfs.ntfs",
            FilesystemKind::Fat32 => "mkfs.vfat",
            FilesystemKind::Exfat => "mkfs.exfat",
            FilesystemKind::Btrfs => "mkfs.btrfs",
        }
    }

    /// Flags placed before the label and device.
    fn base_args(&self) -> &'static [&'static str] {
        match self {
            FilesystemKind::Ext4 => &["-F"],
            // Quick format, and allow a whole device rather than a partition.
            FilesystemKind::Ntfs => &["-f", "-F"],
            FilesystemKind::Fat32 => &["-I", "-F", "32"],
            FilesystemKind::Exfat => &[],
            FilesystemKind::Btrfs => &["-f"],
        }
    }

    fn label_flag(&self) -> &'static str {
        match self {
            FilesystemKind::Ext4 | FilesystemKind::Ntfs | FilesystemKind::Btrfs => "-L",
            FilesystemKind::Fat32 | FilesystemKind::Exfat => "-n",
        }
    }

    pub fn max_label_len(&self) -> usize {
        match self {
            FilesystemKind::Ext4 => 16,
            FilesystemKind::Ntfs => 128,
            FilesystemKind::Fat32 => 11,
            FilesystemKind::Exfat => 15,
            FilesystemKind::Btrfs => 255,
        }
    }

    /// The post-creation step for this kind, if any.
    pub fn tuning(&self, device: &Path, reserved_percent: u8) -> Option<Tuning> {
        match self {
            FilesystemKind::Ext4 => Some(Tuning {
                tool: "tune2fs",
                args: vec![
                    OsString::from("-m"),
                    OsString::from(reserved_percent.to_string()),
                    device.as_os_str().to_os_string(),
                ],
            }),
            FilesystemKind::Ntfs
            | FilesystemKind::Fat32
            | FilesystemKind::Exfat
            | FilesystemKind::Btrfs => None,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilesystemKind {
    type Err = FormatFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "vfat" => Ok(FilesystemKind::Fat32),
            other => FilesystemKind::ALL
                .into_iter()
                .find(|k| k.name() == other)
                .ok_or_else(|| FormatFailure::Unsupported(s.to_string())),
        }
    }
}

/// A fully-resolved filesystem creation command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    pub device: PathBuf,
    pub kind: FilesystemKind,
    pub label: String,
    pub tool: &'static str,
    pub args: Vec<OsString>,
}

impl FormatRequest {
    pub fn new(device: &Path, kind: FilesystemKind, label: &str) -> Result<Self, FormatFailure> {
        // Limits are in bytes.
        let max = kind.max_label_len();
        if label.len() > max {
            return Err(FormatFailure::InvalidLabel {
                kind: kind.name(),
                label: label.to_string(),
                max,
            });
        }

        let mut args: Vec<OsString> = kind.base_args().iter().map(OsString::from).collect();
        if !label.is_empty() {
            args.push(OsString::from(kind.label_flag()));
            args.push(OsString::from(label));
        }
        args.push(device.as_os_str().to_os_string());

        Ok(Self {
            device: device.to_path_buf(),
            kind,
            label: label.to_string(),
            tool: kind.tool(),
            args,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tuning {
    pub tool: &'static str,
    pub args: Vec<OsString>,
}

/// Runs filesystem creation tools.
///
/// Implementations report only [`FormatFailure::ToolMissing`] or
/// [`FormatFailure::Rejected`].
pub trait FilesystemCreator {
    fn create(&self, request: &FormatRequest) -> Result<(), FormatFailure>;
    fn tune(&self, device: &Path, tuning: &Tuning) -> Result<(), FormatFailure>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatReport {
    pub kind: FilesystemKind,
    pub label: String,
    pub tuned: bool,
}

pub struct FormatEngine<'a> {
    creator: &'a dyn FilesystemCreator,
    reserved_percent: u8,
}

impl<'a> FormatEngine<'a> {
    pub fn new(creator: &'a dyn FilesystemCreator, reserved_percent: u8) -> Self {
        Self {
            creator,
            reserved_percent,
        }
    }

    /// Formats using the operator's textual filesystem selection.
    pub fn format_named(
        &self,
        device: &Device,
        authorization: &Authorization,
        kind: &str,
        label: &str,
        audit: &mut AuditLog,
    ) -> DiskResult<FormatReport> {
        let kind: FilesystemKind = kind.parse()?;
        self.format(device, authorization, kind, label, audit)
    }

    pub fn format(
        &self,
        device: &Device,
        authorization: &Authorization,
        kind: FilesystemKind,
        label: &str,
        audit: &mut AuditLog,
    ) -> DiskResult<FormatReport> {
        authorization.covers(device)?;
        device.ensure_unmounted()?;

        let request = FormatRequest::new(&device.path, kind, label)?;
        audit.info(format!(
            "Creating {} filesystem on {}{}",
            kind,
            device.path.display(),
            if label.is_empty() {
                String::new()
            } else {
                format!(" with label '{label}'")
            }
        ))?;
        self.creator.create(&request)?;

        let tuned = match kind.tuning(&device.path, self.reserved_percent) {
            Some(tuning) => {
                if let Err(e) = self.creator.tune(&device.path, &tuning) {
                    audit.warn(format!(
                        "{} filesystem was created on {} but {} failed; filesystem is usable without tuning",
                        kind,
                        device.path.display(),
                        tuning.tool
                    ))?;
                    return Err(e.into());
                }
                audit.info(format!(
                    "Reserved blocks on {} set to {}%",
                    device.path.display(),
                    self.reserved_percent
                ))?;
                true
            }
            None => false,
        };

        Ok(FormatReport {
            kind,
            label: label.to_string(),
            tuned,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::error::DiskError;
    use crate::space::tests::device;
    use std::cell::RefCell;

    /// Records every tool invocation.
    #[derive(Default)]
    pub(crate) struct RecordingCreator {
        pub invocations: RefCell<Vec<(String, Vec<OsString>)>>,
        pub missing_tool: bool,
        pub reject_tune: bool,
    }

    impl FilesystemCreator for RecordingCreator {
        fn create(&self, request: &FormatRequest) -> Result<(), FormatFailure> {
            self.invocations
                .borrow_mut()
                .push((request.tool.to_string(), request.args.clone()));
            if self.missing_tool {
                return Err(FormatFailure::ToolMissing {
                    tool: request.tool.to_string(),
                });
            }
            Ok(())
        }

        fn tune(&self, _device: &Path, tuning: &Tuning) -> Result<(), FormatFailure> {
            self.invocations
                .borrow_mut()
                .push((tuning.tool.to_string(), tuning.args.clone()));
            if self.reject_tune {
                return Err(FormatFailure::Rejected {
                    tool: tuning.tool.to_string(),
                    detail: "exit status: 1".into(),
                });
            }
            Ok(())
        }
    }

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    fn format(kind: &str, label: &str, creator: &RecordingCreator) -> DiskResult<FormatReport> {
        let dev = device("/dev/sdc", 1 << 30);
        let auth = Authorization::for_tests(&dev);
        let mut audit = AuditLog::new(MemorySink::new());
        FormatEngine::new(creator, 1).format_named(&dev, &auth, kind, label, &mut audit)
    }

    #[test]
    fn kind_names_parse() {
        for kind in FilesystemKind::ALL {
            assert_eq!(kind.name().parse::<FilesystemKind>().unwrap(), kind);
        }
        assert_eq!("VFAT".parse::<FilesystemKind>().unwrap(), FilesystemKind::Fat32);
    }

    #[test]
    fn requests_apply_label() {
        let dev = Path::new("/dev/sdc");
        let cases = [
            (FilesystemKind::Ext4, "mkfs.ext4", args(&["-F", "-L", "DATA", "/dev/sdc"])),
            (FilesystemKind::Ntfs, "mkfs.ntfs", args(&["-f", "-F", "-L", "DATA", "/dev/sdc"])),
            (FilesystemKind::Fat32, "mkfs.vfat", args(&["-I", "-F", "32", "-n", "DATA", "/dev/sdc"])),
            (FilesystemKind::Exfat, "mkfs.exfat", args(&["-n", "DATA", "/dev/sdc"])),
            (FilesystemKind::Btrfs, "mkfs.btrfs", args(&["-f", "-L", "DATA", "/dev/sdc"])),
        ];
        for (kind, tool, expected) in cases {
            let request = FormatRequest::new(dev, kind, "DATA").unwrap();
            assert_eq!(request.tool, tool);
            assert_eq!(request.args, expected);
        }

        let unlabelled = FormatRequest::new(dev, FilesystemKind::Exfat, "").unwrap();
        assert_eq!(unlabelled.args, args(&["/dev/sdc"]));
    }

    #[test]
    fn ext4_is_tuned_after_creation() {
        let creator = RecordingCreator::default();
        let report = format("ext4", "root", &creator).unwrap();
        assert!(report.tuned);

        let calls = creator.invocations.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "mkfs.ext4");
        assert_eq!(calls[1], ("tune2fs".to_string(), args(&["-m", "1", "/dev/sdc"])));
    }

    #[test]
    fn other_kinds_skip_tuning() {
        let creator = RecordingCreator::default();
        assert!(!format("btrfs", "pool", &creator).unwrap().tuned);
        assert_eq!(creator.invocations.borrow().len(), 1);
    }

    #[test]
    fn unsupported_kind_invokes_nothing() {
        let creator = RecordingCreator::default();
        let err = format("zfs", "", &creator).unwrap_err();
        assert!(matches!(err, DiskError::Format(FormatFailure::Unsupported(k)) if k == "zfs"));
        assert!(creator.invocations.borrow().is_empty());
    }

    #[test]
    fn long_label_invokes_nothing() {
        let creator = RecordingCreator::default();
        let err = format("fat32", "TWELVE_CHARS", &creator).unwrap_err();
        assert!(matches!(err, DiskError::Format(FormatFailure::InvalidLabel { max: 11, .. })));
        assert!(creator.invocations.borrow().is_empty());
    }

    #[test]
    fn label_limit_counts_bytes() {
        let label = "éééééééééé";
        assert_eq!(label.chars().count(), 10);
        let err = FormatRequest::new(Path::new("/disk/C"), FilesystemKind::Ext4, label).unwrap_err();
        assert!(matches!(err, FormatFailure::InvalidLabel { max: 16, .. }));
        assert!(FormatRequest::new(Path::new("/disk/C"), FilesystemKind::Ext4, "éééééééé").is_ok());
    }

    #[test]
    fn failure_reasons_are_distinguished() {
        let missing = RecordingCreator {
            missing_tool: true,
            ..Default::default()
        };
        assert!(matches!(
            format("ntfs", "", &missing),
            Err(DiskError::Format(FormatFailure::ToolMissing { tool })) if tool == "mkfs.ntfs"
        ));

        let rejecting = RecordingCreator {
            reject_tune: true,
            ..Default::default()
        };
        assert!(matches!(
            format("ext4", "", &rejecting),
            Err(DiskError::Format(FormatFailure::Rejected { tool, .. })) if tool == "tune2fs"
        ));
    }
}
