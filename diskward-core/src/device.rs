use crate::error::{DiskError, DiskResult};
use crate::size::format_size;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Best-effort SMART verdict for a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Unknown,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A snapshot of a block device, taken when it was described.
///
/// A `Device` is never reused across operations; [`DeviceInfo::describe`] is
/// called again before every mutation so a detached device is noticed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    pub size_bytes: u64,
    /// `None` when no health report could be obtained.
    pub health: Option<Health>,
    pub smart_available: bool,
    /// Mount points of the device and any of its partitions.
    pub mount_points: Vec<PathBuf>,
    pub removable: bool,
}

impl Device {
    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }

    /// Refuses a device that is, or has partitions that are, mounted.
    pub fn ensure_unmounted(&self) -> DiskResult<()> {
        match self.mount_points.first() {
            Some(mount_point) => Err(DiskError::DeviceMounted {
                device: self.path.clone(),
                mount_point: mount_point.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mount_points.first() {
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<15} {:>10} {}",
            self.path.display(),
            format_size(self.size_bytes),
            mount_info
        )
    }
}

/// Device enumeration and diagnostics.
///
/// Size lookups report a missing or detached device through
/// [`io::ErrorKind::NotFound`]; every other query is best-effort.
pub trait Diagnostics {
    fn list(&self) -> anyhow::Result<Vec<Device>>;
    fn size_bytes(&self, path: &Path) -> io::Result<u64>;
    fn mount_points(&self, path: &Path) -> Vec<PathBuf>;
    fn removable(&self, path: &Path) -> bool;
    fn partition_table(&self, path: &Path) -> Option<String>;
    /// The raw health report text, if a SMART tool answered.
    fn health_status(&self, path: &Path) -> Option<String>;
}

/// Looks up devices through a [`Diagnostics`] collaborator.
pub struct DeviceInfo {
    diagnostics: Box<dyn Diagnostics>,
}

impl DeviceInfo {
    pub fn new(diagnostics: impl Diagnostics + 'static) -> Self {
        Self {
            diagnostics: Box::new(diagnostics),
        }
    }

    pub fn list(&self) -> anyhow::Result<Vec<Device>> {
        self.diagnostics.list()
    }

    /// Takes a fresh snapshot of the device at `path`.
    pub fn describe(&self, path: &Path) -> DiskResult<Device> {
        let size_bytes = match self.diagnostics.size_bytes(path) {
            Ok(size) => size,
            Err(e) if is_absent(&e) => return Err(DiskError::DeviceNotFound(path.to_path_buf())),
            Err(e) => return Err(e.into()),
        };

        let report = self.diagnostics.health_status(path);
        let health = report.as_deref().map(parse_health);

        Ok(Device {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes,
            smart_available: report.is_some(),
            health,
            mount_points: self.diagnostics.mount_points(path),
            removable: self.diagnostics.removable(path),
        })
    }

    /// The full diagnostic text shown to an operator before a destructive action.
    pub fn diagnostics_report(&self, device: &Device) -> String {
        let mut out = String::new();
        out.push_str(&format!("Device:     {}\n", device.path.display()));
        out.push_str(&format!(
            "Size:       {} ({} bytes)\n",
            format_size(device.size_bytes),
            device.size_bytes
        ));
        let health = match device.health {
            Some(h) => h.to_string(),
            None => "unavailable".to_string(),
        };
        out.push_str(&format!("Health:     {health}\n"));
        out.push_str(&format!(
            "SMART:      {}\n",
            if device.smart_available { "available" } else { "unavailable" }
        ));
        if device.mount_points.is_empty() {
            out.push_str("Mounted:    no\n");
        } else {
            for mp in &device.mount_points {
                out.push_str(&format!("Mounted:    {}\n", mp.display()));
            }
        }
        match self.diagnostics.partition_table(&device.path) {
            Some(table) => {
                out.push_str("Partitions:\n");
                for line in table.lines() {
                    out.push_str("  ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
            None => out.push_str("Partitions: unavailable\n"),
        }
        out
    }
}

/// A device that vanished mid-query surfaces as one of these rather than `NotFound`.
fn is_absent(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound
        || matches!(e.raw_os_error(), Some(libc::ENXIO) | Some(libc::ENODEV))
}

/// Reduces `smartctl -H` style output to a verdict.
pub fn parse_health(report: &str) -> Health {
    let upper = report.to_ascii_uppercase();
    if upper.contains("FAILED") || upper.contains("FAILING") {
        Health::Degraded
    } else if upper.contains("PASSED") || upper.contains(": OK") {
        Health::Healthy
    } else {
        Health::Unknown
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory device table.
    #[derive(Default, Clone)]
    pub(crate) struct FakeDiagnostics {
        pub sizes: HashMap<PathBuf, u64>,
        pub health: HashMap<PathBuf, String>,
        pub mounts: HashMap<PathBuf, Vec<PathBuf>>,
    }

    impl FakeDiagnostics {
        pub fn with_device(mut self, path: &str, size: u64) -> Self {
            self.sizes.insert(PathBuf::from(path), size);
            self
        }
    }

    impl Diagnostics for FakeDiagnostics {
        fn list(&self) -> anyhow::Result<Vec<Device>> {
            Ok(Vec::new())
        }

        fn size_bytes(&self, path: &Path) -> io::Result<u64> {
            self.sizes
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn mount_points(&self, path: &Path) -> Vec<PathBuf> {
            self.mounts.get(path).cloned().unwrap_or_default()
        }

        fn removable(&self, _path: &Path) -> bool {
            false
        }

        fn partition_table(&self, _path: &Path) -> Option<String> {
            None
        }

        fn health_status(&self, path: &Path) -> Option<String> {
            self.health.get(path).cloned()
        }
    }

    struct DetachedDiagnostics;

    impl Diagnostics for DetachedDiagnostics {
        fn list(&self) -> anyhow::Result<Vec<Device>> {
            Ok(Vec::new())
        }
        fn size_bytes(&self, _path: &Path) -> io::Result<u64> {
            Err(io::Error::from_raw_os_error(libc::ENXIO))
        }
        fn mount_points(&self, _path: &Path) -> Vec<PathBuf> {
            Vec::new()
        }
        fn removable(&self, _path: &Path) -> bool {
            false
        }
        fn partition_table(&self, _path: &Path) -> Option<String> {
            None
        }
        fn health_status(&self, _path: &Path) -> Option<String> {
            None
        }
    }

    #[test]
    fn missing_device_is_not_found() {
        let info = DeviceInfo::new(FakeDiagnostics::default());
        let err = info.describe(Path::new("/dev/nope")).unwrap_err();
        assert!(matches!(err, DiskError::DeviceNotFound(p) if p == Path::new("/dev/nope")));
    }

    #[test]
    fn detached_device_is_not_found() {
        let info = DeviceInfo::new(DetachedDiagnostics);
        assert!(matches!(
            info.describe(Path::new("/dev/sdz")),
            Err(DiskError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn health_is_best_effort() {
        let mut diag = FakeDiagnostics::default().with_device("/dev/sdb", 1024);
        let info = DeviceInfo::new(diag.clone());
        let device = info.describe(Path::new("/dev/sdb")).unwrap();
        assert_eq!(device.health, None);
        assert!(!device.smart_available);
        assert!(info.diagnostics_report(&device).contains("Health:     unavailable"));

        diag.health.insert(
            PathBuf::from("/dev/sdb"),
            "SMART overall-health self-assessment test result: PASSED".into(),
        );
        let device = DeviceInfo::new(diag).describe(Path::new("/dev/sdb")).unwrap();
        assert_eq!(device.health, Some(Health::Healthy));
        assert!(device.smart_available);
        assert_eq!(device.name, "sdb");
    }

    #[test]
    fn parses_health_verdicts() {
        assert_eq!(parse_health("test result: FAILED!"), Health::Degraded);
        assert_eq!(parse_health("SMART Health Status: OK"), Health::Healthy);
        assert_eq!(parse_health("Unable to detect device type"), Health::Unknown);
    }
}
