use crate::device::{Device, Diagnostics};
use crate::erase::{FillPattern, OverwriteError, Overwriter, overwrite_stream};
use crate::error::FormatFailure;
use crate::format::{FilesystemCreator, FormatRequest, Tuning};
use crate::image::{BlockCopier, CopyError, CopyReport, ErrorPolicy, ImageWriter, copy_blocks};
use crate::progress::Progress;
use crate::space::FreeSpace;
use anyhow::Result;
use nix::ioctl_read;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Buffer alignment for `O_DIRECT` reads.
const DIRECT_IO_ALIGN: usize = 4096;

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn device_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The `/sys/block` entry for `path`; partitions resolve to their disk.
fn sysfs_name(path: &Path) -> String {
    device_name(&get_parent_device_path(path))
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if index > "/dev/".len() && path_str[index + 1..].chars().all(|c| c.is_ascii_digit()) {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Mount points of `device` and of any of its partitions.
fn mount_points_of(disks: &sysinfo::Disks, device: &Path) -> Vec<PathBuf> {
    disks
        .iter()
        .filter(|disk| {
            let path = PathBuf::from("/dev/").join(disk.name());
            path == device || get_parent_device_path(&path) == device
        })
        .map(|disk| disk.mount_point().to_path_buf())
        .filter(|mp| !mp.as_os_str().is_empty())
        .collect()
}

/// Scans `/sys/block` for disks.
///
/// Loop, RAM and zram devices are skipped, as are devices reporting a size
/// of zero (typically empty card readers). Health is not queried here; it is
/// filled in when a single device is described.
pub fn list_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let mut devices = Vec::new();
    for entry in fs::read_dir("/sys/block")?.filter_map(|e| e.ok()) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        if ["loop", "ram", "zram"].iter().any(|p| device_name.starts_with(p)) {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        let path = PathBuf::from("/dev/").join(&device_name);
        devices.push(Device {
            mount_points: mount_points_of(&disks, &path),
            path,
            name: device_name,
            // /sys/block sizes are always in 512-byte units.
            size_bytes: size_sectors * 512,
            health: None,
            smart_available: false,
            removable,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

fn not_a_block_device(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} is not a block device", path.display()),
    )
}

/// Device queries backed by sysfs, ioctls, `lsblk` and `smartctl`.
pub struct SystemDiagnostics;

impl Diagnostics for SystemDiagnostics {
    fn list(&self) -> Result<Vec<Device>> {
        list_devices()
    }

    fn size_bytes(&self, path: &Path) -> io::Result<u64> {
        if !fs::metadata(path)?.file_type().is_block_device() {
            return Err(not_a_block_device(path));
        }

        let file = File::open(path)?;
        let mut size_bytes: u64 = 0;
        unsafe {
            blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
        }
        tracing::debug!(device = %path.display(), size_bytes, "BLKGETSIZE64");
        Ok(size_bytes)
    }

    fn mount_points(&self, path: &Path) -> Vec<PathBuf> {
        mount_points_of(&sysinfo::Disks::new_with_refreshed_list(), path)
    }

    fn removable(&self, path: &Path) -> bool {
        read_sys_file(&device_name(path), "removable")
            .map(|s| s == "1")
            .unwrap_or(false)
    }

    fn partition_table(&self, path: &Path) -> Option<String> {
        let output = Command::new("lsblk")
            .args(["-o", "NAME,SIZE,TYPE,FSTYPE,LABEL,MOUNTPOINT"])
            .arg(path)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn health_status(&self, path: &Path) -> Option<String> {
        let smartctl = which::which("smartctl").ok()?;
        // smartctl's exit status is a bitmask that is often non-zero for
        // healthy drives, so only the output is inspected.
        let output = Command::new(smartctl).arg("-H").arg(path).output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .find(|l| l.contains("self-assessment") || l.contains("Health Status"))
            .map(|l| l.trim().to_string())
    }
}

/// Free space via `statvfs(3)`, counting only blocks available to unprivileged users.
pub struct StatvfsFreeSpace;

impl FreeSpace for StatvfsFreeSpace {
    #[allow(clippy::unnecessary_cast)]
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        let stats = nix::sys::statvfs::statvfs(dir).map_err(io::Error::from)?;
        Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
    }
}

/// Raw device reads into an (optionally compressed) image file.
pub struct RawBlockCopier {
    pub sector_size: usize,
}

impl RawBlockCopier {
    /// The retry granularity: the configured sector size, or the device's
    /// logical block size if that is larger.
    fn sector_size_for(&self, src: &Path) -> usize {
        read_sys_file(&sysfs_name(src), "queue/logical_block_size")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .map_or(self.sector_size, |lbs| lbs.max(self.sector_size))
    }
}

impl BlockCopier for RawBlockCopier {
    fn copy(
        &self,
        src: &Path,
        size: u64,
        dst: &Path,
        block_size: usize,
        policy: ErrorPolicy,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> Result<CopyReport, CopyError> {
        let is_block = fs::metadata(src)
            .map(|m| m.file_type().is_block_device())
            .map_err(|e| CopyError::io(0, "cannot stat source", e))?;

        let mut options = OpenOptions::new();
        options.read(true);
        if is_block {
            // Bypass the page cache so a full-device read does not evict everything else.
            options.custom_flags(libc::O_DIRECT);
        }
        let mut device_file = options
            .open(src)
            .map_err(|e| CopyError::io(0, "cannot open source", e))?;

        let mut image = ImageWriter::create(dst).map_err(|e| CopyError::io(0, "cannot create image", e))?;

        // O_DIRECT requires buffers to be memory-aligned.
        let mut buf = vec![0u8; block_size + DIRECT_IO_ALIGN];
        let offset = buf.as_ptr().align_offset(DIRECT_IO_ALIGN);
        let buffer = &mut buf[offset..offset + block_size];

        let sector_size = self.sector_size_for(src);
        tracing::debug!(src = %src.display(), dst = %dst.display(), block_size, sector_size, direct = is_block, "starting copy");

        let report = copy_blocks(
            &mut device_file,
            size,
            &mut image,
            buffer,
            sector_size,
            policy,
            running,
            progress,
        )?;

        image
            .finish()
            .map_err(|e| CopyError::io(report.bytes_copied, "cannot finalize image", e))?;
        Ok(report)
    }
}

/// Overwrites a device in place from offset zero.
pub struct RawOverwriter {
    pub block_size: usize,
}

/// `O_EXCL` on a block device makes the kernel refuse the open with EBUSY
/// while anything holds it: a mount, device-mapper, LVM or md.
fn overwrite_flags(is_block: bool) -> i32 {
    if is_block { libc::O_EXCL } else { 0 }
}

fn busy_to_in_use(e: io::Error) -> io::Error {
    if e.raw_os_error() == Some(libc::EBUSY) {
        io::Error::new(e.kind(), "device is in use (mounted, or held by device-mapper, LVM or RAID)")
    } else {
        e
    }
}

impl Overwriter for RawOverwriter {
    fn write_pattern(
        &self,
        device: &Path,
        size: u64,
        pattern: FillPattern,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> Result<u64, OverwriteError> {
        let is_block = fs::metadata(device)
            .map(|m| m.file_type().is_block_device())
            .map_err(|source| OverwriteError::Io { written: 0, source })?;
        let mut file = OpenOptions::new()
            .write(true)
            .custom_flags(overwrite_flags(is_block))
            .open(device)
            .map_err(|e| OverwriteError::Io {
                written: 0,
                source: busy_to_in_use(e),
            })?;

        let mut rng = StdRng::from_entropy();
        let written = overwrite_stream(&mut file, size, pattern, self.block_size, &mut rng, running, progress)?;

        file.sync_all()
            .map_err(|source| OverwriteError::Io { written, source })?;
        Ok(written)
    }
}

/// Runs `mkfs.*` and `tune2fs` found on `PATH`.
pub struct MkfsCreator;

impl MkfsCreator {
    fn run(tool: &str, args: &[OsString]) -> Result<(), FormatFailure> {
        let program = which::which(tool).map_err(|_| FormatFailure::ToolMissing {
            tool: tool.to_string(),
        })?;

        tracing::info!(tool, ?args, "running");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| FormatFailure::Rejected {
                tool: tool.to_string(),
                detail: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(FormatFailure::Rejected {
            tool: tool.to_string(),
            detail: match stderr.trim() {
                "" => output.status.to_string(),
                msg => format!("{}: {}", output.status, msg),
            },
        })
    }
}

impl FilesystemCreator for MkfsCreator {
    fn create(&self, request: &FormatRequest) -> Result<(), FormatFailure> {
        Self::run(request.tool, &request.args)
    }

    fn tune(&self, _device: &Path, tuning: &Tuning) -> Result<(), FormatFailure> {
        Self::run(tuning.tool, &tuning.args)
    }
}
