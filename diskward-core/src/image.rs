//! Contains the logic for imaging a device to a file and fingerprinting the result.
//!
//! Imaging is error-tolerant: under [`ErrorPolicy::SyncFill`] a block that
//! cannot be read is retried one sector at a time, and sectors that still fail
//! are written as zeros and reported as [`BadRegion`]s. The copy therefore
//! always produces an image of the device's full size unless a write fails or
//! the operator cancels.
//!
//! After copying, a SHA-256 digest of the produced file is computed. It is the
//! caller's integrity reference; the device is not read back for comparison.
use crate::audit::AuditLog;
use crate::device::Device;
use crate::error::{DiskError, DiskResult};
use crate::progress::Progress;
use crate::size::format_size;
use crate::space::SpaceValidator;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use xz2::write::XzEncoder;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// What to do when a source block cannot be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    Abort,
    /// Retry per sector and zero-fill what stays unreadable.
    SyncFill,
}

/// A contiguous run of unreadable source bytes that was zero-filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BadRegion {
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub bytes_copied: u64,
    pub bad_regions: Vec<BadRegion>,
}

#[derive(Error, Debug)]
#[error("{reason}")]
pub struct CopyError {
    pub copied: u64,
    pub reason: String,
}

impl CopyError {
    pub(crate) fn interrupted(copied: u64) -> Self {
        Self {
            copied,
            reason: "interrupted by operator".to_string(),
        }
    }

    pub(crate) fn io(copied: u64, what: &str, e: io::Error) -> Self {
        Self {
            copied,
            reason: format!("{what}: {e}"),
        }
    }
}

/// Copies raw device bytes into a file.
pub trait BlockCopier {
    #[allow(clippy::too_many_arguments)]
    fn copy(
        &self,
        src: &Path,
        size: u64,
        dst: &Path,
        block_size: usize,
        policy: ErrorPolicy,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> Result<CopyReport, CopyError>;
}

/// Computes a content digest of a file as lowercase hex.
pub trait Digester {
    fn hash(&self, path: &Path) -> io::Result<String>;
}

pub struct Sha256Digester;

impl Digester for Sha256Digester {
    fn hash(&self, path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Output encoding for an image, chosen from the target's extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// An image file being written, possibly through an encoder.
pub enum ImageWriter {
    Raw(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Xz(XzEncoder<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl ImageWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(match Compression::for_path(path) {
            Compression::None => ImageWriter::Raw(file),
            Compression::Gzip => ImageWriter::Gzip(GzEncoder::new(file, flate2::Compression::default())),
            Compression::Xz => ImageWriter::Xz(XzEncoder::new(file, 6)),
            Compression::Zstd => ImageWriter::Zstd(zstd::stream::write::Encoder::new(file, 3)?),
        })
    }

    /// Flushes any encoder trailer and syncs the file to disk.
    pub fn finish(self) -> io::Result<()> {
        let inner = match self {
            ImageWriter::Raw(w) => w,
            ImageWriter::Gzip(w) => w.finish()?,
            ImageWriter::Xz(w) => w.finish()?,
            ImageWriter::Zstd(w) => w.finish()?,
        };
        let file = inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl Write for ImageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ImageWriter::Raw(w) => w.write(buf),
            ImageWriter::Gzip(w) => w.write(buf),
            ImageWriter::Xz(w) => w.write(buf),
            ImageWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ImageWriter::Raw(w) => w.flush(),
            ImageWriter::Gzip(w) => w.flush(),
            ImageWriter::Xz(w) => w.flush(),
            ImageWriter::Zstd(w) => w.flush(),
        }
    }
}

/// The block loop behind a copy, over any seekable source and writer.
///
/// `src` must be positioned at offset zero.
#[allow(clippy::too_many_arguments)]
pub fn copy_blocks<R: Read + Seek, W: Write>(
    src: &mut R,
    size: u64,
    dst: &mut W,
    block: &mut [u8],
    sector_size: usize,
    policy: ErrorPolicy,
    running: &AtomicBool,
    progress: &mut dyn Progress,
) -> Result<CopyReport, CopyError> {
    let mut report = CopyReport::default();
    let block_size = block.len() as u64;

    while report.bytes_copied < size {
        if !running.load(Ordering::SeqCst) {
            return Err(CopyError::interrupted(report.bytes_copied));
        }

        let offset = report.bytes_copied;
        let to_read = std::cmp::min(block_size, size - offset) as usize;
        let buffer = &mut block[..to_read];

        if let Err(e) = src.read_exact(buffer) {
            if policy == ErrorPolicy::Abort {
                return Err(CopyError::io(offset, "read failed", e));
            }
            tracing::debug!(offset, error = %e, "block read failed, retrying per sector");
            recover_block(src, offset, buffer, sector_size, &mut report.bad_regions)
                .map_err(|e| CopyError::io(offset, "seek failed", e))?;
        }

        dst.write_all(buffer)
            .map_err(|e| CopyError::io(offset, "write failed", e))?;

        report.bytes_copied += to_read as u64;
        progress.advance(report.bytes_copied);
    }

    dst.flush()
        .map_err(|e| CopyError::io(report.bytes_copied, "write failed", e))?;
    Ok(report)
}

/// Re-reads `buffer` sector by sector, zero-filling sectors that still fail.
///
/// Leaves `src` positioned just past the block.
fn recover_block<R: Read + Seek>(
    src: &mut R,
    offset: u64,
    buffer: &mut [u8],
    sector_size: usize,
    bad_regions: &mut Vec<BadRegion>,
) -> io::Result<()> {
    for (i, sector) in buffer.chunks_mut(sector_size).enumerate() {
        let sector_offset = offset + (i * sector_size) as u64;
        src.seek(SeekFrom::Start(sector_offset))?;
        if src.read_exact(sector).is_ok() {
            continue;
        }
        sector.fill(0);
        let len = sector.len() as u64;
        match bad_regions.last_mut() {
            Some(last) if last.offset + last.len == sector_offset => last.len += len,
            _ => bad_regions.push(BadRegion {
                offset: sector_offset,
                len,
            }),
        }
    }
    src.seek(SeekFrom::Start(offset + buffer.len() as u64))?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReport {
    pub target: PathBuf,
    pub bytes_copied: u64,
    pub bad_regions: Vec<BadRegion>,
    /// Lowercase hex SHA-256 of the produced file.
    pub digest: String,
    pub checksum_file: Option<PathBuf>,
}

pub struct ImagingPipeline<'a> {
    space: &'a SpaceValidator,
    copier: &'a dyn BlockCopier,
    digester: &'a dyn Digester,
    block_size: usize,
    write_checksum_file: bool,
}

impl<'a> ImagingPipeline<'a> {
    pub fn new(
        space: &'a SpaceValidator,
        copier: &'a dyn BlockCopier,
        digester: &'a dyn Digester,
        block_size: usize,
        write_checksum_file: bool,
    ) -> Self {
        Self {
            space,
            copier,
            digester,
            block_size,
            write_checksum_file,
        }
    }

    /// Images `device` into `target`, then digests the result.
    pub fn image(
        &self,
        device: &Device,
        target: &Path,
        audit: &mut AuditLog,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> DiskResult<ImageReport> {
        let space = self.space.check(device, target)?;
        space.ensure_sufficient()?;

        audit.info(format!(
            "Imaging {} ({}) to {}",
            device.path.display(),
            format_size(device.size_bytes),
            target.display()
        ))?;

        progress.start("Imaging", device.size_bytes);
        let copied = self.copier.copy(
            &device.path,
            device.size_bytes,
            target,
            self.block_size,
            ErrorPolicy::SyncFill,
            running,
            progress,
        );
        progress.finish();

        let copy = match copied {
            Ok(copy) => copy,
            Err(e) => {
                audit.warn(format!(
                    "Imaging of {} stopped after {} of {}; partial image left at {}",
                    device.path.display(),
                    format_size(e.copied),
                    format_size(device.size_bytes),
                    target.display()
                ))?;
                return Err(DiskError::CopyFailure {
                    copied: e.copied,
                    reason: e.reason,
                });
            }
        };

        for region in &copy.bad_regions {
            audit.warn(format!(
                "Unreadable region on {} at offset {} ({} bytes) was zero-filled in the image",
                device.path.display(),
                region.offset,
                region.len
            ))?;
        }

        progress.start("Hashing", 0);
        let digest = self.digester.hash(target)?;
        progress.finish();

        let checksum_file = if self.write_checksum_file {
            Some(write_checksum_file(target, &digest)?)
        } else {
            None
        };

        Ok(ImageReport {
            target: target.to_path_buf(),
            bytes_copied: copy.bytes_copied,
            bad_regions: copy.bad_regions,
            digest,
            checksum_file,
        })
    }
}

/// Writes `<target>.sha256` in the format `sha256sum -c` accepts.
fn write_checksum_file(target: &Path, digest: &str) -> io::Result<PathBuf> {
    let mut name = target.as_os_str().to_os_string();
    name.push(".sha256");
    let path = PathBuf::from(name);
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::fs::write(&path, format!("{digest}  {file_name}\n"))?;
    Ok(path)
}
