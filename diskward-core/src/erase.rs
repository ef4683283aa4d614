//! Multi-pass secure erasure.
//!
//! Each [`EraseMethod`] maps to a fixed [`ErasePlan`]. Passes run strictly in
//! order and every pass must cover the device's full byte range before the
//! next one starts. The first failing pass ends the erase; the partial state
//! is recorded in the audit log and returned to the caller, never hidden.
use crate::audit::AuditLog;
use crate::confirm::Authorization;
use crate::device::Device;
use crate::error::{DiskError, DiskResult};
use crate::progress::Progress;
use crate::size::format_size;
use rand::RngCore;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseMethod {
    Single,
    Dod3,
    GutmannLite,
}

impl EraseMethod {
    pub const ALL: [EraseMethod; 3] = [EraseMethod::Single, EraseMethod::Dod3, EraseMethod::GutmannLite];

    pub fn name(&self) -> &'static str {
        match self {
            EraseMethod::Single => "single",
            EraseMethod::Dod3 => "dod-3",
            EraseMethod::GutmannLite => "gutmann-lite",
        }
    }

    fn patterns(&self) -> &'static [FillPattern] {
        use FillPattern::{Random, Zero};
        match self {
            EraseMethod::Single => &[Random],
            EraseMethod::Dod3 => &[Zero, Random, Zero],
            EraseMethod::GutmannLite => &[Random; 7],
        }
    }
}

impl fmt::Display for EraseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EraseMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EraseMethod::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown erase method '{s}' (expected single, dod-3 or gutmann-lite)"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillPattern {
    Zero,
    /// Output of a cryptographically secure generator.
    Random,
    /// A fixed byte, for device-specific fill requirements.
    Constant(u8),
}

impl fmt::Display for FillPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillPattern::Zero => f.write_str("zero"),
            FillPattern::Random => f.write_str("random"),
            FillPattern::Constant(b) => write!(f, "0x{b:02X}"),
        }
    }
}

/// One full-device overwrite. `index` is 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pass {
    pub index: usize,
    pub pattern: FillPattern,
}

/// The pass sequence for a method. Fixed once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErasePlan {
    method: EraseMethod,
    passes: Vec<Pass>,
}

impl ErasePlan {
    pub fn for_method(method: EraseMethod) -> Self {
        let passes = method
            .patterns()
            .iter()
            .enumerate()
            .map(|(i, &pattern)| Pass { index: i + 1, pattern })
            .collect();
        Self { method, passes }
    }

    pub fn method(&self) -> EraseMethod {
        self.method
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }
}

#[derive(Error, Debug)]
pub enum OverwriteError {
    #[error("interrupted by operator")]
    Interrupted { written: u64 },
    #[error("{source}")]
    Io { written: u64, source: io::Error },
}

impl OverwriteError {
    pub fn written(&self) -> u64 {
        match self {
            OverwriteError::Interrupted { written } | OverwriteError::Io { written, .. } => *written,
        }
    }
}

/// Writes one fill pattern across a device.
pub trait Overwriter {
    /// Overwrites `size` bytes from offset zero and returns the bytes written.
    fn write_pattern(
        &self,
        device: &Path,
        size: u64,
        pattern: FillPattern,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> Result<u64, OverwriteError>;
}

/// Fills `buf` with the next block of `pattern`.
pub fn fill_block(pattern: FillPattern, buf: &mut [u8], rng: &mut dyn RngCore) {
    match pattern {
        FillPattern::Zero => buf.fill(0),
        FillPattern::Constant(b) => buf.fill(b),
        FillPattern::Random => rng.fill_bytes(buf),
    }
}

/// The block loop behind an overwrite pass, over any writer.
///
/// Cancellation is checked before each block, so an interrupted pass always
/// ends on a block boundary.
pub fn overwrite_stream<W: Write>(
    dst: &mut W,
    size: u64,
    pattern: FillPattern,
    block_size: usize,
    rng: &mut dyn RngCore,
    running: &AtomicBool,
    progress: &mut dyn Progress,
) -> Result<u64, OverwriteError> {
    let mut buffer = vec![0u8; block_size];
    // Constant patterns only need filling once.
    fill_block(pattern, &mut buffer, rng);

    let mut written: u64 = 0;
    while written < size {
        if !running.load(Ordering::SeqCst) {
            return Err(OverwriteError::Interrupted { written });
        }

        let chunk = std::cmp::min(block_size as u64, size - written) as usize;
        if pattern == FillPattern::Random {
            fill_block(pattern, &mut buffer[..chunk], rng);
        }
        dst.write_all(&buffer[..chunk])
            .map_err(|source| OverwriteError::Io { written, source })?;

        written += chunk as u64;
        progress.advance(written);
    }

    dst.flush().map_err(|source| OverwriteError::Io { written, source })?;
    Ok(written)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EraseReport {
    pub method: EraseMethod,
    pub passes_completed: usize,
    pub bytes_per_pass: u64,
}

pub struct EraseEngine<'a> {
    overwriter: &'a dyn Overwriter,
}

impl<'a> EraseEngine<'a> {
    pub fn new(overwriter: &'a dyn Overwriter) -> Self {
        Self { overwriter }
    }

    pub fn erase(
        &self,
        device: &Device,
        authorization: &Authorization,
        method: EraseMethod,
        audit: &mut AuditLog,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> DiskResult<EraseReport> {
        authorization.covers(device)?;
        device.ensure_unmounted()?;

        let plan = ErasePlan::for_method(method);
        let total = plan.passes().len();
        audit.info(format!(
            "Erasing {} ({}) with method {} ({} passes)",
            device.path.display(),
            format_size(device.size_bytes),
            method,
            total
        ))?;

        for pass in plan.passes() {
            progress.start(&format!("Pass {}/{} ({})", pass.index, total, pass.pattern), device.size_bytes);
            tracing::debug!(pass = pass.index, pattern = %pass.pattern, "starting erase pass");

            let outcome = self.overwriter.write_pattern(
                &device.path,
                device.size_bytes,
                pass.pattern,
                running,
                progress,
            );
            let (written, reason) = match outcome {
                Ok(written) if written >= device.size_bytes => {
                    audit.info(format!(
                        "Pass {}/{} ({}) complete on {}",
                        pass.index,
                        total,
                        pass.pattern,
                        device.path.display()
                    ))?;
                    continue;
                }
                Ok(written) => (
                    written,
                    format!("short write, covered {} of {}", written, device.size_bytes),
                ),
                Err(e) => (e.written(), e.to_string()),
            };

            progress.finish();
            audit.warn(format!(
                "Erase of {} stopped in pass {}/{} after {}; {} of {} passes completed; remaining passes not attempted; device is partially erased",
                device.path.display(),
                pass.index,
                total,
                format_size(written),
                pass.index - 1,
                total
            ))?;
            return Err(DiskError::EraseFailure {
                pass: pass.index,
                passes: total,
                written,
                reason,
            });
        }

        progress.finish();
        Ok(EraseReport {
            method,
            passes_completed: total,
            bytes_per_pass: device.size_bytes,
        })
    }
}
