//! The operation driver.
//!
//! A [`Workflow`] owns every collaborator and the audit log, and runs one
//! [`OperationRequest`] at a time. Destructive requests go through a
//! [`ConfirmationGate`] first; the engines themselves refuse to run without the
//! [`Authorization`] a confirmed gate produces. Every request ends with exactly
//! one success or error entry in the audit log.
use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::confirm::{Authorization, ConfirmationGate, ConfirmationState, Operator};
use crate::device::{Device, DeviceInfo};
use crate::erase::{EraseEngine, EraseMethod, EraseReport, Overwriter};
use crate::error::{DiskError, DiskResult};
use crate::format::{FilesystemCreator, FilesystemKind, FormatEngine, FormatReport, FormatRequest};
use crate::image::{BlockCopier, Digester, ImageReport, ImagingPipeline};
use crate::preflight::Capabilities;
use crate::progress::Progress;
use crate::size::format_size;
use crate::space::SpaceValidator;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationRequest {
    Image { device: PathBuf, target: PathBuf },
    Erase { device: PathBuf, method: EraseMethod },
    /// `kind` is the operator's raw selection; it is resolved before confirmation.
    Format { device: PathBuf, kind: String, label: String },
}

impl OperationRequest {
    pub fn device(&self) -> &Path {
        match self {
            OperationRequest::Image { device, .. }
            | OperationRequest::Erase { device, .. }
            | OperationRequest::Format { device, .. } => device,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            OperationRequest::Image { .. } => "Imaging",
            OperationRequest::Erase { .. } => "Secure erase",
            OperationRequest::Format { .. } => "Format",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Imaged(ImageReport),
    Erased(EraseReport),
    Formatted(FormatReport),
}

impl Outcome {
    fn summary(&self, device: &Path) -> String {
        match self {
            Outcome::Imaged(report) => format!(
                "Imaged {} to {} ({}, {} unreadable regions, sha256 {})",
                device.display(),
                report.target.display(),
                format_size(report.bytes_copied),
                report.bad_regions.len(),
                report.digest
            ),
            Outcome::Erased(report) => format!(
                "Erased {} with method {} ({} passes of {})",
                device.display(),
                report.method,
                report.passes_completed,
                format_size(report.bytes_per_pass)
            ),
            Outcome::Formatted(report) => format!(
                "Formatted {} as {}{}",
                device.display(),
                report.kind,
                if report.label.is_empty() {
                    String::new()
                } else {
                    format!(" with label '{}'", report.label)
                }
            ),
        }
    }
}

/// The platform-facing half of a [`Workflow`].
pub struct Collaborators {
    pub devices: DeviceInfo,
    pub space: SpaceValidator,
    pub copier: Box<dyn BlockCopier>,
    pub digester: Box<dyn Digester>,
    pub overwriter: Box<dyn Overwriter>,
    pub creator: Box<dyn FilesystemCreator>,
}

impl Collaborators {
    /// The real block devices, filesystems, and tools of this machine.
    #[cfg(target_os = "linux")]
    pub fn system(config: &EngineConfig) -> Self {
        use crate::image::Sha256Digester;
        use crate::platform::{MkfsCreator, RawBlockCopier, RawOverwriter, StatvfsFreeSpace, SystemDiagnostics};

        Self {
            devices: DeviceInfo::new(SystemDiagnostics),
            space: SpaceValidator::new(StatvfsFreeSpace),
            copier: Box::new(RawBlockCopier {
                sector_size: config.sector_size,
            }),
            digester: Box::new(Sha256Digester),
            overwriter: Box::new(RawOverwriter {
                block_size: config.block_size,
            }),
            creator: Box::new(MkfsCreator),
        }
    }
}

pub struct Workflow {
    capabilities: Capabilities,
    config: EngineConfig,
    devices: DeviceInfo,
    space: SpaceValidator,
    copier: Box<dyn BlockCopier>,
    digester: Box<dyn Digester>,
    overwriter: Box<dyn Overwriter>,
    creator: Box<dyn FilesystemCreator>,
    audit: AuditLog,
}

impl Workflow {
    pub fn new(
        capabilities: Capabilities,
        config: EngineConfig,
        collaborators: Collaborators,
        audit: AuditLog,
    ) -> Self {
        let Collaborators {
            devices,
            space,
            copier,
            digester,
            overwriter,
            creator,
        } = collaborators;
        Self {
            capabilities,
            config,
            devices,
            space,
            copier,
            digester,
            overwriter,
            creator,
            audit,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceInfo {
        &self.devices
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn list(&self) -> anyhow::Result<Vec<Device>> {
        self.devices.list()
    }

    /// Runs `request` to completion and records its outcome.
    pub fn execute(
        &mut self,
        request: &OperationRequest,
        operator: &mut dyn Operator,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> DiskResult<Outcome> {
        self.audit.info(format!(
            "{} requested for {}",
            request.title(),
            request.device().display()
        ))?;

        let result = self.run(request, operator, running, progress);
        match &result {
            Ok(outcome) => self.audit.success(outcome.summary(request.device()))?,
            // The failure itself could not be recorded; nothing more to add.
            Err(DiskError::Audit(_)) => {}
            Err(e) => self.audit.error(format!(
                "{} of {} failed: {}",
                request.title(),
                request.device().display(),
                e
            ))?,
        }
        result
    }

    fn run(
        &mut self,
        request: &OperationRequest,
        operator: &mut dyn Operator,
        running: &AtomicBool,
        progress: &mut dyn Progress,
    ) -> DiskResult<Outcome> {
        let device = self.devices.describe(request.device())?;
        tracing::debug!(device = %device, "described");

        match request {
            OperationRequest::Image { target, .. } => {
                let pipeline = ImagingPipeline::new(
                    &self.space,
                    self.copier.as_ref(),
                    self.digester.as_ref(),
                    self.config.block_size,
                    self.config.write_checksum_file,
                );
                pipeline
                    .image(&device, target, &mut self.audit, running, progress)
                    .map(Outcome::Imaged)
            }
            OperationRequest::Erase { method, .. } => {
                device.ensure_unmounted()?;
                let authorization = self.confirm(&device, operator)?;
                EraseEngine::new(self.overwriter.as_ref())
                    .erase(&device, &authorization, *method, &mut self.audit, running, progress)
                    .map(Outcome::Erased)
            }
            OperationRequest::Format { kind, label, .. } => {
                let kind: FilesystemKind = kind.parse()?;
                FormatRequest::new(&device.path, kind, label)?;
                device.ensure_unmounted()?;
                let authorization = self.confirm(&device, operator)?;
                FormatEngine::new(self.creator.as_ref(), self.config.ext4_reserved_percent)
                    .format(&device, &authorization, kind, label, &mut self.audit)
                    .map(Outcome::Formatted)
            }
        }
    }

    fn confirm(&mut self, device: &Device, operator: &mut dyn Operator) -> DiskResult<Authorization> {
        let mut gate = ConfirmationGate::new(device, self.devices.diagnostics_report(device));
        match gate.confirm(operator)? {
            ConfirmationState::Confirmed => {
                self.audit
                    .info(format!("Operator confirmed {}", device.path.display()))?;
            }
            ConfirmationState::Aborted | ConfirmationState::Unconfirmed => {
                self.audit.warn(format!(
                    "Confirmation for {} did not match; nothing was changed",
                    device.path.display()
                ))?;
            }
        }
        gate.authorize()
    }
}
