//! End-to-end runs of `Workflow::execute` against file-backed devices.
use diskward_core::DiskError;
use diskward_core::audit::{self, AuditLog, FileSink, MemorySink, Severity};
use diskward_core::config::EngineConfig;
use diskward_core::confirm::{ConfirmationPrompt, Operator};
use diskward_core::device::{Device, DeviceInfo, Diagnostics};
use diskward_core::error::FormatFailure;
use diskward_core::erase::EraseMethod;
use diskward_core::format::{FilesystemCreator, FormatRequest, Tuning};
use diskward_core::image::Sha256Digester;
use diskward_core::platform::{RawBlockCopier, RawOverwriter};
use diskward_core::preflight;
use diskward_core::size::GIB;
use diskward_core::space::{FreeSpace, SpaceValidator};
use diskward_core::workflow::{Collaborators, OperationRequest, Outcome, Workflow};
use std::cell::RefCell;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

/// Treats any regular file as a device of its current length.
struct FileDiagnostics;

impl Diagnostics for FileDiagnostics {
    fn list(&self) -> anyhow::Result<Vec<Device>> {
        Ok(Vec::new())
    }

    fn size_bytes(&self, path: &Path) -> io::Result<u64> {
        fs::metadata(path).map(|m| m.len())
    }

    fn mount_points(&self, _path: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    fn removable(&self, _path: &Path) -> bool {
        true
    }

    fn partition_table(&self, _path: &Path) -> Option<String> {
        None
    }

    fn health_status(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// A device table that only knows sizes.
struct SizedDiagnostics(Vec<(PathBuf, u64)>);

impl Diagnostics for SizedDiagnostics {
    fn list(&self) -> anyhow::Result<Vec<Device>> {
        Ok(Vec::new())
    }

    fn size_bytes(&self, path: &Path) -> io::Result<u64> {
        self.0
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, size)| *size)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
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

struct Unlimited;

impl FreeSpace for Unlimited {
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

struct Fixed(u64);

impl FreeSpace for Fixed {
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[derive(Clone, Default)]
struct RecordingCreator {
    tools: Rc<RefCell<Vec<String>>>,
}

impl FilesystemCreator for RecordingCreator {
    fn create(&self, request: &FormatRequest) -> Result<(), FormatFailure> {
        self.tools.borrow_mut().push(request.tool.to_string());
        Ok(())
    }

    fn tune(&self, _device: &Path, tuning: &Tuning) -> Result<(), FormatFailure> {
        self.tools.borrow_mut().push(tuning.tool.to_string());
        Ok(())
    }
}

/// Answers with the given text, or retypes the device exactly when `None`.
struct Typist(Option<String>);

impl Operator for Typist {
    fn retype_device(&mut self, prompt: &ConfirmationPrompt<'_>) -> io::Result<String> {
        Ok(match &self.0 {
            Some(text) => text.clone(),
            None => prompt.device.to_string_lossy().into_owned(),
        })
    }
}

fn small_blocks() -> EngineConfig {
    EngineConfig {
        block_size: 64 * 1024,
        ..EngineConfig::default()
    }
}

fn workflow(
    devices: DeviceInfo,
    space: SpaceValidator,
    creator: RecordingCreator,
    audit: AuditLog,
) -> Workflow {
    let config = small_blocks();
    let capabilities = preflight::check_with(true, &[], |_| true).unwrap();
    let collaborators = Collaborators {
        devices,
        space,
        copier: Box::new(RawBlockCopier {
            sector_size: config.sector_size,
        }),
        digester: Box::new(Sha256Digester),
        overwriter: Box::new(RawOverwriter {
            block_size: config.block_size,
        }),
        creator: Box::new(creator),
    };
    Workflow::new(capabilities, config, collaborators, audit)
}

fn file_workflow(sink: MemorySink) -> Workflow {
    workflow(
        DeviceInfo::new(FileDiagnostics),
        SpaceValidator::new(Unlimited),
        RecordingCreator::default(),
        AuditLog::new(sink),
    )
}

/// A file standing in for a device, filled with a recognisable pattern.
fn fake_disk(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let path = dir.path().join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 ^ 0x5A).collect();
    fs::write(&path, data).unwrap();
    path
}

fn run(workflow: &mut Workflow, request: OperationRequest, mut typist: Typist) -> Result<Outcome, DiskError> {
    let running = AtomicBool::new(true);
    workflow.execute(&request, &mut typist, &running, &mut ())
}

#[test]
fn image_larger_than_free_space_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("disk.img");
    let sink = MemorySink::new();
    let mut wf = workflow(
        DeviceInfo::new(SizedDiagnostics(vec![(PathBuf::from("/disk/A"), 10 * GIB)])),
        SpaceValidator::new(Fixed(5 * GIB)),
        RecordingCreator::default(),
        AuditLog::new(sink.clone()),
    );

    let err = run(
        &mut wf,
        OperationRequest::Image {
            device: PathBuf::from("/disk/A"),
            target: target.clone(),
        },
        Typist(None),
    )
    .unwrap_err();

    assert!(err.is_validation());
    let message = err.to_string();
    assert!(message.contains("10.00 GiB"), "{message}");
    assert!(message.contains("5.00 GiB"), "{message}");
    assert!(!target.exists());
    assert!(sink.lines().last().unwrap().contains("10.00 GiB"));
}

#[test]
fn image_of_file_device_is_exact_and_digest_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "disk0", 300 * 1024 + 100);
    let mut wf = file_workflow(MemorySink::new());

    let mut digests = Vec::new();
    for name in ["first.img", "second.img"] {
        let target = dir.path().join(name);
        let outcome = run(
            &mut wf,
            OperationRequest::Image {
                device: disk.clone(),
                target: target.clone(),
            },
            Typist(Some("unused".into())),
        )
        .unwrap();

        let Outcome::Imaged(report) = outcome else {
            panic!("expected an image report");
        };
        assert!(report.bad_regions.is_empty());
        assert_eq!(report.bytes_copied, fs::metadata(&disk).unwrap().len());
        assert_eq!(fs::read(&target).unwrap(), fs::read(&disk).unwrap());

        let sidecar = fs::read_to_string(report.checksum_file.unwrap()).unwrap();
        assert_eq!(sidecar, format!("{}  {}\n", report.digest, name));
        digests.push(report.digest);
    }

    assert_eq!(digests[0], digests[1]);
    assert_eq!(digests[0].len(), 64);
    assert!(digests[0].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn gzip_target_decompresses_to_the_device_contents() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "disk1", 128 * 1024);
    let target = dir.path().join("disk1.img.gz");
    let mut wf = file_workflow(MemorySink::new());

    run(
        &mut wf,
        OperationRequest::Image {
            device: disk.clone(),
            target: target.clone(),
        },
        Typist(None),
    )
    .unwrap();

    let mut restored = Vec::new();
    flate2::read::GzDecoder::new(fs::File::open(&target).unwrap())
        .read_to_end(&mut restored)
        .unwrap();
    assert_eq!(restored, fs::read(&disk).unwrap());
}

#[test]
fn confirmed_dod3_erase_leaves_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "diskB", 200 * 1024 + 7);
    let sink = MemorySink::new();
    let mut wf = file_workflow(sink.clone());

    let outcome = run(
        &mut wf,
        OperationRequest::Erase {
            device: disk.clone(),
            method: EraseMethod::Dod3,
        },
        Typist(None),
    )
    .unwrap();

    assert!(matches!(outcome, Outcome::Erased(ref r) if r.passes_completed == 3));
    let contents = fs::read(&disk).unwrap();
    assert_eq!(contents.len(), 200 * 1024 + 7);
    assert!(contents.iter().all(|&b| b == 0));

    let entries = wf.audit().entries();
    assert_eq!(entries.last().unwrap().severity, Severity::Success);
    let pass_lines = sink.lines().iter().filter(|l| l.contains("complete on")).count();
    assert_eq!(pass_lines, 3);
}

#[test]
fn single_pass_erase_randomises_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "diskR", 64 * 1024);
    let before = fs::read(&disk).unwrap();
    let mut wf = file_workflow(MemorySink::new());

    run(
        &mut wf,
        OperationRequest::Erase {
            device: disk.clone(),
            method: EraseMethod::Single,
        },
        Typist(None),
    )
    .unwrap();

    let after = fs::read(&disk).unwrap();
    assert_eq!(after.len(), before.len());
    assert_ne!(after, before);
    assert!(after.iter().any(|&b| b != 0));
}

#[test]
fn mismatched_confirmation_leaves_device_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "diskB", 32 * 1024);
    let before = fs::read(&disk).unwrap();
    let mut wf = file_workflow(MemorySink::new());

    let typed = format!("{} ", disk.display());
    let err = run(
        &mut wf,
        OperationRequest::Erase {
            device: disk.clone(),
            method: EraseMethod::GutmannLite,
        },
        Typist(Some(typed)),
    )
    .unwrap_err();

    assert!(matches!(err, DiskError::Aborted(ref p) if *p == disk));
    assert_eq!(fs::read(&disk).unwrap(), before);
    assert_eq!(wf.audit().entries().last().unwrap().severity, Severity::Error);
}

#[test]
fn unsupported_filesystem_reaches_no_tool() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "diskC", 4096);
    let creator = RecordingCreator::default();
    let mut wf = workflow(
        DeviceInfo::new(FileDiagnostics),
        SpaceValidator::new(Unlimited),
        creator.clone(),
        AuditLog::new(MemorySink::new()),
    );

    let err = run(
        &mut wf,
        OperationRequest::Format {
            device: disk,
            kind: "reiserfs".into(),
            label: String::new(),
        },
        Typist(None),
    )
    .unwrap_err();

    assert!(matches!(err, DiskError::Format(FormatFailure::Unsupported(ref k)) if k == "reiserfs"));
    assert!(creator.tools.borrow().is_empty());
}

#[test]
fn fat32_label_is_checked_before_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let disk = fake_disk(&dir, "diskC", 4096);
    let creator = RecordingCreator::default();
    let mut wf = workflow(
        DeviceInfo::new(FileDiagnostics),
        SpaceValidator::new(Unlimited),
        creator.clone(),
        AuditLog::new(MemorySink::new()),
    );

    let err = run(
        &mut wf,
        OperationRequest::Format {
            device: disk,
            kind: "fat32".into(),
            label: "TWELVE_CHARS".into(),
        },
        Typist(Some("never read".into())),
    )
    .unwrap_err();

    assert!(matches!(err, DiskError::Format(FormatFailure::InvalidLabel { max: 11, .. })));
    assert!(creator.tools.borrow().is_empty());
}

#[test]
fn audit_file_records_every_operation_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("diskward.log");
    let disk = fake_disk(&dir, "diskL", 8192);

    {
        let mut wf = workflow(
            DeviceInfo::new(FileDiagnostics),
            SpaceValidator::new(Unlimited),
            RecordingCreator::default(),
            AuditLog::new(FileSink::open(&log).unwrap()),
        );
        run(
            &mut wf,
            OperationRequest::Format {
                device: disk.clone(),
                kind: "ext4".into(),
                label: "data".into(),
            },
            Typist(None),
        )
        .unwrap();
        run(
            &mut wf,
            OperationRequest::Erase {
                device: dir.path().join("missing"),
                method: EraseMethod::Single,
            },
            Typist(None),
        )
        .unwrap_err();
    }

    let text = audit::read_log(&log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines.len() >= 5, "{text}");
    for line in &lines {
        let (stamp, message) = line.split_once(" - ").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
        assert!(!message.contains('\u{1b}'));
    }
    let stamps: Vec<&str> = lines.iter().map(|l| l.split_once(" - ").unwrap().0).collect();
    let sorted = {
        let mut s = stamps.clone();
        s.sort_by_key(|s| chrono::DateTime::parse_from_rfc3339(s).unwrap());
        s
    };
    assert_eq!(stamps, sorted);
    assert!(lines.last().unwrap().contains("failed"));
}
