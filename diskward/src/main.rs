use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use diskward_core::DiskError;
use diskward_core::audit::{self, AuditLog, FileSink};
use diskward_core::config::EngineConfig;
use diskward_core::confirm::{ConfirmationPrompt, Operator};
use diskward_core::device::Device;
use diskward_core::erase::EraseMethod;
use diskward_core::format::FilesystemKind;
use diskward_core::preflight;
use diskward_core::progress::Progress;
use diskward_core::size::{MIB, format_size};
use diskward_core::workflow::{Collaborators, OperationRequest, Outcome, Workflow};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, IsTerminal, Write, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "diskward")]
#[command(about = "Guarded imaging, secure erasure, and formatting of block devices", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Audit log file (created if absent, appended to otherwise)
    #[arg(long, env = "DISKWARD_LOG", default_value = "/var/log/diskward.log", global = true)]
    log_file: PathBuf,

    /// Block size for imaging and erasure, in MiB
    #[arg(
        long,
        env = "DISKWARD_BLOCK_SIZE_MIB",
        default_value_t = 4,
        value_parser = clap::value_parser!(u64).range(1..=256),
        global = true
    )]
    block_size_mib: u64,

    /// Reserved-block percentage for new ext4 filesystems
    #[arg(
        long,
        env = "DISKWARD_RESERVED_PERCENT",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=50),
        global = true
    )]
    reserved_percent: u8,

    /// Do not write a .sha256 file next to new images
    #[arg(long, env = "DISKWARD_NO_CHECKSUM_FILE", global = true)]
    no_checksum_file: bool,

    /// Show diagnostic logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices
    List,
    /// Read a whole device into an image file (.gz, .xz and .zst are compressed)
    Image {
        /// Source device
        device: PathBuf,
        /// Output image file
        target: PathBuf,
    },
    /// Securely erase a device
    Erase {
        device: PathBuf,

        /// Erase method: single, dod-3 or gutmann-lite
        #[arg(short, long, default_value = "dod-3")]
        method: EraseMethod,
    },
    /// Create a filesystem on a device
    Format {
        device: PathBuf,

        /// Filesystem: ext4, ntfs, fat32, exfat or btrfs
        #[arg(long = "fs")]
        kind: String,

        /// Volume label
        #[arg(short, long, default_value = "")]
        label: String,
    },
    /// Print the audit log
    Logs,
}

const MENU: [&str; 5] = [
    "Image Disk",
    "Securely Erase Disk",
    "Format Disk",
    "View Logs",
    "Exit",
];

/// Disables `ECHOCTL` on the controlling terminal while alive.
///
/// Without it Ctrl+C is echoed as `^C` on top of the progress bar before the
/// handler gets a chance to stop the operation.
struct EchoGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoGuard {
    fn install() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let saved = if stdout().is_terminal() {
                Termios::from_fd(fd).ok().filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                })
            } else {
                None
            };
            Self { saved }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref saved) = self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}

/// Renders each engine stage as its own progress bar.
#[derive(Default)]
struct Bars {
    current: Option<ProgressBar>,
}

impl Bars {
    fn bar_style(color: &str) -> ProgressStyle {
        let template = format!(
            "{{prefix:16}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
        );
        ProgressStyle::with_template(&template)
            .map(|s| s.progress_chars("■ "))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:16} [{elapsed_precise}] {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }
}

impl Progress for Bars {
    fn start(&mut self, stage: &str, total: u64) {
        self.finish();
        let bar = if total == 0 {
            let spinner = ProgressBar::new_spinner().with_style(Self::spinner_style());
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        } else {
            let color = if stage.starts_with("Pass") { "red" } else { "green" };
            ProgressBar::new(total).with_style(Self::bar_style(color))
        };
        bar.set_prefix(stage.to_string());
        self.current = Some(bar);
    }

    fn advance(&mut self, done: u64) {
        if let Some(bar) = &self.current {
            bar.set_position(done);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.current.take() {
            bar.finish();
        }
    }
}

impl Drop for Bars {
    fn drop(&mut self) {
        // A stage abandoned by an error leaves its bar where it stopped.
        if let Some(bar) = self.current.take() {
            bar.abandon();
        }
    }
}

/// Asks the operator on the terminal to retype the device path.
///
/// The answer is read as a raw line so that stray whitespace is part of the
/// comparison, just like any other typo.
struct TerminalOperator;

impl Operator for TerminalOperator {
    fn retype_device(&mut self, prompt: &ConfirmationPrompt<'_>) -> io::Result<String> {
        println!();
        println!(
            "{} This will irreversibly change the contents of:",
            style("WARNING:").red().bold()
        );
        println!("  {}", style(prompt.identity).cyan());
        println!();
        for line in prompt.diagnostics.lines() {
            println!("  {line}");
        }
        println!();
        print!(
            "Type {} to confirm, anything else aborts: ",
            style(prompt.device.display()).bold()
        );
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(strip_line_ending(&answer).to_string())
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn init_tracing(verbose: bool) {
    // Audit entries are already printed to the operator; keep them off stderr unless asked.
    let default = if verbose { "debug" } else { "warn,audit=off" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(verbose)
        .init();
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        block_size: (cli.block_size_mib * MIB) as usize,
        ext4_reserved_percent: cli.reserved_percent,
        write_checksum_file: !cli.no_checksum_file,
        ..EngineConfig::default()
    }
}

fn print_error(e: &anyhow::Error) {
    eprintln!("{} {:#}", style("Error:").red().bold(), e);
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No block devices found.");
        return;
    }

    println!("Found {} block devices:", devices.len());
    println!("\n  {:<15} {:>10}  {:<10} {}", "DEVICE", "SIZE", "TYPE", "LOCATION");
    println!("  {:-<15} {:->10}  {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = if device.mount_points.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device
                .mount_points
                .iter()
                .map(|mp| mp.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  {:<15} {:>10}  {:<10} {}",
            device.path.display(),
            format_size(device.size_bytes),
            if device.removable { "removable" } else { "fixed" },
            location
        );
    }
}

fn print_log(path: &Path) -> Result<()> {
    match audit::read_log(path) {
        Ok(text) if text.is_empty() => println!("The audit log is empty."),
        Ok(text) => print!("{text}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => println!("The audit log is empty."),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Imaged(report) => {
            println!(
                "\n✨ Image written to {} ({}).",
                style(report.target.display()).cyan(),
                format_size(report.bytes_copied)
            );
            println!("  SHA-256: {}", report.digest);
            if let Some(sidecar) = &report.checksum_file {
                println!("  Checksum file: {}", sidecar.display());
            }
            if !report.bad_regions.is_empty() {
                println!(
                    "  {} {} unreadable regions were zero-filled; see the audit log.",
                    style("WARNING:").yellow().bold(),
                    report.bad_regions.len()
                );
            }
        }
        Outcome::Erased(report) => println!(
            "\n✨ Erase complete: {} passes of {} ({}).",
            report.passes_completed,
            format_size(report.bytes_per_pass),
            report.method
        ),
        Outcome::Formatted(report) => {
            println!("\n✨ Created {} filesystem.", style(report.kind).cyan());
            if !report.label.is_empty() {
                println!("  Label: {}", report.label);
            }
        }
    }
}

/// Runs one request with terminal progress and confirmation.
///
/// An operator abort is a normal outcome, not an error.
fn perform(workflow: &mut Workflow, request: OperationRequest, running: &AtomicBool) -> Result<()> {
    let mut bars = Bars::default();
    match workflow.execute(&request, &mut TerminalOperator, running, &mut bars) {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(DiskError::Aborted(device)) => {
            println!(
                "{} Confirmation did not match; nothing was done to {}.",
                style("Aborted:").yellow().bold(),
                device.display()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Asks before clobbering an existing image file.
fn confirm_overwrite(target: &Path) -> Result<bool> {
    if !target.exists() {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("{} already exists. Overwrite it?", target.display()))
        .default(false)
        .interact()?;
    Ok(confirmation)
}

fn select_device(workflow: &Workflow, prompt: &str) -> Result<PathBuf> {
    let devices = workflow.list()?;
    if devices.is_empty() {
        return Err(anyhow!("No block devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].path.clone())
}

fn image_interactive(workflow: &mut Workflow, running: &AtomicBool) -> Result<()> {
    let device = select_device(workflow, "Select the device to IMAGE")?;
    let target: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Image file (.gz, .xz or .zst to compress)")
        .interact_text()?;
    let target = PathBuf::from(target);

    if !confirm_overwrite(&target)? {
        println!("Imaging cancelled.");
        return Ok(());
    }
    println!();
    perform(workflow, OperationRequest::Image { device, target }, running)
}

fn erase_interactive(workflow: &mut Workflow, running: &AtomicBool) -> Result<()> {
    let device = select_device(workflow, "Select the device to ERASE")?;
    let items = [
        "single       (1 pass, random)",
        "dod-3        (3 passes: zero, random, zero)",
        "gutmann-lite (7 passes, random)",
    ];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Erase method")
        .items(&items)
        .default(1)
        .interact()?;

    let method = EraseMethod::ALL[selection];
    perform(workflow, OperationRequest::Erase { device, method }, running)
}

fn format_interactive(workflow: &mut Workflow, running: &AtomicBool) -> Result<()> {
    let device = select_device(workflow, "Select the device to FORMAT")?;
    let items: Vec<String> = FilesystemKind::ALL
        .iter()
        .map(|k| format!("{:<6} (label up to {} bytes)", k.name(), k.max_label_len()))
        .collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Filesystem")
        .items(&items)
        .default(0)
        .interact()?;
    let label: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Volume label (empty for none)")
        .allow_empty(true)
        .interact_text()?;

    let request = OperationRequest::Format {
        device,
        kind: FilesystemKind::ALL[selection].name().to_string(),
        label,
    };
    perform(workflow, request, running)
}

fn run_menu(workflow: &mut Workflow, log_file: &Path, running: &AtomicBool) -> Result<()> {
    loop {
        let choice = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("What would you like to do?")
            .items(&MENU)
            .default(0)
            .interact()?;

        // A Ctrl+C during the previous operation only cancelled that operation.
        running.store(true, Ordering::SeqCst);
        let result = match choice {
            0 => image_interactive(workflow, running),
            1 => erase_interactive(workflow, running),
            2 => format_interactive(workflow, running),
            3 => print_log(log_file),
            _ => return Ok(()),
        };
        if let Err(e) = result {
            print_error(&e);
        }
        println!();
    }
}

fn run_command(
    workflow: &mut Workflow,
    command: Commands,
    log_file: &Path,
    running: &AtomicBool,
) -> Result<()> {
    match command {
        Commands::List => {
            print_devices(&workflow.list()?);
            Ok(())
        }
        Commands::Image { device, target } => {
            if !confirm_overwrite(&target)? {
                println!("Imaging cancelled.");
                return Ok(());
            }
            perform(workflow, OperationRequest::Image { device, target }, running)
        }
        Commands::Erase { device, method } => {
            perform(workflow, OperationRequest::Erase { device, method }, running)
        }
        Commands::Format { device, kind, label } => perform(
            workflow,
            OperationRequest::Format { device, kind, label },
            running,
        ),
        Commands::Logs => print_log(log_file),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Dropped when main() returns, restoring the terminal.
    let _echo_guard = EchoGuard::install();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        tracing::warn!("cannot install Ctrl+C handler: {e}");
    }

    let config = engine_config(&cli);
    let capabilities = match preflight::check(&config.required_tools) {
        Ok(capabilities) => capabilities,
        Err(e) => {
            print_error(&e.into());
            return ExitCode::from(1);
        }
    };

    let Cli {
        command, log_file, ..
    } = cli;
    let sink = match FileSink::open(&log_file) {
        Ok(sink) => sink,
        Err(e) => {
            print_error(&anyhow!(e).context(format!("cannot open audit log {}", log_file.display())));
            return ExitCode::from(1);
        }
    };

    let collaborators = Collaborators::system(&config);
    let mut workflow = Workflow::new(capabilities, config, collaborators, AuditLog::new(sink));

    let result = match command {
        Some(command) => run_command(&mut workflow, command, &log_file, &running),
        None => run_menu(&mut workflow, &log_file, &running),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e);
            ExitCode::from(2)
        }
    }
}
