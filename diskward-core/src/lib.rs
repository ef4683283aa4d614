//! The core, UI-agnostic library for the `diskward` disk utility.
//!
//! `diskward-core` is designed to be used as a library by any front-end. It
//! handles device discovery and diagnostics, raw device imaging with
//! bad-sector recovery, multi-pass erasure, filesystem creation, and the
//! audit trail that records every one of those operations.
//!
//! The library is structured into several key modules:
//! - [`device`]: The `Device` snapshot and the [`device::Diagnostics`] seam.
//! - [`space`]: Free-space checks performed before any image is written.
//! - [`confirm`]: The retype-the-path gate in front of destructive operations.
//! - [`mod@image`], [`erase`], [`format`]: The three operation engines.
//! - [`audit`]: The append-only, timestamped operation log.
//! - [`platform`]: Linux implementations of every collaborator trait.
//! - [`workflow`]: Ties the above together behind a single `execute` call.
//!
//! Engines never talk to the operator directly. Progress is reported through
//! [`progress::Progress`], confirmation answers come from a
//! [`confirm::Operator`], and cancellation is a shared `AtomicBool`.
//!
//! ## Example: Securely erasing a device
//!
//! ```rust,no_run
//! use diskward_core::audit::{AuditLog, FileSink};
//! use diskward_core::confirm::{ConfirmationPrompt, Operator};
//! use diskward_core::config::EngineConfig;
//! use diskward_core::erase::EraseMethod;
//! use diskward_core::workflow::{Collaborators, OperationRequest, Workflow};
//! use diskward_core::preflight;
//! use std::io;
//! use std::path::PathBuf;
//! use std::sync::atomic::AtomicBool;
//!
//! struct Stdin;
//!
//! impl Operator for Stdin {
//!     fn retype_device(&mut self, prompt: &ConfirmationPrompt<'_>) -> io::Result<String> {
//!         println!("{}\n{}", prompt.identity, prompt.diagnostics);
//!         let mut line = String::new();
//!         io::stdin().read_line(&mut line)?;
//!         Ok(line.trim_end_matches(['\n', '\r']).to_string())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::default();
//!     let capabilities = preflight::check(&config.required_tools)?;
//!     let audit = AuditLog::new(FileSink::open("/var/log/diskward.log")?);
//!     let collaborators = Collaborators::system(&config);
//!     let mut workflow = Workflow::new(capabilities, config, collaborators, audit);
//!
//!     let running = AtomicBool::new(true);
//!     let request = OperationRequest::Erase {
//!         device: PathBuf::from("/dev/sdb"),
//!         method: EraseMethod::Dod3,
//!     };
//!     workflow.execute(&request, &mut Stdin, &running, &mut ())?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod confirm;
pub mod device;
pub mod erase;
pub mod error;
pub mod format;
pub mod image;
pub mod platform;
pub mod preflight;
pub mod progress;
pub mod size;
pub mod space;
pub mod workflow;

pub use error::{DiskError, DiskResult};
