//! Startup capability checks.
//!
//! Run once before any operation is offered. The resulting [`Capabilities`]
//! value is required to build a [`crate::workflow::Workflow`].
use crate::error::{DiskError, DiskResult};

/// Proof that the process passed its startup checks.
#[derive(Clone, Debug)]
pub struct Capabilities {
    tools: Vec<String>,
}

impl Capabilities {
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self { tools: Vec::new() }
    }
}

/// Checks for root privileges and every tool in `required` on `PATH`.
pub fn check(required: &[String]) -> DiskResult<Capabilities> {
    check_with(nix::unistd::Uid::effective().is_root(), required, |tool| {
        which::which(tool).is_ok()
    })
}

pub fn check_with(
    privileged: bool,
    required: &[String],
    is_available: impl Fn(&str) -> bool,
) -> DiskResult<Capabilities> {
    if !privileged {
        return Err(DiskError::PrivilegeRequired);
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|tool| !is_available(tool))
        .cloned()
        .collect();
    if !missing.is_empty() {
        tracing::warn!(?missing, "required tools not found");
        return Err(DiskError::ToolUnavailable(missing));
    }

    Ok(Capabilities {
        tools: required.to_vec(),
    })
}
