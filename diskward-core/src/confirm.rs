//! The two-step confirmation protocol guarding destructive operations.
//!
//! An operator is shown the device's identity and full diagnostics, then must
//! type the device path back exactly. The comparison is made on the raw
//! string the operator supplied, so it is case- and whitespace-sensitive and
//! independent of how the prompt was rendered.
//!
//! A confirmed gate is turned into an [`Authorization`], the only value the
//! erase and format engines accept as proof that confirmation happened.
use crate::device::Device;
use crate::error::{DiskError, DiskResult};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationState {
    Unconfirmed,
    Confirmed,
    /// Terminal. No mutation may follow.
    Aborted,
}

/// What an operator sees before re-typing the device path.
pub struct ConfirmationPrompt<'a> {
    pub device: &'a Path,
    pub identity: &'a str,
    pub diagnostics: &'a str,
}

/// Supplies the operator's answer to a confirmation prompt.
pub trait Operator {
    /// Shows `prompt` and returns exactly what the operator typed, minus the line terminator.
    fn retype_device(&mut self, prompt: &ConfirmationPrompt<'_>) -> io::Result<String>;
}

pub struct ConfirmationGate {
    device: PathBuf,
    identity: String,
    diagnostics: String,
    state: ConfirmationState,
}

impl ConfirmationGate {
    pub fn new(device: &Device, diagnostics: impl Into<String>) -> Self {
        Self {
            device: device.path.clone(),
            identity: device.to_string(),
            diagnostics: diagnostics.into(),
            state: ConfirmationState::Unconfirmed,
        }
    }

    pub fn state(&self) -> ConfirmationState {
        self.state
    }

    pub fn prompt(&self) -> ConfirmationPrompt<'_> {
        ConfirmationPrompt {
            device: &self.device,
            identity: &self.identity,
            diagnostics: &self.diagnostics,
        }
    }

    /// Decides the gate from one answer. Only the first answer counts.
    pub fn submit(&mut self, input: &str) -> ConfirmationState {
        if self.state == ConfirmationState::Unconfirmed {
            self.state = if input.as_bytes() == self.device.as_os_str().as_encoded_bytes() {
                ConfirmationState::Confirmed
            } else {
                ConfirmationState::Aborted
            };
        }
        self.state
    }

    /// Runs the full protocol against an operator. A failed read aborts the gate.
    pub fn confirm(&mut self, operator: &mut dyn Operator) -> DiskResult<ConfirmationState> {
        if self.state != ConfirmationState::Unconfirmed {
            return Ok(self.state);
        }
        match operator.retype_device(&self.prompt()) {
            Ok(answer) => Ok(self.submit(&answer)),
            Err(e) => {
                self.state = ConfirmationState::Aborted;
                Err(e.into())
            }
        }
    }

    pub fn authorize(self) -> DiskResult<Authorization> {
        match self.state {
            ConfirmationState::Confirmed => Ok(Authorization {
                device: self.device,
            }),
            ConfirmationState::Unconfirmed | ConfirmationState::Aborted => {
                Err(DiskError::Aborted(self.device))
            }
        }
    }
}

/// Proof that an operator confirmed a destructive action on one device.
#[derive(Debug)]
pub struct Authorization {
    device: PathBuf,
}

impl Authorization {
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Fails unless this authorization was granted for `device`.
    pub(crate) fn covers(&self, device: &Device) -> DiskResult<()> {
        if self.device == device.path {
            Ok(())
        } else {
            Err(DiskError::Aborted(device.path.clone()))
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(device: &Device) -> Self {
        Self {
            device: device.path.clone(),
        }
    }
}
