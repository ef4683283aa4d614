//! Provides the operating-system implementations of the engine's collaborators.
//!
//! This module contains the logic for interacting with the kernel and system
//! tools: discovering block devices, sizing them, querying SMART health,
//! measuring free space, raw block I/O, and running `mkfs` tools.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the implementation for
//! the target OS. Only Linux is supported today.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
