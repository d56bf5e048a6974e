//! Filesystem operations for layers.
//!
//! This module handles:
//! - Mount, unmount and remount syscalls
//! - OverlayFS options for derived layers
//! - chroot and shell entry
//! - The base path lock
//! - Scanning processes for layer usage

pub mod enter;
pub mod lock;
mod mounts;
mod overlay;
pub mod procscan;

pub use lock::BaseLock;
pub use mounts::{UnmountFlags, bind_mount, mount, remount, unmount};
pub use overlay::OverlayMount;
pub use procscan::ProcScanner;
