//! # Layercake
//!
//! Layercake manages a tree of named filesystem layers used as build and
//! chroot environments. A base layer is a plain directory; a derived layer
//! is an overlayfs mount of its own upper directory over its base.
//!
//! ## Features
//!
//! - **Mount topology**: parses the live mount table and resolves bind and
//!   overlay sources back to host paths
//! - **Layer registry**: base-before-derived ordering with missing-base and
//!   cycle detection
//! - **State probe**: reconciles what each layer needs against what is
//!   actually mounted
//! - **Lifecycle**: makedirs, mount, unmount, chroot, shell and shake, with a
//!   pretend mode that only describes what it would do
//!
//! ## Usage
//!
//! ```no_run
//! use layercake::config::Config;
//! use layercake::filesystem::ProcScanner;
//! use layercake::lifecycle::{HostOps, LayerLifecycle};
//! use layercake::topology::ProcMountTable;
//!
//! # fn example() -> layercake_common::LayerResult<()> {
//! let mut lifecycle = LayerLifecycle::new(
//!     Config::default(),
//!     Box::new(ProcMountTable::new()),
//!     Box::new(HostOps),
//! )
//! .with_scanner(ProcScanner::new())
//! .load()?;
//!
//! lifecycle.mount(Some("der1"))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod filesystem;
pub mod layer;
pub mod lifecycle;
pub mod topology;

pub use layercake_common::{LayerError, LayerResult};
pub use layer::{LayerInfo, LayerRegistry, LayerState};
pub use lifecycle::LayerLifecycle;
