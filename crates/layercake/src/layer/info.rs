//! Layer records and lifecycle states.

use std::collections::BTreeMap;
use std::fmt;

use crate::layer::definition::LayerDefinition;
use crate::topology::MountRecord;

/// Lifecycle state of a layer, from least to most usable.
///
/// The derived ordering is meaningful: everything below
/// [`LayerState::Mountable`] must be prepared before it can be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LayerState {
    /// Discovered directory with no usable content.
    #[default]
    Empty,
    /// Structural problem; stays until fixed externally.
    Error,
    /// Some required directory is missing.
    Incomplete,
    /// All required directories exist.
    Complete,
    /// Build root holds the minimal OS directories.
    Inhabited,
    /// Ready to mount.
    Mountable,
    /// Some but not all required mounts are present.
    PartialMount,
    /// Every required mount is present and verified.
    Mounted,
}

impl LayerState {
    /// Lower-case name as shown to operators.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Error => "error",
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Inhabited => "inhabited",
            Self::Mountable => "mountable",
            Self::PartialMount => "partialmount",
            Self::Mounted => "mounted",
        }
    }
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a layer's base chain cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseError {
    /// The chain ends at a layer that does not exist.
    Missing {
        /// The chain walked, e.g. `der2 → der1 → gone`.
        chain: String,
        /// The missing layer.
        missing: String,
    },
    /// The chain loops.
    Cycle {
        /// The chain walked, ending at the first repeated layer.
        chain: String,
    },
}

impl fmt::Display for BaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { chain, missing } => {
                write!(f, "missing base: {chain} ({missing} is not defined)")
            }
            Self::Cycle { chain } => write!(f, "base-layer cycle: {chain}"),
        }
    }
}

/// How processes are using a layer's build directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InUse {
    /// A process has a file open below the build directory.
    pub open_files: bool,
    /// A process has its working directory below the build directory.
    pub cwd: bool,
    /// A process has the build directory as its root.
    pub chroot: bool,
}

impl InUse {
    /// Whether any process holds the layer.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        self.open_files || self.cwd || self.chroot
    }

    /// Combine two observations.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            open_files: self.open_files || other.open_files,
            cwd: self.cwd || other.cwd,
            chroot: self.chroot || other.chroot,
        }
    }
}

/// In-use flags keyed by layer name.
pub type InUseMap = BTreeMap<String, InUse>;

/// One named layer.
#[derive(Debug, Clone, Default)]
pub struct LayerInfo {
    /// Unique, case-sensitive name.
    pub name: String,
    /// Base layer; `None` for a base layer.
    pub base: Option<String>,
    /// Listed in the registry file (as opposed to only found on disk).
    pub defined: bool,
    /// Lifecycle state computed by the last probe.
    pub state: LayerState,
    /// Diagnostics from the last probe.
    pub messages: Vec<String>,
    /// A process has the layer open.
    pub busy: bool,
    /// A process has the layer as its root.
    pub chroot: bool,
    /// Set when the base chain is broken.
    pub base_error: Option<BaseError>,
    /// Declared imports and exports.
    pub definition: LayerDefinition,
    /// Live mounts at or below the build directory.
    pub mounts: Vec<MountRecord>,
    /// Live mounts at the layer's export mountpoints.
    pub export_mounts: Vec<MountRecord>,
}

impl LayerInfo {
    /// A defined layer.
    #[must_use]
    pub fn new(name: impl Into<String>, base: Option<String>) -> Self {
        Self {
            name: name.into(),
            base,
            defined: true,
            ..Self::default()
        }
    }

    /// A layer only known from directories on disk.
    #[must_use]
    pub fn discovered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether this is a derived layer.
    #[must_use]
    pub const fn is_derived(&self) -> bool {
        self.base.is_some()
    }

    /// Whether the base chain is broken.
    #[must_use]
    pub const fn has_base_error(&self) -> bool {
        self.base_error.is_some()
    }

    /// Whether anything belonging to the layer is mounted.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        !self.mounts.is_empty() || !self.export_mounts.is_empty()
    }
}
