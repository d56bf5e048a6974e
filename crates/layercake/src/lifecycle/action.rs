//! Side effects as values.
//!
//! Every change the lifecycle makes to the host is described by an
//! [`Action`] and handed to a [`SystemOps`]. Pretend mode records the
//! actions without performing them.

use std::fmt;
use std::path::PathBuf;

use layercake_common::LayerResult;

use crate::filesystem::{OverlayMount, UnmountFlags};

/// One side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create a directory and its parents.
    CreateDir {
        /// Directory to create.
        path: PathBuf,
    },
    /// Create a symlink.
    Symlink {
        /// Where the link points.
        target: PathBuf,
        /// The link itself.
        link: PathBuf,
    },
    /// Remove a symlink.
    RemoveSymlink {
        /// The link.
        link: PathBuf,
    },
    /// Rename a file or directory.
    Rename {
        /// Current path.
        from: PathBuf,
        /// New path.
        to: PathBuf,
    },
    /// Replace a file's contents.
    WriteFile {
        /// File to write.
        path: PathBuf,
        /// New contents.
        contents: String,
    },
    /// Mount a derived layer's overlay.
    MountOverlay {
        /// The overlay.
        overlay: OverlayMount,
    },
    /// Bind-mount a path.
    BindMount {
        /// Existing path.
        source: PathBuf,
        /// Mountpoint.
        target: PathBuf,
        /// Include submounts.
        recursive: bool,
    },
    /// Mount a filesystem by type.
    Mount {
        /// Filesystem type.
        fstype: String,
        /// Filesystem source.
        source: String,
        /// Mountpoint.
        target: PathBuf,
    },
    /// Unmount.
    Unmount {
        /// Mountpoint.
        target: PathBuf,
        /// Force and detach.
        flags: UnmountFlags,
    },
    /// Refresh a bind mount in place.
    Remount {
        /// Mountpoint.
        target: PathBuf,
    },
    /// Run a command with the layer as root.
    Chroot {
        /// Layer name.
        layer: String,
        /// New root.
        root: PathBuf,
        /// Command and arguments; empty for the shell.
        command: Vec<String>,
        /// Shell used when `command` is empty.
        shell: PathBuf,
    },
    /// Run a shell in the build directory.
    Shell {
        /// Layer name.
        layer: String,
        /// Working directory.
        dir: PathBuf,
        /// Shell.
        shell: PathBuf,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDir { path } => write!(f, "mkdir -p {}", path.display()),
            Self::Symlink { target, link } => {
                write!(f, "ln -s {} {}", target.display(), link.display())
            }
            Self::RemoveSymlink { link } => write!(f, "rm {}", link.display()),
            Self::Rename { from, to } => write!(f, "mv {} {}", from.display(), to.display()),
            Self::WriteFile { path, .. } => write!(f, "write {}", path.display()),
            Self::MountOverlay { overlay } => write!(
                f,
                "mount -t overlay overlay -o lowerdir={},upperdir={},workdir={} {}",
                overlay.lowerdir.display(),
                overlay.upperdir.display(),
                overlay.workdir.display(),
                overlay.target.display()
            ),
            Self::BindMount {
                source,
                target,
                recursive,
            } => write!(
                f,
                "mount {} {} {}",
                if *recursive { "--rbind" } else { "--bind" },
                source.display(),
                target.display()
            ),
            Self::Mount {
                fstype,
                source,
                target,
            } => write!(f, "mount -t {fstype} {source} {}", target.display()),
            Self::Unmount { target, flags } => {
                f.write_str("umount ")?;
                if flags.force {
                    f.write_str("-f ")?;
                }
                if flags.detach {
                    f.write_str("-l ")?;
                }
                write!(f, "{}", target.display())
            }
            Self::Remount { target } => write!(f, "mount -o remount,bind {}", target.display()),
            Self::Chroot {
                root,
                command,
                shell,
                ..
            } => {
                write!(f, "chroot {}", root.display())?;
                if command.is_empty() {
                    write!(f, " {}", shell.display())
                } else {
                    write!(f, " {}", command.join(" "))
                }
            }
            Self::Shell { dir, shell, .. } => {
                write!(f, "cd {} && {}", dir.display(), shell.display())
            }
        }
    }
}

/// Performs actions on a system.
pub trait SystemOps {
    /// Carry out one action.
    ///
    /// # Errors
    ///
    /// Whatever the underlying operation reports.
    fn perform(&mut self, action: &Action) -> LayerResult<()>;
}
