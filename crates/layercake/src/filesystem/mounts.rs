//! Mount operations.

use std::path::Path;

use layercake_common::{LayerError, LayerResult};

/// Unmount flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountFlags {
    /// Force unmount even if busy.
    pub force: bool,
    /// Lazy unmount (detach from the tree now, clean up when unused).
    pub detach: bool,
}

impl UnmountFlags {
    /// Flags for a forced unmount of a busy layer.
    #[must_use]
    pub const fn forced() -> Self {
        Self {
            force: true,
            detach: true,
        }
    }
}

/// Bind-mount `source` onto `target`, including submounts when `recursive`.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path, recursive: bool) -> LayerResult<()> {
    use rustix::mount::{mount_bind, mount_bind_recursive};

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        recursive,
        "Bind mounting"
    );

    let result = if recursive {
        mount_bind_recursive(source, target)
    } else {
        mount_bind(source, target)
    };
    result.map_err(|e| LayerError::os("bind mount", target, e.into()))
}

/// Mount a filesystem of type `fstype` from `source` onto `target`.
#[cfg(target_os = "linux")]
pub fn mount(fstype: &str, source: &str, target: &Path, data: Option<&str>) -> LayerResult<()> {
    use std::ffi::CString;

    use rustix::mount::{MountFlags, mount};

    tracing::debug!(
        fstype,
        source,
        target = %target.display(),
        data = ?data,
        "Mounting filesystem"
    );

    let data_c = data
        .map(CString::new)
        .transpose()
        .map_err(|_| LayerError::Config {
            message: format!("mount options for {} contain a NUL byte", target.display()),
        })?;

    mount(
        source,
        target,
        fstype,
        MountFlags::empty(),
        data_c.as_deref(),
    )
    .map_err(|e| LayerError::os("mount", target, e.into()))
}

/// Re-issue a bind mount over itself so the kernel revalidates it.
#[cfg(target_os = "linux")]
pub fn remount(target: &Path) -> LayerResult<()> {
    use rustix::mount::{MountFlags, mount_remount};

    tracing::debug!(target = %target.display(), "Remounting");
    mount_remount(target, MountFlags::BIND, "")
        .map_err(|e| LayerError::os("remount", target, e.into()))
}

/// Unmount a filesystem.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path, flags: UnmountFlags) -> LayerResult<()> {
    use rustix::mount::{UnmountFlags as RustixUnmountFlags, unmount};

    tracing::debug!(target = %target.display(), ?flags, "Unmounting filesystem");

    let mut rflags = RustixUnmountFlags::empty();
    if flags.force {
        rflags |= RustixUnmountFlags::FORCE;
    }
    if flags.detach {
        rflags |= RustixUnmountFlags::DETACH;
    }

    unmount(target, rflags).map_err(|e| LayerError::os("unmount", target, e.into()))
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path, _recursive: bool) -> LayerResult<()> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
pub fn mount(_fstype: &str, _source: &str, _target: &Path, _data: Option<&str>) -> LayerResult<()> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
pub fn remount(_target: &Path) -> LayerResult<()> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path, _flags: UnmountFlags) -> LayerResult<()> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> LayerError {
    LayerError::Unsupported {
        feature: "mount".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_flags() {
        let flags = UnmountFlags::forced();
        assert!(flags.force && flags.detach);
        assert_eq!(UnmountFlags::default(), UnmountFlags {
            force: false,
            detach: false,
        });
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn nul_bytes_in_options_are_rejected_before_the_syscall() {
        let err = mount("tmpfs", "tmpfs", Path::new("/nonexistent"), Some("size=1\0m")).unwrap_err();
        assert!(matches!(err, LayerError::Config { .. }));
    }
}
