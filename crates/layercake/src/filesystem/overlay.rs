//! OverlayFS mounts for derived layers.

use std::path::{Path, PathBuf};

use layercake_common::{LayerError, LayerPaths, LayerResult};

/// The overlay that forms a derived layer's build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMount {
    /// Base layer's build directory (read-only).
    pub lowerdir: PathBuf,
    /// This layer's upper directory (writable).
    pub upperdir: PathBuf,
    /// This layer's work directory (required by overlayfs).
    pub workdir: PathBuf,
    /// Merged mount point: this layer's build directory.
    pub target: PathBuf,
}

impl OverlayMount {
    /// Create a new overlay description.
    #[must_use]
    pub const fn new(lowerdir: PathBuf, upperdir: PathBuf, workdir: PathBuf, target: PathBuf) -> Self {
        Self {
            lowerdir,
            upperdir,
            workdir,
            target,
        }
    }

    /// The overlay for layer `name` stacked on `base`.
    #[must_use]
    pub fn for_layer(paths: &LayerPaths, name: &str, base: &str) -> Self {
        Self {
            lowerdir: paths.build(base),
            upperdir: paths.upper(name),
            workdir: paths.work(name),
            target: paths.build(name),
        }
    }

    /// The mount options string.
    ///
    /// # Errors
    ///
    /// [`LayerError::Config`] if a directory contains `,` or `:`, which
    /// overlayfs would read as option or layer separators.
    pub fn mount_options(&self) -> LayerResult<String> {
        for dir in [&self.lowerdir, &self.upperdir, &self.workdir] {
            check_option_path(dir)?;
        }
        Ok(format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lowerdir.display(),
            self.upperdir.display(),
            self.workdir.display()
        ))
    }

    /// Mount the overlay filesystem.
    ///
    /// # Errors
    ///
    /// Invalid directory names and OS failures.
    pub fn mount(&self) -> LayerResult<()> {
        let options = self.mount_options()?;
        tracing::debug!(
            target = %self.target.display(),
            options = %options,
            "Mounting overlayfs"
        );
        super::mounts::mount("overlay", "overlay", &self.target, Some(&options))?;
        tracing::info!(target = %self.target.display(), "OverlayFS mounted");
        Ok(())
    }
}

fn check_option_path(path: &Path) -> LayerResult<()> {
    let text = path.to_string_lossy();
    if text.contains([',', ':']) {
        return Err(LayerError::Config {
            message: format!("overlay directory {text} contains ',' or ':'"),
        });
    }
    Ok(())
}
