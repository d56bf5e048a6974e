//! Standard filesystem paths for a layercake base path.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default base path for layer data.
pub static LAYERCAKE_BASE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LAYERCAKE_BASE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/layercake"))
});

/// Name of the registry file under the base path.
pub const LAYERS_FILE: &str = "layers.conf";

/// Extension of per-layer definition files.
pub const DEFINITION_EXT: &str = "layer";

/// Layout of the directories and files under one base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPaths {
    /// Base path holding every layer.
    pub root: PathBuf,
    /// Directory holding one export symlink per layer, if exports are enabled.
    pub export: Option<PathBuf>,
}

impl LayerPaths {
    /// Create paths with the default base path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom base path and the default export directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let export = Some(root.join("export"));
        Self { root, export }
    }

    /// Override the export directory (`None` disables export links).
    #[must_use]
    pub fn with_export(mut self, export: Option<PathBuf>) -> Self {
        self.export = export;
        self
    }

    /// Registry file listing defined layers.
    #[must_use]
    pub fn layers_file(&self) -> PathBuf {
        self.root.join(LAYERS_FILE)
    }

    /// Advisory lock file.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Parent of every build directory.
    #[must_use]
    pub fn build_root(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Build directory (the layer's visible root).
    #[must_use]
    pub fn build(&self, name: &str) -> PathBuf {
        self.build_root().join(name)
    }

    /// Parent of every overlay upper directory.
    #[must_use]
    pub fn upper_root(&self) -> PathBuf {
        self.root.join("upper")
    }

    /// Overlay upper directory of a derived layer.
    #[must_use]
    pub fn upper(&self, name: &str) -> PathBuf {
        self.upper_root().join(name)
    }

    /// Parent of every overlay work directory.
    #[must_use]
    pub fn work_root(&self) -> PathBuf {
        self.root.join("work")
    }

    /// Overlay work directory of a derived layer.
    #[must_use]
    pub fn work(&self, name: &str) -> PathBuf {
        self.work_root().join(name)
    }

    /// Directory holding layer definition files.
    #[must_use]
    pub fn config_root(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Definition file of a layer.
    #[must_use]
    pub fn definition(&self, name: &str) -> PathBuf {
        self.config_root()
            .join(format!("{name}.{DEFINITION_EXT}"))
    }

    /// Export symlink of a layer.
    #[must_use]
    pub fn export_link(&self, name: &str) -> Option<PathBuf> {
        self.export.as_deref().map(|dir| dir.join(name))
    }

    /// Map a path inside a layer (e.g. `/dev`) onto its build directory.
    #[must_use]
    pub fn inside(&self, name: &str, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            self.build(name)
        } else {
            self.build(name).join(relative)
        }
    }
}

impl Default for LayerPaths {
    fn default() -> Self {
        Self::with_root(LAYERCAKE_BASE.clone())
    }
}
