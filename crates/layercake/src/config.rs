//! Layercake configuration.
//!
//! ```toml
//! base_path = "/var/lib/layercake"
//! extra_base_mounts = ["/run/udev"]
//! system_dirs = ["bin", "etc", "lib", "usr"]
//!
//! [symbols]
//! src = "/home/builder/src"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use layercake_common::paths::LAYERCAKE_BASE;
use layercake_common::{LayerError, LayerPaths, LayerResult, PathResolver};
use serde::{Deserialize, Serialize};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "LAYERCAKE_CONFIG";

/// Configuration file read when no other is given.
pub const SYSTEM_CONFIG: &str = "/etc/layercake.toml";

/// Settings for one base path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding every layer.
    pub base_path: PathBuf,
    /// Directory for export symlinks (default `<base_path>/export`).
    pub export_dir: Option<PathBuf>,
    /// Filesystem types whose submounts are ignored during reconciliation.
    pub shadow_fstypes: BTreeSet<String>,
    /// Host paths bind-mounted into every layer.
    pub base_mounts: Vec<PathBuf>,
    /// Appended to `base_mounts`.
    pub extra_base_mounts: Vec<PathBuf>,
    /// Directories a populated build root must contain.
    pub system_dirs: Vec<String>,
    /// Named path prefixes usable as `$name/...` in layer definitions.
    pub symbols: BTreeMap<String, PathBuf>,
    /// Shell started by `shell` and by `chroot` without a command.
    pub shell: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: LAYERCAKE_BASE.clone(),
            export_dir: None,
            shadow_fstypes: [
                "autofs",
                "binfmt_misc",
                "bpf",
                "cgroup",
                "cgroup2",
                "configfs",
                "debugfs",
                "devpts",
                "devtmpfs",
                "fusectl",
                "hugetlbfs",
                "mqueue",
                "proc",
                "pstore",
                "securityfs",
                "sysfs",
                "tracefs",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            base_mounts: ["/dev", "/proc", "/sys"].into_iter().map(PathBuf::from).collect(),
            extra_base_mounts: Vec::new(),
            system_dirs: ["bin", "etc", "lib", "usr"]
                .into_iter()
                .map(String::from)
                .collect(),
            symbols: BTreeMap::new(),
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl Config {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// [`LayerError::Config`] for syntax errors, unknown keys and relative
    /// paths.
    pub fn from_toml(content: &str) -> LayerResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| LayerError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// [`LayerError::Config`] if serialization fails.
    pub fn to_toml(&self) -> LayerResult<String> {
        toml::to_string_pretty(self).map_err(|e| LayerError::Config {
            message: format!("Failed to serialize to TOML: {e}"),
        })
    }

    /// Read a configuration file.
    ///
    /// # Errors
    ///
    /// I/O and parse failures.
    pub fn load(path: &Path) -> LayerResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| LayerError::os("read config", path, e))?;
        tracing::debug!(path = %path.display(), "Loading configuration");
        Self::from_toml(&content)
    }

    /// Find and read the configuration: `explicit`, then `$LAYERCAKE_CONFIG`,
    /// then [`SYSTEM_CONFIG`] if it exists, else defaults.
    ///
    /// # Errors
    ///
    /// An explicitly named file that cannot be read or parsed.
    pub fn discover(explicit: Option<&Path>) -> LayerResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let system = Path::new(SYSTEM_CONFIG);
        if system.exists() {
            return Self::load(system);
        }
        Ok(Self::default())
    }

    /// Set the base path.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Set the export symlink directory.
    #[must_use]
    pub fn with_export_dir(mut self, export_dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(export_dir.into());
        self
    }

    /// Replace the needed base mounts.
    #[must_use]
    pub fn with_base_mounts<I, P>(mut self, mounts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.base_mounts = mounts.into_iter().map(Into::into).collect();
        self.extra_base_mounts.clear();
        self
    }

    /// Replace the system directory set.
    #[must_use]
    pub fn with_system_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Add a path symbol.
    #[must_use]
    pub fn with_symbol(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.symbols.insert(name.into(), path.into());
        self
    }

    /// Set the shell.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// On-disk layout of the base path.
    #[must_use]
    pub fn paths(&self) -> LayerPaths {
        let paths = LayerPaths::with_root(&self.base_path);
        match &self.export_dir {
            Some(dir) => paths.with_export(Some(dir.clone())),
            None => paths,
        }
    }

    /// Resolver for definition file paths.
    #[must_use]
    pub fn resolver(&self) -> PathResolver {
        PathResolver::new().with_symbols(self.symbols.clone())
    }

    /// Base mounts followed by the extra base mounts.
    #[must_use]
    pub fn needed_mounts(&self) -> Vec<PathBuf> {
        self.needed_mounts_iter().cloned().collect()
    }

    fn validate(&self) -> LayerResult<()> {
        let absolute = std::iter::once(("base_path", &self.base_path))
            .chain(self.export_dir.iter().map(|p| ("export_dir", p)))
            .chain(self.needed_mounts_iter().map(|p| ("base mount", p)))
            .chain(self.symbols.values().map(|p| ("symbol", p)));
        for (what, path) in absolute {
            if !path.is_absolute() {
                return Err(LayerError::Config {
                    message: format!("{what} {} must be an absolute path", path.display()),
                });
            }
        }
        Ok(())
    }

    fn needed_mounts_iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.base_mounts.iter().chain(&self.extra_base_mounts)
    }
}
