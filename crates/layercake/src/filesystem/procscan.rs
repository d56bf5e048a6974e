//! Which processes are using which layer.
//!
//! Walks `/proc/<pid>/cwd`, `/proc/<pid>/root` and `/proc/<pid>/fd/*` and
//! matches the link targets against each layer's build directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::layer::{InUse, InUseMap};

/// Scans a procfs tree.
#[derive(Debug, Clone)]
pub struct ProcScanner {
    proc_root: PathBuf,
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::at("/proc")
    }
}

impl ProcScanner {
    /// Scan `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a procfs tree mounted elsewhere.
    #[must_use]
    pub fn at(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Usage of each `(name, build directory)` pair. Layers nobody uses
    /// are left out. Processes that vanish or cannot be inspected are
    /// skipped.
    pub fn scan<'a, I>(&self, layers: I) -> InUseMap
    where
        I: IntoIterator<Item = (&'a str, &'a Path)>,
    {
        let layers: Vec<(&str, &Path)> = layers.into_iter().collect();
        let mut map = InUseMap::new();

        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.proc_root.display(), error = %e, "Cannot scan processes");
                return map;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(pid) = file_name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit()))
            else {
                continue;
            };
            let dir = entry.path();

            let cwd = fs::read_link(dir.join("cwd")).ok();
            let root = fs::read_link(dir.join("root")).ok();
            let fds: Vec<PathBuf> = match fs::read_dir(dir.join("fd")) {
                Ok(fds) => fds
                    .flatten()
                    .filter_map(|fd| fs::read_link(fd.path()).ok())
                    .collect(),
                Err(e) => {
                    tracing::trace!(pid, error = %e, "Skipping file descriptors");
                    Vec::new()
                }
            };

            for &(name, build) in &layers {
                let usage = InUse {
                    open_files: fds.iter().any(|target| target.starts_with(build)),
                    cwd: cwd.as_ref().is_some_and(|target| target.starts_with(build)),
                    chroot: root.as_ref().is_some_and(|target| target.starts_with(build)),
                };
                if usage.is_busy() {
                    tracing::debug!(layer = name, pid, ?usage, "Layer in use");
                    let slot = map.entry(name.to_string()).or_default();
                    *slot = slot.union(usage);
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn finds_cwd_root_and_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        let base1 = dir.path().join("build/base1");
        let der1 = dir.path().join("build/der1");
        let der10 = dir.path().join("build/der10");

        let p = proc_root.join("123");
        fs::create_dir_all(p.join("fd")).unwrap();
        symlink(base1.join("usr/src"), p.join("cwd")).unwrap();
        symlink("/", p.join("root")).unwrap();

        let p = proc_root.join("456");
        fs::create_dir_all(p.join("fd")).unwrap();
        symlink("/home", p.join("cwd")).unwrap();
        symlink(&der1, p.join("root")).unwrap();
        symlink(der1.join("var/log/build.log"), p.join("fd/3")).unwrap();

        fs::create_dir_all(proc_root.join("self")).unwrap();
        symlink(&der10, proc_root.join("self/cwd")).unwrap();

        let map = ProcScanner::at(&proc_root).scan([
            ("base1", base1.as_path()),
            ("der1", der1.as_path()),
            ("der10", der10.as_path()),
        ]);

        assert_eq!(
            map.get("base1"),
            Some(&InUse {
                cwd: true,
                ..InUse::default()
            })
        );
        assert_eq!(
            map.get("der1"),
            Some(&InUse {
                open_files: true,
                chroot: true,
                cwd: false,
            })
        );
        assert!(!map.contains_key("der10"));
    }

    #[test]
    fn missing_proc_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = ProcScanner::at(dir.path().join("absent")).scan([("a", Path::new("/x"))]);
        assert!(map.is_empty());
    }
}
