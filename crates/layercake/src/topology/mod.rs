//! Live mount topology.
//!
//! Parses the kernel's per-process mount table into a graph of mounts and
//! backing devices, and answers the point and subtree queries the layer
//! state probe needs.

mod record;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use layercake_common::{LayerError, LayerResult};

pub use record::{DeviceRecord, MountRecord, OverlayDirs};

/// Default location of the live mount table.
pub const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Somewhere a raw mount table can be read from.
pub trait MountTableSource {
    /// Read the whole table.
    fn read_table(&self) -> LayerResult<String>;
}

/// The mount table of a process, read from procfs.
#[derive(Debug, Clone)]
pub struct ProcMountTable {
    path: PathBuf,
}

impl ProcMountTable {
    /// Read `/proc/self/mountinfo`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a mount table from another path (e.g. `/proc/1/mountinfo`).
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self::at(PROC_MOUNTINFO)
    }
}

impl MountTableSource for ProcMountTable {
    fn read_table(&self) -> LayerResult<String> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| LayerError::os("read mount table", &self.path, e))
    }
}

/// A fixed mount table, for snapshots and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticMountTable(pub String);

impl MountTableSource for StaticMountTable {
    fn read_table(&self) -> LayerResult<String> {
        Ok(self.0.clone())
    }
}

/// In-memory graph of live mounts and their backing devices.
#[derive(Debug, Clone, Default)]
pub struct MountTopology {
    /// Every mount, in mount table order.
    mounts: Vec<MountRecord>,
    /// Mountpoint to the topmost mount attached there.
    by_path: HashMap<PathBuf, usize>,
    /// Device identifier to device.
    devices: BTreeMap<String, DeviceRecord>,
}

impl MountTopology {
    /// Parse a raw mount table.
    ///
    /// Mounts whose filesystem type is in `shadow_fstypes`, and every mount
    /// below one of them, are marked `in_shadow`.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::MalformedMountLine`] for the first record with
    /// too few fields.
    pub fn build(raw: &str, shadow_fstypes: &BTreeSet<String>) -> LayerResult<Self> {
        let mut topology = Self::default();

        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = MountRecord::parse(line, idx + 1)?;

            let device = topology
                .devices
                .entry(record.device.clone())
                .or_insert_with(|| DeviceRecord {
                    id: record.device.clone(),
                    fstype: record.fstype.clone(),
                    root_mountpoints: Vec::new(),
                });
            if record.is_device_root() && !device.root_mountpoints.contains(&record.mountpoint) {
                device.root_mountpoints.push(record.mountpoint.clone());
            }

            topology
                .by_path
                .insert(record.mountpoint.clone(), topology.mounts.len());
            topology.mounts.push(record);
        }

        topology.mark_shadowed(shadow_fstypes);

        tracing::debug!(
            mounts = topology.mounts.len(),
            devices = topology.devices.len(),
            "Parsed mount table"
        );
        Ok(topology)
    }

    /// Read and parse a mount table from `source`.
    ///
    /// # Errors
    ///
    /// Propagates read and parse failures.
    pub fn probe(
        source: &dyn MountTableSource,
        shadow_fstypes: &BTreeSet<String>,
    ) -> LayerResult<Self> {
        Self::build(&source.read_table()?, shadow_fstypes)
    }

    /// Propagate shadowing from shadowing filesystem types to their children.
    ///
    /// Parents normally precede children in the table, but the kernel does
    /// not promise it, so iterate until nothing changes.
    fn mark_shadowed(&mut self, shadow_fstypes: &BTreeSet<String>) {
        let mut shadowed: HashSet<u32> = HashSet::new();
        loop {
            let mut changed = false;
            for mount in &mut self.mounts {
                if mount.in_shadow {
                    continue;
                }
                if shadow_fstypes.contains(&mount.fstype) || shadowed.contains(&mount.parent_id) {
                    mount.in_shadow = true;
                    shadowed.insert(mount.mount_id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// All mounts, in mount table order.
    pub fn mounts(&self) -> impl Iterator<Item = &MountRecord> {
        self.mounts.iter()
    }

    /// Look up a device by identifier.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    /// The mount attached exactly at `path`, if any.
    #[must_use]
    pub fn mount(&self, path: &Path) -> Option<&MountRecord> {
        self.by_path.get(path).map(|&idx| &self.mounts[idx])
    }

    /// The mount at `path` (if any) followed by every mount below it,
    /// sorted by mountpoint.
    #[must_use]
    pub fn mount_and_submounts(&self, path: &Path) -> Vec<&MountRecord> {
        let mut found: Vec<&MountRecord> = self
            .by_path
            .iter()
            .filter(|(mountpoint, _)| mountpoint.starts_with(path))
            .map(|(_, &idx)| &self.mounts[idx])
            .collect();
        found.sort_by(|a, b| a.mountpoint.as_os_str().cmp(b.mountpoint.as_os_str()));
        found
    }

    /// Paths that are equally valid sources for `mount`.
    ///
    /// An overlay's own mount reports its lower directory. Every other mount,
    /// including binds taken from inside an overlay, reports each other place
    /// the same device root is mounted, adjusted by the mount's `root`
    /// offset, plus the source device node when it is a path.
    #[must_use]
    pub fn mount_sources(&self, mount: &MountRecord) -> Vec<PathBuf> {
        if let Some(overlay) = mount.overlay.as_ref().filter(|_| mount.is_device_root()) {
            return vec![overlay.lowerdir.clone()];
        }

        let mut sources = Vec::new();
        if let Some(device) = self.devices.get(&mount.device) {
            for root_mountpoint in &device.root_mountpoints {
                let candidate = join_root(root_mountpoint, &mount.root);
                if candidate != mount.mountpoint && !sources.contains(&candidate) {
                    sources.push(candidate);
                }
            }
        }
        if mount.source.starts_with('/') {
            let node = PathBuf::from(&mount.source);
            if !sources.contains(&node) {
                sources.push(node);
            }
        }
        sources
    }

    /// Whether `candidate` is one of [`Self::mount_sources`] for `mount`.
    #[must_use]
    pub fn mount_source_is_expected(&self, mount: &MountRecord, candidate: &Path) -> bool {
        self.mount_sources(mount).iter().any(|s| s == candidate)
    }
}

/// Append a device-relative `root` to a mountpoint of the device root.
fn join_root(mountpoint: &Path, root: &Path) -> PathBuf {
    match root.strip_prefix("/") {
        Ok(rest) if !rest.as_os_str().is_empty() => mountpoint.join(rest),
        _ => mountpoint.to_path_buf(),
    }
}
