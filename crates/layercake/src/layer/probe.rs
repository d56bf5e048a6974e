//! Layer state reconciliation.
//!
//! Compares what each layer should look like (directories, overlay, bind
//! mounts, export link) with what the filesystem and the mount topology
//! actually show, and derives a [`LayerState`] plus one message per
//! discrepancy.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use layercake_common::LayerPaths;

use crate::layer::info::{InUseMap, LayerInfo, LayerState};
use crate::layer::registry::LayerRegistry;
use crate::topology::{MountRecord, MountTopology};

/// What a required mount must be backed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// A recursive bind of this host path, or any alias of it.
    Alias(PathBuf),
    /// A filesystem of this type mounted from this source.
    Typed {
        /// Filesystem type.
        fstype: String,
        /// Filesystem source.
        source: String,
    },
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alias(path) => write!(f, "{}", path.display()),
            Self::Typed { fstype, source } => write!(f, "{fstype} {source}"),
        }
    }
}

/// One mount a fully mounted layer must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredMount {
    /// Path as the operator wrote it (inside the layer, or on the host for exports).
    pub label: PathBuf,
    /// Absolute mountpoint on the host.
    pub target: PathBuf,
    /// What must be mounted there.
    pub source: MountSource,
}

/// Needed base mounts, then imports, then exports of a layer.
#[must_use]
pub fn required_mounts(
    paths: &LayerPaths,
    base_mounts: &[PathBuf],
    layer: &LayerInfo,
) -> Vec<RequiredMount> {
    let name = layer.name.as_str();
    let mut required: Vec<RequiredMount> = base_mounts
        .iter()
        .map(|path| RequiredMount {
            label: path.clone(),
            target: paths.inside(name, path),
            source: MountSource::Alias(path.clone()),
        })
        .collect();

    for spec in &layer.definition.imports {
        let source = if spec.is_bind() {
            MountSource::Alias(spec.source.clone())
        } else {
            MountSource::Typed {
                fstype: spec.fstype.clone(),
                source: spec.source.to_string_lossy().into_owned(),
            }
        };
        required.push(RequiredMount {
            label: spec.mountpoint.clone(),
            target: paths.inside(name, &spec.mountpoint),
            source,
        });
    }

    for spec in &layer.definition.exports {
        required.push(RequiredMount {
            label: spec.mountpoint.clone(),
            target: spec.mountpoint.clone(),
            source: MountSource::Alias(paths.inside(name, &spec.source)),
        });
    }
    required
}

/// Computes lifecycle states from a mount topology snapshot.
#[derive(Debug, Clone, Copy)]
pub struct LayerStateProbe<'a> {
    paths: &'a LayerPaths,
    topology: &'a MountTopology,
    base_mounts: &'a [PathBuf],
    system_dirs: &'a [String],
    in_use: Option<&'a InUseMap>,
}

impl<'a> LayerStateProbe<'a> {
    /// A probe with no needed base mounts, no system directories and no
    /// in-use information.
    #[must_use]
    pub const fn new(paths: &'a LayerPaths, topology: &'a MountTopology) -> Self {
        Self {
            paths,
            topology,
            base_mounts: &[],
            system_dirs: &[],
            in_use: None,
        }
    }

    /// Paths bind-mounted from the host into every layer (`/dev`, ...).
    #[must_use]
    pub const fn with_base_mounts(mut self, base_mounts: &'a [PathBuf]) -> Self {
        self.base_mounts = base_mounts;
        self
    }

    /// Directories a populated build root must contain.
    #[must_use]
    pub const fn with_system_dirs(mut self, system_dirs: &'a [String]) -> Self {
        self.system_dirs = system_dirs;
        self
    }

    /// Per-layer process usage.
    #[must_use]
    pub const fn with_in_use(mut self, in_use: &'a InUseMap) -> Self {
        self.in_use = Some(in_use);
        self
    }

    /// Probe every layer, bases first.
    pub fn probe_all(&self, registry: &mut LayerRegistry) {
        let order = registry.order().to_vec();
        for name in order {
            let base_state = registry
                .get(&name)
                .and_then(|layer| layer.base.as_deref())
                .and_then(|base| registry.get(base))
                .map(|base| base.state);
            if let Some(layer) = registry.get_mut(&name) {
                self.probe_layer(layer, base_state);
            }
        }
    }

    /// Probe one layer. `base_state` is the already probed state of its base.
    pub fn probe_layer(&self, layer: &mut LayerInfo, base_state: Option<LayerState>) {
        let usage = self
            .in_use
            .and_then(|map| map.get(&layer.name))
            .copied()
            .unwrap_or_default();
        layer.busy = usage.is_busy();
        layer.chroot = usage.chroot;

        let build = self.paths.build(&layer.name);
        layer.mounts = self
            .topology
            .mount_and_submounts(&build)
            .into_iter()
            .cloned()
            .collect();
        layer.export_mounts = layer
            .definition
            .exports
            .iter()
            .filter_map(|spec| self.topology.mount(&spec.mountpoint))
            .cloned()
            .collect();

        let mut messages = Vec::new();
        layer.state = self.evaluate(layer, base_state, &mut messages);
        layer.messages = messages;

        tracing::debug!(
            layer = %layer.name,
            state = %layer.state,
            messages = layer.messages.len(),
            "Probed layer"
        );
    }

    fn evaluate(
        &self,
        layer: &LayerInfo,
        base_state: Option<LayerState>,
        messages: &mut Vec<String>,
    ) -> LayerState {
        if let Some(error) = &layer.base_error {
            messages.push(error.to_string());
            return LayerState::Error;
        }
        if !layer.defined {
            messages.push("layer is not defined".to_string());
            return LayerState::Empty;
        }
        messages.extend(layer.definition.messages.iter().cloned());
        if let Some(base) = &layer.base {
            if base_state == Some(LayerState::Error) {
                messages.push(format!("base layer {base} is in error state"));
                return LayerState::Error;
            }
        }

        let name = layer.name.as_str();
        let build = self.paths.build(name);

        let mut required = vec![("build", build.clone())];
        if layer.is_derived() {
            required.push(("upper", self.paths.upper(name)));
            required.push(("work", self.paths.work(name)));
        }
        let before = messages.len();
        for (what, dir) in required {
            if !dir.is_dir() {
                messages.push(format!("{what} directory {} does not exist", dir.display()));
            }
        }
        if messages.len() > before {
            return LayerState::Incomplete;
        }

        let expectations = required_mounts(self.paths, self.base_mounts, layer);
        let mut expected = expectations.len();
        let mut present = 0usize;

        if let Some(base) = &layer.base {
            expected += 1;
            let Some(overlay) = self.topology.mount(&build) else {
                if self.report_stray_mounts(layer, &build, &[], messages) {
                    return LayerState::Error;
                }
                return if base_state == Some(LayerState::Mounted) {
                    LayerState::Mountable
                } else {
                    LayerState::Complete
                };
            };
            let before = messages.len();
            self.check_overlay(overlay, name, base, messages);
            if messages.len() > before {
                return LayerState::Error;
            }
            present += 1;
        }

        let absent_dirs: Vec<&str> = self
            .system_dirs
            .iter()
            .filter(|dir| !build.join(dir).is_dir())
            .map(String::as_str)
            .collect();
        if !absent_dirs.is_empty() {
            messages.push(format!(
                "build directory lacks system directories: {}",
                absent_dirs.join(", ")
            ));
            return LayerState::Complete;
        }

        let mut incorrect = false;
        let mut missing_dirs = false;
        let mut absent = Vec::new();
        for expectation in &expectations {
            match self.topology.mount(&expectation.target) {
                Some(mount) if self.source_matches(mount, &expectation.source) => present += 1,
                Some(mount) => {
                    incorrect = true;
                    messages.push(format!(
                        "incorrect mount at {}: {} {} (expected {})",
                        expectation.label.display(),
                        mount.fstype,
                        mount.source,
                        expectation.source
                    ));
                }
                None if !expectation.target.exists() => {
                    missing_dirs = true;
                    messages.push(format!(
                        "mountpoint {} does not exist",
                        expectation.label.display()
                    ));
                }
                None => absent.push(&expectation.label),
            }
        }

        let targets: Vec<&Path> = expectations.iter().map(|e| e.target.as_path()).collect();
        incorrect |= self.report_stray_mounts(layer, &build, &targets, messages);
        incorrect |= self.check_export_link(name, &build, messages);

        if incorrect {
            LayerState::Error
        } else if missing_dirs {
            LayerState::Inhabited
        } else if present == expected {
            LayerState::Mounted
        } else if present == 0 {
            LayerState::Mountable
        } else {
            for label in absent {
                messages.push(format!("missing mountpoint {}", label.display()));
            }
            LayerState::PartialMount
        }
    }

    fn source_matches(&self, mount: &MountRecord, source: &MountSource) -> bool {
        match source {
            MountSource::Alias(path) => self.topology.mount_source_is_expected(mount, path),
            MountSource::Typed { fstype, source } => {
                mount.fstype == *fstype && mount.source == *source
            }
        }
    }

    fn check_overlay(
        &self,
        mount: &MountRecord,
        name: &str,
        base: &str,
        messages: &mut Vec<String>,
    ) {
        let Some(overlay) = &mount.overlay else {
            messages.push(format!(
                "build directory is mounted as {}, not overlay",
                mount.fstype
            ));
            return;
        };

        let lower = self.paths.build(base);
        if overlay.lowerdir != lower {
            messages.push(format!(
                "overlay lowerdir is {}, expected {}",
                overlay.lowerdir.display(),
                lower.display()
            ));
        }
        for (field, actual, wanted) in [
            ("upperdir", &overlay.upperdir, self.paths.upper(name)),
            ("workdir", &overlay.workdir, self.paths.work(name)),
        ] {
            if actual.as_deref() != Some(wanted.as_path()) {
                messages.push(format!(
                    "overlay {field} is {}, expected {}",
                    actual
                        .as_deref()
                        .map_or_else(|| "unset".into(), Path::to_string_lossy),
                    wanted.display()
                ));
            }
        }
    }

    /// Flag significant mounts below the build directory that nothing
    /// asked for. Returns whether any were found.
    fn report_stray_mounts(
        &self,
        layer: &LayerInfo,
        build: &Path,
        targets: &[&Path],
        messages: &mut Vec<String>,
    ) -> bool {
        let mut found = false;
        for mount in &layer.mounts {
            if mount.in_shadow
                || mount.mountpoint == build
                || targets.iter().any(|t| mount.mountpoint.starts_with(t))
            {
                continue;
            }
            found = true;
            messages.push(format!(
                "unexpected mount at {} ({} {})",
                mount.mountpoint.display(),
                mount.fstype,
                mount.source
            ));
        }
        found
    }

    /// Validate the export symlink. Returns whether it is wrong.
    fn check_export_link(&self, name: &str, build: &Path, messages: &mut Vec<String>) -> bool {
        let Some(link) = self.paths.export_link(name) else {
            return false;
        };
        let Ok(meta) = fs::symlink_metadata(&link) else {
            return false;
        };
        if !meta.file_type().is_symlink() {
            messages.push(format!("export link {} is not a symlink", link.display()));
            return true;
        }
        match fs::read_link(&link) {
            Ok(target) if target == build => false,
            Ok(target) => {
                messages.push(format!(
                    "export link {} points to {}, expected {}",
                    link.display(),
                    target.display(),
                    build.display()
                ));
                true
            }
            Err(e) => {
                messages.push(format!("cannot read export link {}: {e}", link.display()));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::definition::{LayerDefinition, ParseMode};
    use crate::layer::info::InUse;
    use crate::topology::tests::shadow_types;
    use layercake_common::PathResolver;
    use std::collections::BTreeMap;
    use std::fmt::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: LayerPaths,
        base_mounts: Vec<PathBuf>,
        system_dirs: Vec<String>,
        table: String,
        next_id: u32,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = LayerPaths::with_root(dir.path().join("cake"));
            let mut fixture = Self {
                _dir: dir,
                paths,
                base_mounts: vec![PathBuf::from("/proc")],
                system_dirs: vec!["bin".to_string(), "etc".to_string()],
                table: String::new(),
                next_id: 100,
            };
            fixture.mount_line(1, "8:1", "/", Path::new("/"), "ext4", "/dev/sda1", "rw");
            fixture.mount_line(1, "0:20", "/", Path::new("/proc"), "proc", "proc", "rw");
            fixture
        }

        fn mount_line(
            &mut self,
            parent: u32,
            dev: &str,
            root: &str,
            target: &Path,
            fstype: &str,
            source: &str,
            opts: &str,
        ) {
            self.next_id += 1;
            writeln!(
                self.table,
                "{} {parent} {dev} {root} {} rw - {fstype} {source} {opts}",
                self.next_id,
                target.display()
            )
            .unwrap();
        }

        fn populate(&self, name: &str, derived: bool) {
            let build = self.paths.build(name);
            for dir in ["bin", "etc", "proc"] {
                fs::create_dir_all(build.join(dir)).unwrap();
            }
            if derived {
                fs::create_dir_all(self.paths.upper(name)).unwrap();
                fs::create_dir_all(self.paths.work(name)).unwrap();
            }
        }

        fn mount_overlay(&mut self, name: &str, lower: &str) {
            let opts = format!(
                "rw,lowerdir={},upperdir={},workdir={}",
                self.paths.build(lower).display(),
                self.paths.upper(name).display(),
                self.paths.work(name).display()
            );
            let target = self.paths.build(name);
            self.mount_line(1, "0:50", "/", &target, "overlay", "overlay", &opts);
        }

        fn mount_proc(&mut self, name: &str) {
            let target = self.paths.build(name).join("proc");
            self.mount_line(1, "0:20", "/", &target, "proc", "proc", "rw");
        }

        fn probe(&self, registry: &mut LayerRegistry, in_use: &InUseMap) {
            let topology = MountTopology::build(&self.table, &shadow_types()).unwrap();
            LayerStateProbe::new(&self.paths, &topology)
                .with_base_mounts(&self.base_mounts)
                .with_system_dirs(&self.system_dirs)
                .with_in_use(in_use)
                .probe_all(registry);
        }
    }

    fn two_layers() -> LayerRegistry {
        LayerRegistry::from_entries([
            ("base1".to_string(), None),
            ("der1".to_string(), Some("base1".to_string())),
        ])
    }

    #[test]
    fn missing_directories_are_incomplete() {
        let fx = Fixture::new();
        let mut reg = two_layers();
        fx.probe(&mut reg, &InUseMap::new());

        let der1 = reg.get("der1").unwrap();
        assert_eq!(der1.state, LayerState::Incomplete);
        assert_eq!(der1.messages.len(), 3);
        assert!(der1.messages[1].starts_with("upper directory"));
    }

    #[test]
    fn populated_base_is_mountable_and_derived_waits() {
        let fx = Fixture::new();
        fx.populate("base1", false);
        fx.populate("der1", true);
        let mut reg = two_layers();
        fx.probe(&mut reg, &InUseMap::new());

        assert_eq!(reg.get("base1").unwrap().state, LayerState::Mountable);
        assert_eq!(reg.get("der1").unwrap().state, LayerState::Complete);
    }

    #[test]
    fn missing_system_dirs_stay_complete() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.paths.build("base1")).unwrap();
        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        fx.probe(&mut reg, &InUseMap::new());

        let base1 = reg.get("base1").unwrap();
        assert_eq!(base1.state, LayerState::Complete);
        assert_eq!(
            base1.messages,
            ["build directory lacks system directories: bin, etc"]
        );
    }

    #[test]
    fn missing_mountpoint_directory_stays_inhabited() {
        let fx = Fixture::new();
        fx.populate("base1", false);
        fs::remove_dir(fx.paths.build("base1").join("proc")).unwrap();
        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        fx.probe(&mut reg, &InUseMap::new());

        let base1 = reg.get("base1").unwrap();
        assert_eq!(base1.state, LayerState::Inhabited);
        assert_eq!(base1.messages, ["mountpoint /proc does not exist"]);
    }

    #[test]
    fn fully_mounted_pair() {
        let mut fx = Fixture::new();
        fx.populate("base1", false);
        fx.populate("der1", true);
        fx.mount_proc("base1");
        fx.mount_overlay("der1", "base1");
        fx.mount_proc("der1");
        let mut reg = two_layers();
        fx.probe(&mut reg, &InUseMap::new());

        for name in ["base1", "der1"] {
            let layer = reg.get(name).unwrap();
            assert_eq!(layer.state, LayerState::Mounted, "{name}: {:?}", layer.messages);
            assert!(layer.messages.is_empty());
        }
        assert_eq!(reg.get("der1").unwrap().mounts.len(), 2);
    }

    #[test]
    fn derived_becomes_mountable_once_base_is_mounted() {
        let mut fx = Fixture::new();
        fx.populate("base1", false);
        fx.populate("der1", true);
        fx.mount_proc("base1");
        let mut reg = two_layers();
        fx.probe(&mut reg, &InUseMap::new());
        assert_eq!(reg.get("der1").unwrap().state, LayerState::Mountable);
    }

    #[test]
    fn wrong_overlay_lowerdir_is_an_error() {
        let mut fx = Fixture::new();
        fx.populate("base1", false);
        fx.populate("other", false);
        fx.populate("der1", true);
        fx.mount_overlay("der1", "other");
        let mut reg = two_layers();
        fx.probe(&mut reg, &InUseMap::new());

        let der1 = reg.get("der1").unwrap();
        assert_eq!(der1.state, LayerState::Error);
        assert_eq!(der1.messages.len(), 1);
        assert!(der1.messages[0].starts_with("overlay lowerdir is"));
    }

    #[test]
    fn wrong_bind_source_is_an_error() {
        let mut fx = Fixture::new();
        fx.populate("base1", false);
        let target = fx.paths.build("base1").join("proc");
        fx.mount_line(1, "0:99", "/", &target, "tmpfs", "tmpfs", "rw");
        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        fx.probe(&mut reg, &InUseMap::new());

        let base1 = reg.get("base1").unwrap();
        assert_eq!(base1.state, LayerState::Error);
        assert!(base1.messages[0].starts_with("incorrect mount at /proc"));
    }

    #[test]
    fn stray_mount_is_an_error() {
        let mut fx = Fixture::new();
        fx.populate("base1", false);
        let target = fx.paths.build("base1").join("etc");
        fx.mount_line(1, "0:99", "/", &target, "tmpfs", "tmpfs", "rw");
        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        fx.probe(&mut reg, &InUseMap::new());

        let base1 = reg.get("base1").unwrap();
        assert_eq!(base1.state, LayerState::Error);
        assert!(base1.messages[0].starts_with("unexpected mount at"));
    }

    #[test]
    fn broken_export_link_is_an_error() {
        let fx = Fixture::new();
        fx.populate("base1", false);
        let link = fx.paths.export_link("base1").unwrap();
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("/nowhere", &link).unwrap();
        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        fx.probe(&mut reg, &InUseMap::new());

        let base1 = reg.get("base1").unwrap();
        assert_eq!(base1.state, LayerState::Error);
        assert!(base1.messages[0].contains("points to /nowhere"));
    }

    #[test]
    fn typed_import_matches_fstype_and_source() {
        let mut fx = Fixture::new();
        fx.populate("base1", false);
        fs::create_dir_all(fx.paths.build("base1").join("tmp")).unwrap();
        fx.mount_proc("base1");
        let target = fx.paths.build("base1").join("tmp");
        fx.mount_line(1, "0:99", "/", &target, "tmpfs", "tmpfs", "rw");

        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        reg.get_mut("base1").unwrap().definition = LayerDefinition::parse(
            "import tmpfs tmpfs /tmp\n",
            Path::new("base1.layer"),
            &PathResolver::default(),
            ParseMode::Strict,
        )
        .unwrap();
        fx.probe(&mut reg, &InUseMap::new());
        assert_eq!(reg.get("base1").unwrap().state, LayerState::Mounted);
    }

    #[test]
    fn undefined_and_broken_layers() {
        let fx = Fixture::new();
        let mut reg = LayerRegistry::from_entries([("a".to_string(), Some("b".to_string()))]);
        fx.probe(&mut reg, &InUseMap::new());
        let a = reg.get("a").unwrap();
        assert_eq!(a.state, LayerState::Error);
        assert!(a.messages[0].starts_with("missing base"));

        let mut reg = LayerRegistry::new();
        reg.add_layer("x", None).unwrap();
        reg.get_mut("x").unwrap().defined = false;
        fx.probe(&mut reg, &InUseMap::new());
        assert_eq!(reg.get("x").unwrap().state, LayerState::Empty);
    }

    #[test]
    fn in_use_flags_do_not_change_state() {
        let fx = Fixture::new();
        fx.populate("base1", false);
        let mut reg = LayerRegistry::from_entries([("base1".to_string(), None)]);
        let in_use: InUseMap = BTreeMap::from([(
            "base1".to_string(),
            InUse {
                chroot: true,
                ..InUse::default()
            },
        )]);
        fx.probe(&mut reg, &in_use);

        let base1 = reg.get("base1").unwrap();
        assert!(base1.busy && base1.chroot);
        assert_eq!(base1.state, LayerState::Mountable);
    }
}
