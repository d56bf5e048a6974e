//! Layer lifecycle operations.
//!
//! [`LayerLifecycle`] owns one command's view of the world: configuration,
//! the layer registry, and the mount topology snapshot. Every change it
//! makes goes through [`SystemOps`] as an [`Action`], and the registry is
//! re-probed whenever the host may have changed underneath it.

mod action;
mod host;

use std::fs;
use std::path::PathBuf;

use layercake_common::{LayerError, LayerPaths, LayerResult};

use crate::config::Config;
use crate::filesystem::{OverlayMount, ProcScanner, UnmountFlags};
use crate::layer::definition::replace_base;
use crate::layer::{
    InUseMap, LayerInfo, LayerRegistry, LayerState, LayerStateProbe, MountSource, ParseMode,
    required_mounts,
};
use crate::topology::{MountTableSource, MountTopology};

pub use action::{Action, SystemOps};
pub use host::HostOps;

/// Drives define/mount/unmount/enter operations for one base path.
pub struct LayerLifecycle {
    config: Config,
    paths: LayerPaths,
    needed_mounts: Vec<PathBuf>,
    registry: LayerRegistry,
    topology: MountTopology,
    table: Box<dyn MountTableSource>,
    ops: Box<dyn SystemOps>,
    scanner: Option<ProcScanner>,
    in_use: InUseMap,
    pretend: bool,
    journal: Vec<Action>,
}

impl LayerLifecycle {
    /// Create a lifecycle with an empty registry. Call [`Self::load`] next.
    #[must_use]
    pub fn new(
        config: Config,
        table: Box<dyn MountTableSource>,
        ops: Box<dyn SystemOps>,
    ) -> Self {
        Self {
            paths: config.paths(),
            needed_mounts: config.needed_mounts(),
            config,
            registry: LayerRegistry::new(),
            topology: MountTopology::default(),
            table,
            ops,
            scanner: None,
            in_use: InUseMap::new(),
            pretend: false,
            journal: Vec::new(),
        }
    }

    /// Describe side effects instead of performing them.
    #[must_use]
    pub fn with_pretend(mut self, pretend: bool) -> Self {
        self.pretend = pretend;
        self
    }

    /// Find busy layers by scanning processes on every refresh.
    #[must_use]
    pub fn with_scanner(mut self, scanner: ProcScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Use a fixed in-use map instead of scanning.
    #[must_use]
    pub fn with_in_use(mut self, in_use: InUseMap) -> Self {
        self.scanner = None;
        self.in_use = in_use;
        self
    }

    /// Read the registry from disk and probe every layer.
    ///
    /// # Errors
    ///
    /// Registry, mount table and process scan failures.
    pub fn load(mut self) -> LayerResult<Self> {
        self.registry =
            LayerRegistry::load(&self.paths, &self.config.resolver(), ParseMode::Soft)?;
        self.refresh()?;
        Ok(self)
    }

    /// Re-read the mount table and re-probe every layer.
    ///
    /// # Errors
    ///
    /// Mount table read or parse failures.
    pub fn refresh(&mut self) -> LayerResult<()> {
        self.topology = MountTopology::probe(self.table.as_ref(), &self.config.shadow_fstypes)?;
        if let Some(scanner) = &self.scanner {
            let builds: Vec<(String, PathBuf)> = self
                .registry
                .iter_ordered()
                .map(|layer| (layer.name.clone(), self.paths.build(&layer.name)))
                .collect();
            self.in_use = scanner.scan(builds.iter().map(|(n, p)| (n.as_str(), p.as_path())));
        }
        LayerStateProbe::new(&self.paths, &self.topology)
            .with_base_mounts(&self.needed_mounts)
            .with_system_dirs(&self.config.system_dirs)
            .with_in_use(&self.in_use)
            .probe_all(&mut self.registry);
        Ok(())
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The base path layout.
    #[must_use]
    pub const fn paths(&self) -> &LayerPaths {
        &self.paths
    }

    /// The probed registry.
    #[must_use]
    pub const fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// The last mount table snapshot.
    #[must_use]
    pub const fn topology(&self) -> &MountTopology {
        &self.topology
    }

    /// Whether side effects are only described.
    #[must_use]
    pub const fn is_pretend(&self) -> bool {
        self.pretend
    }

    /// Actions performed (or, in pretend mode, described) so far.
    #[must_use]
    pub fn journal(&self) -> &[Action] {
        &self.journal
    }

    /// Drain the journal.
    pub fn take_journal(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.journal)
    }

    /// Define a layer and save the registry.
    ///
    /// # Errors
    ///
    /// See [`LayerRegistry::add_layer`].
    pub fn define(&mut self, name: &str, base: Option<&str>) -> LayerResult<()> {
        self.registry.add_layer(name, base)?;
        self.save()?;
        self.settle()
    }

    /// Forget a layer and save the registry. Its directories are kept.
    ///
    /// # Errors
    ///
    /// See [`LayerRegistry::remove_layer`].
    pub fn undefine(&mut self, name: &str) -> LayerResult<()> {
        self.registry.remove_layer(name)?;
        self.save()?;
        self.settle()
    }

    /// Rename a layer together with its directories, definition file and
    /// export link, and repoint its dependents.
    ///
    /// # Errors
    ///
    /// See [`LayerRegistry::rename_layer`], plus OS failures.
    pub fn rename(&mut self, old: &str, new: &str) -> LayerResult<()> {
        self.registry.validate_rename(old, new)?;

        let moves = [
            (self.paths.build(old), self.paths.build(new)),
            (self.paths.upper(old), self.paths.upper(new)),
            (self.paths.work(old), self.paths.work(new)),
            (self.paths.definition(old), self.paths.definition(new)),
        ];
        for (from, to) in moves {
            if fs::symlink_metadata(&from).is_ok() {
                self.execute(Action::Rename { from, to })?;
            }
        }
        if let (Some(old_link), Some(new_link)) =
            (self.paths.export_link(old), self.paths.export_link(new))
        {
            if fs::symlink_metadata(&old_link).is_ok() {
                self.execute(Action::RemoveSymlink { link: old_link })?;
                self.execute(Action::Symlink {
                    target: self.paths.build(new),
                    link: new_link,
                })?;
            }
        }

        let dependents = self.registry.dependents(old);
        self.registry.rename_layer(old, new)?;
        for dependent in dependents {
            self.rewrite_definition_base(&dependent, Some(new))?;
        }
        self.save()?;
        self.settle()
    }

    /// Change a layer's base and save the registry.
    ///
    /// # Errors
    ///
    /// See [`LayerRegistry::rebase_layer`]. A [`LayerError::BaseCycle`] is
    /// still saved so the operator can see and fix it.
    pub fn rebase(&mut self, name: &str, base: Option<&str>) -> LayerResult<()> {
        let result = self.registry.rebase_layer(name, base);
        if matches!(result, Ok(()) | Err(LayerError::BaseCycle { .. })) {
            self.rewrite_definition_base(name, base)?;
            self.save()?;
            self.settle()?;
        }
        result
    }

    /// Create missing directories and the export link of one layer, or of
    /// every defined layer.
    ///
    /// # Errors
    ///
    /// Unknown or broken layers and OS failures.
    pub fn makedirs(&mut self, name: Option<&str>) -> LayerResult<()> {
        let names = match name {
            Some(name) => vec![name.to_string()],
            None => self.defined_names(),
        };
        for name in names {
            self.makedirs_one(&name)?;
        }
        self.settle()
    }

    /// Mount one layer with its base chain, or every layer.
    ///
    /// # Errors
    ///
    /// [`LayerError::NotYetMountable`] for a layer that cannot be prepared,
    /// and OS failures. Layers mounted before the failure stay mounted.
    pub fn mount(&mut self, name: Option<&str>) -> LayerResult<()> {
        let chain = match name {
            Some(name) => self.registry.ancestors(name)?,
            None => self
                .defined_names()
                .into_iter()
                .filter(|name| {
                    let usable = self.registry.get(name).is_some_and(|l| {
                        !matches!(l.state, LayerState::Error | LayerState::Empty)
                    });
                    if !usable {
                        tracing::warn!(layer = %name, "Skipping layer in error state");
                    }
                    usable
                })
                .collect(),
        };
        for name in chain {
            self.mount_one(&name)?;
        }
        Ok(())
    }

    /// Unmount one layer, or every mounted layer leaves first.
    ///
    /// # Errors
    ///
    /// [`LayerError::LayerBusy`] without `force`,
    /// [`LayerError::HasMountedDependent`], and OS failures.
    pub fn unmount(&mut self, name: Option<&str>, force: bool) -> LayerResult<()> {
        if let Some(name) = name {
            return self.unmount_one(name, force);
        }
        let names: Vec<String> = self
            .registry
            .order()
            .iter()
            .rev()
            .filter(|name| self.registry.get(name).is_some_and(LayerInfo::is_mounted))
            .cloned()
            .collect();
        for name in names {
            self.unmount_one(&name, force)?;
        }
        Ok(())
    }

    /// Mount the layer if needed and run `command` (or the shell) chrooted
    /// into it.
    ///
    /// # Errors
    ///
    /// Mount failures, [`LayerError::NotYetMountable`] when the layer is
    /// still not fully mounted afterwards, and a command that cannot be
    /// started.
    pub fn chroot(&mut self, name: &str, command: &[String]) -> LayerResult<()> {
        if self.state_of(name)? != LayerState::Mounted {
            self.mount(Some(name))?;
            let state = self.state_of(name)?;
            if state != LayerState::Mounted {
                return Err(not_mountable(name, state));
            }
        }
        self.execute(Action::Chroot {
            layer: name.to_string(),
            root: self.paths.build(name),
            command: command.to_vec(),
            shell: self.config.shell.clone(),
        })
    }

    /// Open a shell in the layer's build directory without changing root.
    ///
    /// # Errors
    ///
    /// Unknown layer, missing build directory, a shell that cannot be
    /// started.
    pub fn shell(&mut self, name: &str) -> LayerResult<()> {
        self.registry.require(name)?;
        let dir = self.paths.build(name);
        if !dir.is_dir() {
            return Err(LayerError::os(
                "open shell in",
                dir,
                std::io::ErrorKind::NotFound.into(),
            ));
        }
        self.execute(Action::Shell {
            layer: name.to_string(),
            dir,
            shell: self.config.shell.clone(),
        })
    }

    /// Remount every mounted derived layer's overlay in place.
    ///
    /// # Errors
    ///
    /// Unknown layer and OS failures.
    pub fn shake(&mut self, name: Option<&str>) -> LayerResult<()> {
        let names = match name {
            Some(name) => {
                self.registry.require(name)?;
                vec![name.to_string()]
            }
            None => self.registry.order().to_vec(),
        };
        for name in names {
            let derived = self
                .registry
                .get(&name)
                .is_some_and(LayerInfo::is_derived);
            let build = self.paths.build(&name);
            let overlay_mounted = self
                .topology
                .mount(&build)
                .is_some_and(|m| m.overlay.is_some());
            if derived && overlay_mounted {
                self.execute(Action::Remount { target: build })?;
            } else {
                tracing::debug!(layer = %name, "No overlay to shake");
            }
        }
        self.settle()
    }

    fn mount_one(&mut self, name: &str) -> LayerResult<()> {
        let state = self.state_of(name)?;
        match state {
            LayerState::Mounted => {
                tracing::debug!(layer = name, "Already mounted");
                return Ok(());
            }
            LayerState::Error | LayerState::Empty => {
                return Err(not_mountable(name, state));
            }
            _ if state < LayerState::Mountable => {
                self.makedirs_one(name)?;
                self.settle()?;
            }
            _ => {}
        }

        let layer = self.registry.require(name)?.clone();
        if layer.state == LayerState::Mounted {
            return Ok(());
        }
        let ready = matches!(layer.state, LayerState::Mountable | LayerState::PartialMount)
            || (self.pretend && layer.state >= LayerState::Incomplete);
        if !ready {
            return Err(not_mountable(name, layer.state));
        }

        if let Some(base) = &layer.base {
            let build = self.paths.build(name);
            if self.topology.mount(&build).is_none() {
                self.execute(Action::MountOverlay {
                    overlay: OverlayMount::for_layer(&self.paths, name, base),
                })?;
                if !self.pretend {
                    self.refresh()?;
                    self.makedirs_one(name)?;
                }
            }
        }

        for required in required_mounts(&self.paths, &self.needed_mounts, &layer) {
            if self.topology.mount(&required.target).is_some() {
                continue;
            }
            let action = match required.source {
                MountSource::Alias(source) => Action::BindMount {
                    source,
                    target: required.target,
                    recursive: true,
                },
                MountSource::Typed { fstype, source } => Action::Mount {
                    fstype,
                    source,
                    target: required.target,
                },
            };
            self.execute(action)?;
        }

        if self.pretend {
            if let Some(layer) = self.registry.get_mut(name) {
                layer.state = LayerState::Mounted;
            }
        } else {
            self.refresh()?;
            let layer = self.registry.require(name)?;
            if layer.state != LayerState::Mounted {
                tracing::warn!(
                    layer = name,
                    state = %layer.state,
                    messages = ?layer.messages,
                    "Layer is not fully mounted"
                );
            }
        }
        tracing::info!(layer = name, "Mounted layer");
        Ok(())
    }

    fn unmount_one(&mut self, name: &str, force: bool) -> LayerResult<()> {
        let layer = self.registry.require(name)?;
        if layer.busy && !force {
            return Err(LayerError::LayerBusy {
                name: name.to_string(),
            });
        }
        for dependent in self.registry.dependents(name) {
            if self
                .registry
                .get(&dependent)
                .is_some_and(LayerInfo::is_mounted)
            {
                return Err(LayerError::HasMountedDependent {
                    name: name.to_string(),
                    dependent,
                });
            }
        }

        // Host-side exports first, then the deepest mounts under the build
        // directory.
        let mut targets: Vec<PathBuf> = layer
            .export_mounts
            .iter()
            .map(|m| m.mountpoint.clone())
            .collect();
        targets.extend(layer.mounts.iter().rev().map(|m| m.mountpoint.clone()));
        if targets.is_empty() {
            tracing::debug!(layer = name, "Not mounted");
            return Ok(());
        }

        let flags = if force {
            UnmountFlags::forced()
        } else {
            UnmountFlags::default()
        };
        for target in targets {
            self.execute(Action::Unmount { target, flags })?;
        }

        if self.pretend {
            if let Some(layer) = self.registry.get_mut(name) {
                layer.mounts.clear();
                layer.export_mounts.clear();
                layer.state = if layer.is_derived() {
                    LayerState::Complete
                } else {
                    LayerState::Mountable
                };
            }
        } else {
            self.refresh()?;
        }
        tracing::info!(layer = name, force, "Unmounted layer");
        Ok(())
    }

    fn makedirs_one(&mut self, name: &str) -> LayerResult<()> {
        let layer = self.registry.require(name)?;
        if !layer.defined {
            return Err(LayerError::UnknownLayer {
                name: name.to_string(),
            });
        }
        self.registry.ancestors(name)?;
        let layer = layer.clone();

        let build = self.paths.build(name);
        let mut actions = Vec::new();

        let mut dirs = vec![build.clone()];
        if layer.is_derived() {
            dirs.push(self.paths.upper(name));
            dirs.push(self.paths.work(name));
        }
        for path in dirs {
            if !path.exists() {
                actions.push(Action::CreateDir { path });
            }
        }

        if let Some(link) = self.paths.export_link(name) {
            if fs::symlink_metadata(&link).is_err() {
                if let Some(parent) = link.parent().filter(|p| !p.exists()) {
                    actions.push(Action::CreateDir {
                        path: parent.to_path_buf(),
                    });
                }
                actions.push(Action::Symlink {
                    target: build.clone(),
                    link,
                });
            }
        }

        // Mountpoints inside the layer only make sense once its root is
        // populated and, for a derived layer, its overlay is mounted.
        let live = !layer.is_derived()
            || self
                .topology
                .mount(&build)
                .is_some_and(|m| m.overlay.is_some());
        let inhabited = self
            .config
            .system_dirs
            .iter()
            .all(|dir| build.join(dir).is_dir());
        for required in required_mounts(&self.paths, &self.needed_mounts, &layer) {
            let inside = required.target.starts_with(&build);
            if required.target.exists() || (inside && !(live && inhabited)) {
                continue;
            }
            match &required.source {
                MountSource::Alias(source) if source.is_file() => {
                    actions.push(Action::WriteFile {
                        path: required.target,
                        contents: String::new(),
                    });
                }
                _ => actions.push(Action::CreateDir {
                    path: required.target,
                }),
            }
        }

        if actions.is_empty() {
            tracing::debug!(layer = name, "Directories complete");
        }
        for action in actions {
            self.execute(action)?;
        }
        Ok(())
    }

    fn rewrite_definition_base(&mut self, name: &str, base: Option<&str>) -> LayerResult<()> {
        let path = self.paths.definition(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LayerError::os("read definition", path, e)),
        };
        if let Some(contents) = replace_base(&text, base) {
            if let Some(layer) = self.registry.get_mut(name) {
                layer.definition.base = base.map(str::to_string);
            }
            self.execute(Action::WriteFile { path, contents })?;
        }
        Ok(())
    }

    fn save(&mut self) -> LayerResult<()> {
        self.execute(Action::WriteFile {
            path: self.paths.layers_file(),
            contents: self.registry.render(),
        })
    }

    fn execute(&mut self, action: Action) -> LayerResult<()> {
        if self.pretend {
            tracing::debug!(%action, "Pretending");
        } else {
            tracing::debug!(%action, "Performing");
            self.ops.perform(&action)?;
        }
        self.journal.push(action);
        Ok(())
    }

    fn settle(&mut self) -> LayerResult<()> {
        if self.pretend {
            Ok(())
        } else {
            self.refresh()
        }
    }

    fn state_of(&self, name: &str) -> LayerResult<LayerState> {
        Ok(self.registry.require(name)?.state)
    }

    fn defined_names(&self) -> Vec<String> {
        self.registry
            .iter_ordered()
            .filter(|layer| layer.defined)
            .map(|layer| layer.name.clone())
            .collect()
    }
}

fn not_mountable(name: &str, state: LayerState) -> LayerError {
    LayerError::NotYetMountable {
        name: name.to_string(),
        state: state.to_string(),
    }
}
