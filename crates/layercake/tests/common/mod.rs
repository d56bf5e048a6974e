//! Shared fixtures: a simulated mount table and a `SystemOps` that edits it.

#![allow(dead_code)]

use std::cell::RefCell;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use layercake::config::Config;
use layercake::lifecycle::{Action, HostOps, LayerLifecycle, SystemOps};
use layercake::topology::MountTableSource;
use layercake_common::{LayerError, LayerResult};

/// One simulated mount table line.
#[derive(Debug, Clone)]
pub struct FakeMount {
    pub id: u32,
    pub device: String,
    pub root: PathBuf,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub source: String,
    pub super_options: String,
}

/// Mount table shared between the lifecycle (reader) and [`FakeOps`].
#[derive(Debug, Default)]
pub struct FakeTable {
    pub mounts: Vec<FakeMount>,
    next_id: u32,
    next_device: u32,
}

impl FakeTable {
    /// A host with `/`, `/dev`, `/proc` and `/sys`.
    pub fn host() -> Rc<RefCell<Self>> {
        let mut table = Self {
            next_id: 20,
            next_device: 40,
            ..Self::default()
        };
        table.push("8:1", "/", Path::new("/"), "ext4", "/dev/sda1", "rw");
        table.push("0:5", "/", Path::new("/dev"), "devtmpfs", "udev", "rw");
        table.push("0:20", "/", Path::new("/proc"), "proc", "proc", "rw");
        table.push("0:21", "/", Path::new("/sys"), "sysfs", "sysfs", "rw");
        Rc::new(RefCell::new(table))
    }

    pub fn push(
        &mut self,
        device: &str,
        root: &str,
        mountpoint: &Path,
        fstype: &str,
        source: &str,
        super_options: &str,
    ) {
        self.next_id += 1;
        self.mounts.push(FakeMount {
            id: self.next_id,
            device: device.to_string(),
            root: PathBuf::from(root),
            mountpoint: mountpoint.to_path_buf(),
            fstype: fstype.to_string(),
            source: source.to_string(),
            super_options: super_options.to_string(),
        });
    }

    fn new_device(&mut self) -> String {
        self.next_device += 1;
        format!("0:{}", self.next_device)
    }

    /// Remove the topmost mount at `mountpoint`.
    pub fn remove(&mut self, mountpoint: &Path) -> bool {
        match self.mounts.iter().rposition(|m| m.mountpoint == mountpoint) {
            Some(idx) => {
                self.mounts.remove(idx);
                true
            }
            None => false,
        }
    }

    /// The mount holding `path`: longest mountpoint prefix.
    fn containing(&self, path: &Path) -> Option<&FakeMount> {
        self.mounts
            .iter()
            .filter(|m| path.starts_with(&m.mountpoint))
            .max_by_key(|m| m.mountpoint.components().count())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for m in &self.mounts {
            writeln!(
                out,
                "{} 1 {} {} {} rw - {} {} {}",
                m.id,
                m.device,
                m.root.display(),
                m.mountpoint.display(),
                m.fstype,
                m.source,
                m.super_options
            )
            .unwrap();
        }
        out
    }
}

/// Reads the shared [`FakeTable`].
pub struct SharedTable(pub Rc<RefCell<FakeTable>>);

impl MountTableSource for SharedTable {
    fn read_table(&self) -> LayerResult<String> {
        Ok(self.0.borrow().render())
    }
}

/// Performs filesystem actions for real, and mount actions against the
/// shared table.
pub struct FakeOps {
    pub table: Rc<RefCell<FakeTable>>,
    pub entered: Rc<RefCell<Vec<String>>>,
    /// Bind targets that report success but never show up in the table.
    pub lost: Rc<RefCell<Vec<PathBuf>>>,
}

impl SystemOps for FakeOps {
    fn perform(&mut self, action: &Action) -> LayerResult<()> {
        let mut table = self.table.borrow_mut();
        match action {
            Action::MountOverlay { overlay } => {
                let options = format!("rw,{}", overlay.mount_options()?);
                copy_dirs(&overlay.lowerdir, &overlay.target)?;
                let device = table.new_device();
                table.push(&device, "/", &overlay.target, "overlay", "overlay", &options);
            }
            Action::BindMount { target, .. } if self.lost.borrow().contains(target) => {}
            Action::BindMount { source, target, .. } => {
                let Some(holder) = table.containing(source).cloned() else {
                    return Err(einval("bind", source));
                };
                let rest = source.strip_prefix(&holder.mountpoint).unwrap_or(Path::new(""));
                let root = if rest.as_os_str().is_empty() {
                    holder.root.clone()
                } else {
                    holder.root.join(rest)
                };
                table.push(
                    &holder.device,
                    &root.display().to_string(),
                    target,
                    &holder.fstype,
                    &holder.source,
                    &holder.super_options,
                );
            }
            Action::Mount {
                fstype,
                source,
                target,
            } => {
                let device = table.new_device();
                table.push(&device, "/", target, fstype, source, "rw");
            }
            Action::Unmount { target, .. } => {
                if !table.remove(target) {
                    return Err(einval("unmount", target));
                }
            }
            Action::Remount { target } => {
                if !table.mounts.iter().any(|m| &m.mountpoint == target) {
                    return Err(einval("remount", target));
                }
            }
            Action::Chroot { .. } | Action::Shell { .. } => {
                self.entered.borrow_mut().push(action.to_string());
            }
            other => HostOps.perform(other)?,
        }
        Ok(())
    }
}

fn einval(operation: &'static str, path: &Path) -> LayerError {
    LayerError::os(operation, path, std::io::ErrorKind::InvalidInput.into())
}

/// Recreate the directory tree of `from` under `to`.
fn copy_dirs(from: &Path, to: &Path) -> LayerResult<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let target = to.join(entry.file_name());
            fs::create_dir_all(&target)?;
            copy_dirs(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A base path in a temporary directory with a simulated host.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
    pub table: Rc<RefCell<FakeTable>>,
    pub entered: Rc<RefCell<Vec<String>>>,
    pub lost: Rc<RefCell<Vec<PathBuf>>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            table: FakeTable::host(),
            entered: Rc::default(),
            lost: Rc::default(),
        }
    }

    pub fn base(&self) -> PathBuf {
        self.dir.path().join("cake")
    }

    pub fn config(&self) -> Config {
        Config::default()
            .with_base_path(self.base())
            .with_system_dirs(["bin", "etc"])
    }

    pub fn lifecycle(&self) -> LayerLifecycle {
        LayerLifecycle::new(
            self.config(),
            Box::new(SharedTable(Rc::clone(&self.table))),
            Box::new(FakeOps {
                table: Rc::clone(&self.table),
                entered: Rc::clone(&self.entered),
                lost: Rc::clone(&self.lost),
            }),
        )
        .with_in_use(Default::default())
        .load()
        .unwrap()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.base().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.base().join(relative)).unwrap()
    }

    /// Give a layer's build directory the system directories.
    pub fn populate(&self, name: &str) {
        for dir in ["bin", "etc"] {
            fs::create_dir_all(self.base().join("build").join(name).join(dir)).unwrap();
        }
    }

    pub fn mountpoints(&self) -> Vec<PathBuf> {
        self.table
            .borrow()
            .mounts
            .iter()
            .map(|m| m.mountpoint.clone())
            .collect()
    }
}

/// Define base1 and der1, create their directories and populate base1.
pub fn two_layer_sandbox() -> Sandbox {
    let sandbox = Sandbox::new();
    let mut lifecycle = sandbox.lifecycle();
    lifecycle.define("base1", None).unwrap();
    lifecycle.define("der1", Some("base1")).unwrap();
    lifecycle.makedirs(None).unwrap();
    sandbox.populate("base1");
    sandbox
}
