//! Performing actions on the real host.

use std::fs;
use std::io::Write;
use std::path::Path;

use layercake_common::{LayerError, LayerResult};

use crate::filesystem::{self, enter};
use crate::lifecycle::action::{Action, SystemOps};

/// Carries out actions with real syscalls and processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostOps;

impl SystemOps for HostOps {
    fn perform(&mut self, action: &Action) -> LayerResult<()> {
        match action {
            Action::CreateDir { path } => {
                fs::create_dir_all(path).map_err(|e| LayerError::os("create directory", path, e))
            }
            Action::Symlink { target, link } => std::os::unix::fs::symlink(target, link)
                .map_err(|e| LayerError::os("create symlink", link, e)),
            Action::RemoveSymlink { link } => {
                fs::remove_file(link).map_err(|e| LayerError::os("remove symlink", link, e))
            }
            Action::Rename { from, to } => {
                fs::rename(from, to).map_err(|e| LayerError::os("rename", from, e))
            }
            Action::WriteFile { path, contents } => write_atomically(path, contents),
            Action::MountOverlay { overlay } => overlay.mount(),
            Action::BindMount {
                source,
                target,
                recursive,
            } => filesystem::bind_mount(source, target, *recursive),
            Action::Mount {
                fstype,
                source,
                target,
            } => filesystem::mount(fstype, source, target, None),
            Action::Unmount { target, flags } => filesystem::unmount(target, *flags),
            Action::Remount { target } => filesystem::remount(target),
            Action::Chroot {
                layer,
                root,
                command,
                shell,
            } => {
                enter::run(enter::chroot_command(layer, root, command, shell), root)?;
                Ok(())
            }
            Action::Shell { layer, dir, shell } => {
                enter::run(enter::shell_command(layer, dir, shell), dir)?;
                Ok(())
            }
        }
    }
}

/// Write through a temporary file in the same directory, then rename.
fn write_atomically(path: &Path, contents: &str) -> LayerResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| LayerError::os("create directory", dir, e))?;

    let mut file =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| LayerError::os("create", dir, e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| LayerError::os("write", file.path().to_path_buf(), e))?;
    file.persist(path)
        .map_err(|e| LayerError::os("replace", path, e.error))?;
    tracing::debug!(path = %path.display(), bytes = contents.len(), "Wrote file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn performs_filesystem_actions() {
        let dir = tempfile::tempdir().unwrap();
        let mut ops = HostOps;
        let build = dir.path().join("build/a");
        let link = dir.path().join("export/a");

        for action in [
            Action::CreateDir { path: build.clone() },
            Action::CreateDir {
                path: dir.path().join("export"),
            },
            Action::Symlink {
                target: build.clone(),
                link: link.clone(),
            },
            Action::WriteFile {
                path: dir.path().join("layers.conf"),
                contents: "a\n".to_string(),
            },
        ] {
            ops.perform(&action).unwrap();
        }

        assert!(build.is_dir());
        assert_eq!(fs::read_link(&link).unwrap(), build);
        assert_eq!(
            fs::read_to_string(dir.path().join("layers.conf")).unwrap(),
            "a\n"
        );

        ops.perform(&Action::Rename {
            from: build,
            to: dir.path().join("build/b"),
        })
        .unwrap();
        ops.perform(&Action::RemoveSymlink { link: link.clone() })
            .unwrap();
        assert!(dir.path().join("build/b").is_dir());
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn errors_name_the_path() {
        let err = HostOps
            .perform(&Action::RemoveSymlink {
                link: PathBuf::from("/nonexistent/layercake/link"),
            })
            .unwrap_err();
        assert!(err.to_string().starts_with("remove symlink /nonexistent/layercake/link"));
    }
}
