//! Entering a layer: `chroot` into it or open a shell in its build directory.

use std::path::Path;
use std::process::{Command, ExitStatus};

use layercake_common::{LayerError, LayerResult};

/// Environment variable naming the layer a process was started in.
pub const LAYER_ENV: &str = "LAYERCAKE_LAYER";

/// `chroot <root> <command...>`, or the shell when `command` is empty.
#[must_use]
pub fn chroot_command(layer: &str, root: &Path, command: &[String], shell: &Path) -> Command {
    let mut cmd = Command::new("chroot");
    cmd.arg(root);
    if command.is_empty() {
        cmd.arg(shell);
    } else {
        cmd.args(command);
    }
    cmd.env(LAYER_ENV, layer);
    cmd
}

/// The shell, started in `dir` without changing root.
#[must_use]
pub fn shell_command(layer: &str, dir: &Path, shell: &Path) -> Command {
    let mut cmd = Command::new(shell);
    cmd.current_dir(dir).env(LAYER_ENV, layer);
    cmd
}

/// Run `cmd` with inherited stdio and wait for it.
///
/// # Errors
///
/// [`LayerError::Os`] if the program cannot be started.
pub fn run(mut cmd: Command, dir: &Path) -> LayerResult<ExitStatus> {
    tracing::debug!(command = ?cmd, "Entering layer");
    let status = cmd
        .status()
        .map_err(|e| LayerError::os("execute", dir, e))?;
    if !status.success() {
        tracing::warn!(%status, "Command exited unsuccessfully");
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn env_of(cmd: &Command) -> Option<&OsStr> {
        cmd.get_envs()
            .find(|(key, _)| *key == LAYER_ENV)
            .and_then(|(_, value)| value)
    }

    #[test]
    fn chroot_runs_command_in_root() {
        let cmd = chroot_command(
            "der1",
            Path::new("/cake/build/der1"),
            &["make".to_string(), "-j4".to_string()],
            Path::new("/bin/sh"),
        );
        assert_eq!(cmd.get_program(), "chroot");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["/cake/build/der1", "make", "-j4"]);
        assert_eq!(env_of(&cmd), Some(OsStr::new("der1")));
    }

    #[test]
    fn chroot_defaults_to_shell() {
        let cmd = chroot_command("a", Path::new("/r"), &[], Path::new("/bin/bash"));
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["/r", "/bin/bash"]);
    }

    #[test]
    fn shell_keeps_root() {
        let cmd = shell_command("base1", Path::new("/cake/build/base1"), Path::new("/bin/sh"));
        assert_eq!(cmd.get_program(), "/bin/sh");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/cake/build/base1")));
        assert_eq!(env_of(&cmd), Some(OsStr::new("base1")));
    }
}
