//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use tabled::{Table, Tabled};

use crate::config::Config;
use crate::filesystem::{BaseLock, ProcScanner};
use crate::layer::LayerInfo;
use crate::lifecycle::{HostOps, LayerLifecycle};
use crate::topology::ProcMountTable;

/// Layercake - overlayfs build environment manager
#[derive(Parser)]
#[command(name = "layercake")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Base path holding layers (overrides the config file)
    #[arg(long = "base", global = true, env = "LAYERCAKE_BASE", value_name = "PATH")]
    pub base_path: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print what would be done without doing it
    #[arg(short = 'n', long, global = true)]
    pub pretend: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Layer commands.
#[derive(Subcommand)]
pub enum Commands {
    /// List layers with their state
    List,

    /// Show every diagnostic and live mount of a layer
    Status {
        /// Layer name
        name: String,
    },

    /// Define a new layer
    Add {
        /// Layer name
        name: String,

        /// Base layer (omit for a base layer)
        base: Option<String>,
    },

    /// Forget a layer (its directories are kept)
    Remove {
        /// Layer name
        name: String,
    },

    /// Rename a layer and everything that refers to it
    Rename {
        /// Current name
        old: String,

        /// New name
        new: String,
    },

    /// Change a layer's base
    Rebase {
        /// Layer name
        name: String,

        /// New base layer (omit to make it a base layer)
        base: Option<String>,
    },

    /// Create missing layer directories and mountpoints
    Makedirs {
        /// Layer name (default: all layers)
        name: Option<String>,
    },

    /// Mount a layer and its bases
    Mount {
        /// Layer name (default: all layers)
        name: Option<String>,
    },

    /// Unmount a layer
    Umount {
        /// Layer name (default: all mounted layers)
        name: Option<String>,

        /// Unmount even if processes are using the layer
        #[arg(short, long)]
        force: bool,
    },

    /// Run a command chrooted into a layer, mounting it first
    Chroot {
        /// Layer name
        name: String,

        /// Command and arguments (default: the configured shell)
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Open a shell in a layer's build directory
    Shell {
        /// Layer name
        name: String,
    },

    /// Remount overlays so they see changes in their lower layers
    Shake {
        /// Layer name (default: all layers)
        name: Option<String>,
    },
}

impl Commands {
    /// Whether the command changes the layer tree or the mount table.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        !matches!(self, Self::List | Self::Status { .. } | Self::Shell { .. })
    }
}

#[derive(Tabled)]
struct LayerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "BASE")]
    base: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "FLAGS")]
    flags: String,
    #[tabled(rename = "MESSAGE")]
    message: String,
}

impl From<&LayerInfo> for LayerRow {
    fn from(layer: &LayerInfo) -> Self {
        let mut flags = Vec::new();
        if !layer.defined {
            flags.push("undefined");
        }
        if layer.busy {
            flags.push("busy");
        }
        if layer.chroot {
            flags.push("chroot");
        }
        if layer.has_base_error() {
            flags.push("base-error");
        }
        Self {
            name: layer.name.clone(),
            base: layer.base.clone().unwrap_or_else(|| "-".to_string()),
            state: layer.state.to_string(),
            flags: if flags.is_empty() {
                "-".to_string()
            } else {
                flags.join(",")
            },
            message: layer.messages.first().cloned().unwrap_or_default(),
        }
    }
}

impl Cli {
    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let mut config = Config::discover(self.config.as_deref())?;
        if let Some(base_path) = self.base_path {
            config = config.with_base_path(base_path);
        }

        let _lock = if self.command.is_mutating() && !self.pretend {
            Some(BaseLock::acquire(&config.paths().lock_file())?)
        } else {
            None
        };

        let mut lifecycle = LayerLifecycle::new(
            config,
            Box::new(ProcMountTable::new()),
            Box::new(HostOps),
        )
        .with_pretend(self.pretend)
        .with_scanner(ProcScanner::new())
        .load()?;

        match self.command {
            Commands::List => {
                let rows: Vec<LayerRow> = lifecycle
                    .registry()
                    .iter_ordered()
                    .map(LayerRow::from)
                    .collect();
                if rows.is_empty() {
                    println!("No layers defined");
                } else {
                    println!("{}", Table::new(rows));
                }
            }

            Commands::Status { name } => {
                let layer = lifecycle.registry().require(&name)?;
                println!("{}: {}", layer.name, layer.state);
                if let Some(base) = &layer.base {
                    println!("  base: {base}");
                }
                if !layer.defined {
                    println!("  not defined in {}", lifecycle.paths().layers_file().display());
                }
                for message in &layer.messages {
                    println!("  - {message}");
                }
                for mount in layer.mounts.iter().chain(&layer.export_mounts) {
                    println!(
                        "  mount {} ({} {})",
                        mount.mountpoint.display(),
                        mount.fstype,
                        mount.source
                    );
                }
            }

            Commands::Add { name, base } => {
                lifecycle.define(&name, base.as_deref())?;
                println!("Layer {name} added");
            }

            Commands::Remove { name } => {
                lifecycle.undefine(&name)?;
                println!("Layer {name} removed");
            }

            Commands::Rename { old, new } => {
                lifecycle.rename(&old, &new)?;
                println!("Layer {old} renamed to {new}");
            }

            Commands::Rebase { name, base } => {
                lifecycle.rebase(&name, base.as_deref())?;
                match base {
                    Some(base) => println!("Layer {name} now based on {base}"),
                    None => println!("Layer {name} is now a base layer"),
                }
            }

            Commands::Makedirs { name } => lifecycle.makedirs(name.as_deref())?,

            Commands::Mount { name } => lifecycle.mount(name.as_deref())?,

            Commands::Umount { name, force } => lifecycle.unmount(name.as_deref(), force)?,

            Commands::Chroot { name, command } => lifecycle.chroot(&name, &command)?,

            Commands::Shell { name } => lifecycle.shell(&name)?,

            Commands::Shake { name } => lifecycle.shake(name.as_deref())?,
        }

        if lifecycle.is_pretend() {
            for action in lifecycle.take_journal() {
                println!("would: {action}");
            }
        }
        Ok(())
    }
}
