//! Common error types for layercake.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LayerError`].
pub type LayerResult<T> = Result<T, LayerError>;

/// Errors raised while inspecting or changing the layer tree.
#[derive(Error, Diagnostic, Debug)]
pub enum LayerError {
    /// A mount table record could not be parsed.
    #[error("Malformed mount table line {line}: {reason}")]
    #[diagnostic(code(layercake::mountinfo::malformed))]
    MalformedMountLine {
        /// 1-based line number in the mount table.
        line: usize,
        /// What was wrong with the record.
        reason: String,
    },

    /// Layer name fails the legality test.
    #[error("Invalid layer name: {name:?}")]
    #[diagnostic(
        code(layercake::layer::invalid_name),
        help("Layer names use letters, digits, underscores and non-leading hyphens")
    )]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A layer with this name is already defined.
    #[error("Layer already defined: {name}")]
    #[diagnostic(code(layercake::layer::duplicate))]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// No layer with this name is known.
    #[error("Layer not found: {name}")]
    #[diagnostic(code(layercake::layer::not_found))]
    UnknownLayer {
        /// The missing layer.
        name: String,
    },

    /// The requested base layer is not known.
    #[error("Base layer {base} of {name} does not exist")]
    #[diagnostic(code(layercake::layer::unknown_base))]
    UnknownBase {
        /// The layer being defined or rebased.
        name: String,
        /// The missing base.
        base: String,
    },

    /// The base chain loops back on itself.
    #[error("Base-layer cycle: {chain}")]
    #[diagnostic(
        code(layercake::layer::base_cycle),
        help("Rebase or remove one of the layers in the chain")
    )]
    BaseCycle {
        /// Human readable chain, e.g. `a → b → a`.
        chain: String,
    },

    /// A process holds the layer open.
    #[error("Layer {name} is in use by a process")]
    #[diagnostic(
        code(layercake::layer::busy),
        help("Leave any shell or chroot in the layer, or pass --force to unmount anyway")
    )]
    LayerBusy {
        /// The busy layer.
        name: String,
    },

    /// The layer still has live mounts.
    #[error("Layer {name} is mounted")]
    #[diagnostic(code(layercake::layer::mounted), help("Unmount the layer first"))]
    LayerMounted {
        /// The mounted layer.
        name: String,
    },

    /// Other layers use this one as their base.
    #[error("Layer {name} is the base of {}", .dependents.join(", "))]
    #[diagnostic(code(layercake::layer::has_dependents))]
    HasDependents {
        /// The layer that was to be changed.
        name: String,
        /// Layers declaring it as base.
        dependents: Vec<String>,
    },

    /// A derived layer built on this one is still mounted.
    #[error("Layer {name} cannot be unmounted while {dependent} is mounted on it")]
    #[diagnostic(code(layercake::layer::mounted_dependent))]
    HasMountedDependent {
        /// The layer that was to be unmounted.
        name: String,
        /// The mounted derived layer.
        dependent: String,
    },

    /// The layer is below `mountable` after directory preparation.
    #[error("Layer {name} is not mountable (state: {state})")]
    #[diagnostic(
        code(layercake::layer::not_mountable),
        help("Run `layercake status {name}` to see what is missing")
    )]
    NotYetMountable {
        /// The layer.
        name: String,
        /// Its state at the time of the attempt.
        state: String,
    },

    /// A layer definition file is malformed (hard-fail mode).
    #[error("{}:{line}: {message}", .path.display())]
    #[diagnostic(code(layercake::definition))]
    Definition {
        /// Definition file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// The registry file is malformed.
    #[error("{}:{line}: {message}", .path.display())]
    #[diagnostic(code(layercake::registry))]
    Registry {
        /// Registry file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// An operating system call failed.
    #[error("{operation} {}: {source}", .path.display())]
    #[diagnostic(code(layercake::os))]
    Os {
        /// What was attempted (e.g. `mount`, `mkdir`).
        operation: &'static str,
        /// The path it was attempted on.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(layercake::io))]
    Io(#[from] std::io::Error),

    /// Another invocation holds the base path lock.
    #[error("Base path is locked by another layercake process: {}", .path.display())]
    #[diagnostic(code(layercake::locked))]
    Locked {
        /// Lock file.
        path: PathBuf,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(layercake::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(layercake::unsupported), help("layercake requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },
}

impl LayerError {
    /// Wrap an OS error with the operation and path that failed.
    pub fn os(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Os {
            operation,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = LayerError::UnknownLayer {
            name: "base1".to_string(),
        };
        assert_eq!(err.to_string(), "Layer not found: base1");
    }

    #[test]
    fn dependents_are_listed() {
        let err = LayerError::HasDependents {
            name: "base1".to_string(),
            dependents: vec!["der1".to_string(), "der2".to_string()],
        };
        assert_eq!(err.to_string(), "Layer base1 is the base of der1, der2");
    }

    #[test]
    fn os_error_names_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = LayerError::os("mount", "/var/lib/layercake/build/a", io_err);
        assert_eq!(
            err.to_string(),
            "mount /var/lib/layercake/build/a: denied"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LayerError = io_err.into();
        assert!(matches!(err, LayerError::Io(_)));
    }
}
