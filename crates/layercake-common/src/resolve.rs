//! Symbolic path prefix resolution.
//!
//! Layer definitions may write host paths relative to the invoking user's
//! home directory (`~`, `~/src`) or to a named symbol configured by the
//! operator (`$src/linux`). Everything else must already be absolute.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{LayerError, LayerResult};

/// Resolves `~` and `$symbol` prefixes to absolute paths.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    home: Option<PathBuf>,
    symbols: BTreeMap<String, PathBuf>,
}

impl PathResolver {
    /// Create a resolver using the current user's home directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            home: dirs::home_dir(),
            symbols: BTreeMap::new(),
        }
    }

    /// Set the home directory explicitly.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Add a named symbol.
    #[must_use]
    pub fn with_symbol(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.symbols.insert(name.into(), path.into());
        self
    }

    /// Add every symbol from a map.
    #[must_use]
    pub fn with_symbols<I, K, V>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PathBuf>,
    {
        self.symbols
            .extend(symbols.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Resolve a path.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Config`] for an unknown symbol, a `~` with no
    /// home directory, or a result that is not absolute.
    pub fn resolve(&self, raw: &str) -> LayerResult<PathBuf> {
        let resolved = if let Some(rest) = raw.strip_prefix('~') {
            let home = self.home.as_ref().ok_or_else(|| LayerError::Config {
                message: format!("cannot expand {raw:?}: no home directory"),
            })?;
            join_rest(home, rest, raw)?
        } else if let Some(rest) = raw.strip_prefix('$') {
            let (symbol, tail) = rest.split_once('/').unwrap_or((rest, ""));
            let base = self.symbols.get(symbol).ok_or_else(|| LayerError::Config {
                message: format!("unknown path symbol ${symbol} in {raw:?}"),
            })?;
            if tail.is_empty() {
                base.clone()
            } else {
                base.join(tail)
            }
        } else {
            PathBuf::from(raw)
        };

        if !resolved.is_absolute() {
            return Err(LayerError::Config {
                message: format!("path {raw:?} does not resolve to an absolute path"),
            });
        }
        Ok(resolved)
    }
}

fn join_rest(base: &Path, rest: &str, raw: &str) -> LayerResult<PathBuf> {
    if rest.is_empty() {
        return Ok(base.to_path_buf());
    }
    // `~user` forms are not supported.
    let Some(tail) = rest.strip_prefix('/') else {
        return Err(LayerError::Config {
            message: format!("cannot expand {raw:?}: only ~ and ~/ are supported"),
        });
    };
    Ok(base.join(tail))
}
