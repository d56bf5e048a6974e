//! The layer registry.
//!
//! Holds every known layer keyed by name plus an ordering in which each
//! base precedes its derived layers. The ordering is rebuilt after every
//! mutation. Broken base chains are recorded on the affected layers rather
//! than rejected, so a damaged registry can still be inspected and fixed.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use layercake_common::{LayerError, LayerName, LayerPaths, LayerResult, PathResolver};

use crate::layer::definition::{LayerDefinition, ParseMode};
use crate::layer::info::{BaseError, LayerInfo};

/// All known layers.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: BTreeMap<String, LayerInfo>,
    order: Vec<String>,
}

impl LayerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `(name, base)` pairs, as read from a layers file.
    ///
    /// Names are taken as given; use [`Self::add_layer`] for validated input.
    #[must_use]
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        let mut registry = Self::new();
        for (name, base) in entries {
            registry
                .layers
                .insert(name.clone(), LayerInfo::new(name, base));
        }
        registry.reorder();
        registry
    }

    /// Load the layers file, discover undefined layers on disk and read
    /// every definition file.
    ///
    /// # Errors
    ///
    /// Malformed layers file lines, unreadable directories, and definition
    /// errors in [`ParseMode::Strict`].
    pub fn load(paths: &LayerPaths, resolver: &PathResolver, mode: ParseMode) -> LayerResult<Self> {
        let layers_file = paths.layers_file();
        let entries = match fs::read_to_string(&layers_file) {
            Ok(text) => parse_layers_file(&text, &layers_file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(LayerError::os("read", layers_file, e)),
        };
        let mut registry = Self::from_entries(entries);

        for dir in [paths.build_root(), paths.upper_root(), paths.work_root()] {
            for name in discover(&dir)? {
                if !registry.layers.contains_key(&name) {
                    tracing::debug!(layer = %name, dir = %dir.display(), "Discovered undefined layer");
                    registry
                        .layers
                        .insert(name.clone(), LayerInfo::discovered(name));
                }
            }
        }

        for layer in registry.layers.values_mut() {
            let definition = LayerDefinition::load(&paths.definition(&layer.name), resolver, mode)?;
            if layer.defined && definition.base.is_some() && definition.base != layer.base {
                layer.definition.messages.push(format!(
                    "definition declares base {}, registry has {}",
                    definition.base.as_deref().unwrap_or("-"),
                    layer.base.as_deref().unwrap_or("none")
                ));
            }
            let mut messages = std::mem::take(&mut layer.definition.messages);
            layer.definition = definition;
            layer.definition.messages.append(&mut messages);
        }

        registry.reorder();
        tracing::debug!(layers = registry.layers.len(), "Loaded layer registry");
        Ok(registry)
    }

    /// Render the layers file: defined layers in topological order.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for layer in self.iter_ordered().filter(|l| l.defined) {
            match &layer.base {
                Some(base) => out.push_str(&format!("{} {base}\n", layer.name)),
                None => out.push_str(&format!("{}\n", layer.name)),
            }
        }
        out
    }

    /// Look up a layer.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LayerInfo> {
        self.layers.get(name)
    }

    /// Look up a layer mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut LayerInfo> {
        self.layers.get_mut(name)
    }

    /// Look up a layer that must exist.
    ///
    /// # Errors
    ///
    /// [`LayerError::UnknownLayer`] if it does not.
    pub fn require(&self, name: &str) -> LayerResult<&LayerInfo> {
        self.layers.get(name).ok_or_else(|| LayerError::UnknownLayer {
            name: name.to_string(),
        })
    }

    /// Whether a layer exists (defined or discovered).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names, bases first.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Layers, bases first.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &LayerInfo> {
        self.order.iter().filter_map(|name| self.layers.get(name))
    }

    /// Layers declaring `name` as their base.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.layers
            .values()
            .filter(|l| l.base.as_deref() == Some(name))
            .map(|l| l.name.clone())
            .collect()
    }

    /// The base chain of `name`, root first and `name` last.
    ///
    /// # Errors
    ///
    /// [`LayerError::UnknownLayer`], or the chain's [`BaseError`] as
    /// [`LayerError::BaseCycle`] / [`LayerError::UnknownBase`].
    pub fn ancestors(&self, name: &str) -> LayerResult<Vec<String>> {
        let layer = self.require(name)?;
        match &layer.base_error {
            Some(BaseError::Cycle { chain }) => {
                return Err(LayerError::BaseCycle {
                    chain: chain.clone(),
                });
            }
            Some(BaseError::Missing { missing, .. }) => {
                return Err(LayerError::UnknownBase {
                    name: name.to_string(),
                    base: missing.clone(),
                });
            }
            None => {}
        }

        let mut chain = vec![name.to_string()];
        let mut current = layer;
        while let Some(base) = &current.base {
            chain.push(base.clone());
            current = self.require(base)?;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Define a layer.
    ///
    /// A layer that was only discovered on disk may be defined; its
    /// directories are kept.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidName`], [`LayerError::DuplicateName`],
    /// [`LayerError::UnknownBase`], or [`LayerError::BaseCycle`] (in which
    /// case nothing changes).
    pub fn add_layer(&mut self, name: &str, base: Option<&str>) -> LayerResult<()> {
        LayerName::new(name)?;
        if self.layers.get(name).is_some_and(|l| l.defined) {
            return Err(LayerError::DuplicateName {
                name: name.to_string(),
            });
        }
        if let Some(base) = base {
            if !self.layers.contains_key(base) {
                return Err(LayerError::UnknownBase {
                    name: name.to_string(),
                    base: base.to_string(),
                });
            }
        }

        let mut layer = LayerInfo::new(name, base.map(str::to_string));
        if let Some(existing) = self.layers.get(name) {
            layer.definition = existing.definition.clone();
        }
        let previous = self.layers.insert(name.to_string(), layer);
        self.reorder();

        let cycle = self.layers.get(name).and_then(|l| l.base_error.clone());
        if let Some(BaseError::Cycle { chain }) = cycle {
            match previous {
                Some(previous) => self.layers.insert(name.to_string(), previous),
                None => self.layers.remove(name),
            };
            self.reorder();
            return Err(LayerError::BaseCycle { chain });
        }

        tracing::info!(layer = name, base = ?base, "Defined layer");
        Ok(())
    }

    /// Forget a layer.
    ///
    /// # Errors
    ///
    /// [`LayerError::LayerBusy`], [`LayerError::LayerMounted`] or
    /// [`LayerError::HasDependents`].
    pub fn remove_layer(&mut self, name: &str) -> LayerResult<LayerInfo> {
        let layer = self.require(name)?;
        if layer.busy {
            return Err(LayerError::LayerBusy {
                name: name.to_string(),
            });
        }
        if layer.is_mounted() {
            return Err(LayerError::LayerMounted {
                name: name.to_string(),
            });
        }
        let dependents = self.dependents(name);
        if !dependents.is_empty() {
            return Err(LayerError::HasDependents {
                name: name.to_string(),
                dependents,
            });
        }

        let removed = self
            .layers
            .remove(name)
            .ok_or_else(|| LayerError::UnknownLayer {
                name: name.to_string(),
            })?;
        self.reorder();
        tracing::info!(layer = name, "Removed layer");
        Ok(removed)
    }

    /// Check whether [`Self::rename_layer`] would succeed.
    ///
    /// # Errors
    ///
    /// See [`Self::rename_layer`].
    pub fn validate_rename(&self, old: &str, new: &str) -> LayerResult<()> {
        LayerName::new(new)?;
        let layer = self.require(old)?;
        if self.layers.contains_key(new) {
            return Err(LayerError::DuplicateName {
                name: new.to_string(),
            });
        }
        if layer.busy {
            return Err(LayerError::LayerBusy {
                name: old.to_string(),
            });
        }
        if layer.is_mounted() {
            return Err(LayerError::LayerMounted {
                name: old.to_string(),
            });
        }
        // A mounted dependent's overlay names the old build directory.
        for dependent in self.dependents(old) {
            let dependent = &self.layers[&dependent];
            if dependent.busy {
                return Err(LayerError::LayerBusy {
                    name: dependent.name.clone(),
                });
            }
            if dependent.is_mounted() {
                return Err(LayerError::LayerMounted {
                    name: dependent.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Rename a layer and repoint its dependents.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidName`], [`LayerError::UnknownLayer`],
    /// [`LayerError::DuplicateName`], or [`LayerError::LayerBusy`] /
    /// [`LayerError::LayerMounted`] for the layer or one of its dependents.
    pub fn rename_layer(&mut self, old: &str, new: &str) -> LayerResult<()> {
        self.validate_rename(old, new)?;

        let mut layer = self
            .layers
            .remove(old)
            .ok_or_else(|| LayerError::UnknownLayer {
                name: old.to_string(),
            })?;
        layer.name = new.to_string();
        self.layers.insert(new.to_string(), layer);
        for dependent in self.layers.values_mut() {
            if dependent.base.as_deref() == Some(old) {
                dependent.base = Some(new.to_string());
            }
        }
        self.reorder();
        tracing::info!(old, new, "Renamed layer");
        Ok(())
    }

    /// Change (or clear) the base of a layer.
    ///
    /// # Errors
    ///
    /// [`LayerError::LayerMounted`] and [`LayerError::UnknownBase`] leave the
    /// registry untouched. [`LayerError::BaseCycle`] is returned after the
    /// change has been applied; the layers involved are flagged.
    pub fn rebase_layer(&mut self, name: &str, base: Option<&str>) -> LayerResult<()> {
        let layer = self.require(name)?;
        if layer.is_mounted() {
            return Err(LayerError::LayerMounted {
                name: name.to_string(),
            });
        }
        if let Some(base) = base {
            if !self.layers.contains_key(base) {
                return Err(LayerError::UnknownBase {
                    name: name.to_string(),
                    base: base.to_string(),
                });
            }
        }

        if let Some(layer) = self.layers.get_mut(name) {
            layer.base = base.map(str::to_string);
        }
        self.reorder();

        if let Some(BaseError::Cycle { chain }) = self.layers.get(name).and_then(|l| l.base_error.clone()) {
            return Err(LayerError::BaseCycle { chain });
        }
        tracing::info!(layer = name, base = ?base, "Rebased layer");
        Ok(())
    }

    /// Recompute the topological order and every layer's base error.
    ///
    /// Repeatedly places any unplaced layer whose base is absent or already
    /// placed. Whatever cannot be placed has a missing or cyclic base; those
    /// layers are flagged and appended in name order.
    fn reorder(&mut self) {
        let mut order = Vec::with_capacity(self.layers.len());
        let mut placed: HashSet<&str> = HashSet::with_capacity(self.layers.len());

        loop {
            let mut progress = false;
            for layer in self.layers.values() {
                if placed.contains(layer.name.as_str()) {
                    continue;
                }
                let ready = layer
                    .base
                    .as_deref()
                    .is_none_or(|base| placed.contains(base));
                if ready {
                    placed.insert(layer.name.as_str());
                    order.push(layer.name.clone());
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        let stuck: Vec<String> = self
            .layers
            .keys()
            .filter(|name| !placed.contains(name.as_str()))
            .cloned()
            .collect();

        let errors: Vec<(String, BaseError)> = stuck
            .iter()
            .map(|name| (name.clone(), self.walk_base_chain(name)))
            .collect();

        for layer in self.layers.values_mut() {
            layer.base_error = None;
        }
        for (name, error) in errors {
            tracing::debug!(layer = %name, %error, "Broken base chain");
            if let Some(layer) = self.layers.get_mut(&name) {
                layer.base_error = Some(error);
            }
        }

        order.extend(stuck);
        self.order = order;
    }

    /// Follow `base` pointers from `name` until a repeat or a dead end.
    fn walk_base_chain(&self, name: &str) -> BaseError {
        let mut seen: Vec<&str> = vec![name];
        let mut current = name;
        loop {
            let Some(base) = self.layers.get(current).and_then(|l| l.base.as_deref()) else {
                return BaseError::Missing {
                    chain: seen.join(" → "),
                    missing: current.to_string(),
                };
            };
            let repeat = seen.contains(&base);
            seen.push(base);
            if repeat {
                return BaseError::Cycle {
                    chain: seen.join(" → "),
                };
            }
            if !self.layers.contains_key(base) {
                return BaseError::Missing {
                    chain: seen.join(" → "),
                    missing: base.to_string(),
                };
            }
            current = base;
        }
    }
}

/// Parse the two-column layers file.
///
/// # Errors
///
/// [`LayerError::Registry`] for lines with more than two columns, invalid
/// names or duplicates.
pub fn parse_layers_file(text: &str, path: &Path) -> LayerResult<Vec<(String, Option<String>)>> {
    let mut entries: Vec<(String, Option<String>)> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let error = |message: String| LayerError::Registry {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let (name, base) = match words[..] {
            [name] => (name, None),
            [name, base] => (name, Some(base)),
            _ => return Err(error(format!("expected `name [base]`, got {line:?}"))),
        };
        for candidate in std::iter::once(name).chain(base) {
            if !LayerName::is_valid(candidate) {
                return Err(error(format!("invalid layer name {candidate:?}")));
            }
        }
        if entries.iter().any(|(existing, _)| existing == name) {
            return Err(error(format!("layer {name} listed twice")));
        }
        entries.push((name.to_string(), base.map(str::to_string)));
    }
    Ok(entries)
}

/// Names of the valid layer directories directly below `dir`.
fn discover(dir: &Path) -> LayerResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LayerError::os("read directory", dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if LayerName::is_valid(name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
