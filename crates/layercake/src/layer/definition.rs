//! Per-layer definition files.
//!
//! ```text
//! # debian build root on top of base1
//! base base1
//! import bind ~/src /usr/src
//! import tmpfs tmpfs /tmp
//! export bind /var/cache/apt $cache/apt
//! ```
//!
//! Lines starting with `#` or `//` are comments.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use layercake_common::{LayerError, LayerName, LayerResult, PathResolver};

/// Filesystem type that requests a recursive bind mount.
pub const BIND: &str = "bind";

/// How malformed lines are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Record a message and keep reading.
    #[default]
    Soft,
    /// Fail on the first malformed line.
    Strict,
}

/// Direction of a declared mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Host `source` mounted at `mountpoint` inside the layer.
    Import,
    /// Layer `source` mounted at host `mountpoint`.
    Export,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => f.write_str("import"),
            Self::Export => f.write_str("export"),
        }
    }
}

/// One `import` or `export` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Import or export.
    pub kind: MountKind,
    /// Filesystem type, or `bind`.
    pub fstype: String,
    /// Import: host path or filesystem source. Export: path inside the layer.
    pub source: PathBuf,
    /// Import: path inside the layer. Export: host path.
    pub mountpoint: PathBuf,
}

impl MountSpec {
    /// Whether this is a bind mount.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.fstype == BIND
    }
}

/// Parsed contents of a layer definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDefinition {
    /// Declared base layer.
    pub base: Option<String>,
    /// Host paths mounted into the layer.
    pub imports: Vec<MountSpec>,
    /// Layer paths mounted onto the host.
    pub exports: Vec<MountSpec>,
    /// Problems found while reading (soft mode).
    pub messages: Vec<String>,
}

impl LayerDefinition {
    /// Read a definition file. A missing file is an empty definition.
    ///
    /// # Errors
    ///
    /// I/O failures other than `NotFound`, and malformed lines in
    /// [`ParseMode::Strict`].
    pub fn load(path: &Path, resolver: &PathResolver, mode: ParseMode) -> LayerResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, path, resolver, mode),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(LayerError::os("read definition", path, e)),
        }
    }

    /// Parse definition text; `path` is only used in messages.
    ///
    /// # Errors
    ///
    /// The first malformed line in [`ParseMode::Strict`].
    pub fn parse(
        text: &str,
        path: &Path,
        resolver: &PathResolver,
        mode: ParseMode,
    ) -> LayerResult<Self> {
        let mut definition = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            if let Err(message) = definition.apply(line, resolver) {
                match mode {
                    ParseMode::Strict => {
                        return Err(LayerError::Definition {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            message,
                        });
                    }
                    ParseMode::Soft => {
                        tracing::warn!(path = %path.display(), line = idx + 1, %message, "Skipping definition line");
                        definition
                            .messages
                            .push(format!("{}:{}: {message}", path.display(), idx + 1));
                    }
                }
            }
        }

        Ok(definition)
    }

    fn apply(&mut self, line: &str, resolver: &PathResolver) -> Result<(), String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words[0] {
            "base" => {
                let [_, name] = words[..] else {
                    return Err("expected `base <name>`".to_string());
                };
                if !LayerName::is_valid(name) {
                    return Err(format!("invalid base layer name {name:?}"));
                }
                match &self.base {
                    Some(existing) if existing != name => {
                        Err(format!("base redeclared as {name} (was {existing})"))
                    }
                    _ => {
                        self.base = Some(name.to_string());
                        Ok(())
                    }
                }
            }
            keyword @ ("import" | "export") => {
                let [_, fstype, source, mountpoint] = words[..] else {
                    return Err(format!("expected `{keyword} <fstype> <source> <mountpoint>`"));
                };
                if keyword == "import" {
                    let spec = MountSpec {
                        kind: MountKind::Import,
                        fstype: fstype.to_string(),
                        source: if fstype == BIND {
                            resolve(resolver, source)?
                        } else {
                            PathBuf::from(source)
                        },
                        mountpoint: layer_path(mountpoint)?,
                    };
                    self.imports.push(spec);
                } else {
                    if fstype != BIND {
                        return Err(format!("exports must be bind mounts, not {fstype}"));
                    }
                    let spec = MountSpec {
                        kind: MountKind::Export,
                        fstype: fstype.to_string(),
                        source: layer_path(source)?,
                        mountpoint: resolve(resolver, mountpoint)?,
                    };
                    self.exports.push(spec);
                }
                Ok(())
            }
            other => Err(format!("unknown keyword {other:?}")),
        }
    }

    /// Render the definition back to file form.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(base) = &self.base {
            out.push_str(&format!("base {base}\n"));
        }
        for spec in self.imports.iter().chain(&self.exports) {
            out.push_str(&format!(
                "{} {} {} {}\n",
                spec.kind,
                spec.fstype,
                spec.source.display(),
                spec.mountpoint.display()
            ));
        }
        out
    }
}

/// Point every `base` line of definition text at `base` (or drop the lines
/// when `None`), keeping everything else as written. Returns `None` when
/// nothing changes.
#[must_use]
pub fn replace_base(text: &str, base: Option<&str>) -> Option<String> {
    let mut changed = false;
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if let ["base", old] = words[..] {
            if Some(old) != base {
                changed = true;
                if let Some(base) = base {
                    out.push_str("base ");
                    out.push_str(base);
                    out.push('\n');
                }
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    changed.then_some(out)
}

fn resolve(resolver: &PathResolver, raw: &str) -> Result<PathBuf, String> {
    resolver.resolve(raw).map_err(|e| e.to_string())
}

/// Validate a path that lives inside a layer: absolute, no `..`.
fn layer_path(raw: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(format!("layer path {raw:?} must be absolute"));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(format!("layer path {raw:?} must not contain .."));
    }
    if path.as_os_str() == "/" {
        return Err("cannot mount over the layer root".to_string());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::default()
            .with_home("/home/builder")
            .with_symbol("cache", "/var/cache/cake")
    }

    fn parse(text: &str, mode: ParseMode) -> LayerResult<LayerDefinition> {
        LayerDefinition::parse(text, Path::new("der1.layer"), &resolver(), mode)
    }

    #[test]
    fn parses_full_definition() {
        let def = parse(
            "# comment\n\
             // another comment\n\
             \n\
             base base1\n\
             import bind ~/src /usr/src\n\
             import tmpfs tmpfs /tmp\n\
             export bind /var/cache/apt $cache/apt\n",
            ParseMode::Strict,
        )
        .unwrap();

        assert_eq!(def.base.as_deref(), Some("base1"));
        assert_eq!(def.imports.len(), 2);
        assert_eq!(def.imports[0].source, PathBuf::from("/home/builder/src"));
        assert_eq!(def.imports[0].mountpoint, PathBuf::from("/usr/src"));
        assert!(def.imports[0].is_bind());
        assert_eq!(def.imports[1].source, PathBuf::from("tmpfs"));
        assert_eq!(def.exports.len(), 1);
        assert_eq!(def.exports[0].source, PathBuf::from("/var/cache/apt"));
        assert_eq!(
            def.exports[0].mountpoint,
            PathBuf::from("/var/cache/cake/apt")
        );
        assert!(def.messages.is_empty());
    }

    #[test]
    fn soft_mode_collects_messages() {
        let def = parse(
            "frobnicate now\nimport bind /only-two\nimport bind /src /usr/src\n",
            ParseMode::Soft,
        )
        .unwrap();
        assert_eq!(def.imports.len(), 1);
        assert_eq!(def.messages.len(), 2);
        assert!(def.messages[0].contains("unknown keyword"));
        assert!(def.messages[1].starts_with("der1.layer:2:"));
    }

    #[test]
    fn strict_mode_fails_fast() {
        let err = parse("base a\nbogus\n", ParseMode::Strict).unwrap_err();
        assert!(matches!(err, LayerError::Definition { line: 2, .. }));
    }

    #[test]
    fn base_redeclaration() {
        let def = parse("base a\nbase a\n", ParseMode::Soft).unwrap();
        assert!(def.messages.is_empty());

        let def = parse("base a\nbase b\n", ParseMode::Soft).unwrap();
        assert_eq!(def.base.as_deref(), Some("a"));
        assert_eq!(def.messages.len(), 1);
    }

    #[test]
    fn layer_paths_must_stay_inside() {
        let def = parse(
            "import bind /src usr/src\nimport bind /src /../etc\nimport bind /src /\n",
            ParseMode::Soft,
        )
        .unwrap();
        assert!(def.imports.is_empty());
        assert_eq!(def.messages.len(), 3);
    }

    #[test]
    fn exports_must_be_binds() {
        let def = parse("export tmpfs tmpfs /mnt/x\n", ParseMode::Soft).unwrap();
        assert!(def.exports.is_empty());
        assert_eq!(def.messages.len(), 1);
    }

    #[test]
    fn render_round_trips() {
        let text = "base base1\nimport bind /srv/src /usr/src\nexport bind /out /srv/out\n";
        let def = parse(text, ParseMode::Strict).unwrap();
        assert_eq!(def.render(), text);
    }

    #[test]
    fn replace_base_keeps_comments() {
        let text = "# built nightly\nbase base1\nimport bind /src /usr/src\n";
        assert_eq!(
            replace_base(text, Some("root")).as_deref(),
            Some("# built nightly\nbase root\nimport bind /src /usr/src\n")
        );
        assert_eq!(
            replace_base(text, None).as_deref(),
            Some("# built nightly\nimport bind /src /usr/src\n")
        );
        assert_eq!(replace_base(text, Some("base1")), None);
        assert_eq!(replace_base("import bind /a /b\n", Some("x")), None);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let def = LayerDefinition::load(
            &dir.path().join("absent.layer"),
            &resolver(),
            ParseMode::Strict,
        )
        .unwrap();
        assert_eq!(def, LayerDefinition::default());
    }
}
