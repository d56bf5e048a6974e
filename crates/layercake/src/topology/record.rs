//! Mount table records.
//!
//! One record per line of `/proc/<pid>/mountinfo`:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2) (3)   (4)   (5)      (6)      (7)   (8) (9)    (10)         (11)
//! ```
//!
//! Field 7 is zero or more optional tags terminated by the literal `-`.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use layercake_common::{LayerError, LayerResult};

/// Number of fields before the optional tags.
const LEADING_FIELDS: usize = 6;

/// Number of fields after the `-` separator.
const TRAILING_FIELDS: usize = 3;

/// A backing filesystem instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Kernel device identifier (`major:minor`).
    pub id: String,
    /// Filesystem type of the first mount seen for this device.
    pub fstype: String,
    /// Mountpoints exposing the device's own root (`root == "/"`).
    pub root_mountpoints: Vec<PathBuf>,
}

/// The directories an overlay mount composes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirs {
    /// Read-only lower directory (colon separated if stacked).
    pub lowerdir: PathBuf,
    /// Writable upper directory.
    pub upperdir: Option<PathBuf>,
    /// Overlay scratch directory.
    pub workdir: Option<PathBuf>,
}

/// One live mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Unique mount ID.
    pub mount_id: u32,
    /// Mount ID of the parent mount.
    pub parent_id: u32,
    /// Backing device identifier.
    pub device: String,
    /// Path within the device exposed at the mountpoint.
    pub root: PathBuf,
    /// Where the mount is attached.
    pub mountpoint: PathBuf,
    /// Per-mount options.
    pub options: String,
    /// Filesystem type.
    pub fstype: String,
    /// Filesystem source (device node, `overlay`, `proc`, ...).
    pub source: String,
    /// Per-superblock options.
    pub super_options: String,
    /// Lower/upper/work directories, for overlay mounts only.
    pub overlay: Option<OverlayDirs>,
    /// Nested under a shadowing filesystem type.
    pub in_shadow: bool,
}

impl MountRecord {
    /// Parse one mount table line. `line_no` is only used for errors.
    pub(crate) fn parse(line: &str, line_no: usize) -> LayerResult<Self> {
        let malformed = |reason: &str| LayerError::MalformedMountLine {
            line: line_no,
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() < LEADING_FIELDS + 1 + TRAILING_FIELDS {
            return Err(malformed("too few fields"));
        }

        let separator = fields[LEADING_FIELDS..]
            .iter()
            .position(|f| *f == "-")
            .map(|p| p + LEADING_FIELDS)
            .ok_or_else(|| malformed("missing '-' separator"))?;
        if fields.len() < separator + 1 + TRAILING_FIELDS {
            return Err(malformed("too few fields after separator"));
        }

        let mount_id = fields[0]
            .parse()
            .map_err(|_| malformed("mount ID is not a number"))?;
        let parent_id = fields[1]
            .parse()
            .map_err(|_| malformed("parent ID is not a number"))?;

        let fstype = fields[separator + 1].to_string();
        let super_options = fields[separator + 3].to_string();
        let overlay = (fstype == "overlay").then(|| parse_overlay_options(&super_options));

        Ok(Self {
            mount_id,
            parent_id,
            device: fields[2].to_string(),
            root: unescape_path(fields[3]),
            mountpoint: unescape_path(fields[4]),
            options: fields[5].to_string(),
            fstype,
            source: String::from_utf8_lossy(&unescape(fields[separator + 2])).into_owned(),
            super_options,
            overlay,
            in_shadow: false,
        })
    }

    /// Whether the mount exposes its device's root.
    #[must_use]
    pub fn is_device_root(&self) -> bool {
        self.root.as_os_str() == "/"
    }
}

/// Extract `lowerdir`, `upperdir` and `workdir` from overlay super options.
fn parse_overlay_options(super_options: &str) -> OverlayDirs {
    let mut dirs = OverlayDirs {
        lowerdir: PathBuf::new(),
        upperdir: None,
        workdir: None,
    };
    for option in super_options.split(',') {
        let Some((key, value)) = option.split_once('=') else {
            continue;
        };
        match key {
            "lowerdir" => dirs.lowerdir = unescape_path(value),
            "upperdir" => dirs.upperdir = Some(unescape_path(value)),
            "workdir" => dirs.workdir = Some(unescape_path(value)),
            _ => {}
        }
    }
    dirs
}

/// Decode `\NNN` octal escapes. Anything else is copied verbatim.
pub(crate) fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            // Three octal digits can exceed a byte; such escapes are not
            // produced by the kernel and are kept literally.
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|b| (b'0'..=b'7').contains(b))
}

fn unescape_path(field: &str) -> PathBuf {
    PathBuf::from(OsString::from_vec(unescape(field)))
}
