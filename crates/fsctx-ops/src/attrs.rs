//! Extended attributes, and the trash record kept in them.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fsctx_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Where a trashed entry came from.
pub const ORIGINAL_PATH_ATTR: &str = "user.fsctx.original-path";
/// When an entry was trashed, RFC 3339.
pub const TRASHED_AT_ATTR: &str = "user.fsctx.trashed-at";

/// Attributes the engine owns; copies never carry them over.
pub fn is_engine_attribute(name: &OsStr) -> bool {
    name == ORIGINAL_PATH_ATTR || name == TRASHED_AT_ATTR
}

/// Whether an error means the filesystem keeps no extended attributes here.
pub fn is_unsupported(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(nix::libc::ENOTSUP) | Some(nix::libc::EPERM) | Some(nix::libc::ENOSYS)
    ) || error.kind() == io::ErrorKind::Unsupported
}

/// Copy extended attributes from `source` to `target`.
///
/// Symlinks are not followed. Engine-owned and configured exclusions are
/// left behind. Returns how many attributes were copied; a filesystem
/// without attribute support on either side copies none.
pub fn copy_attributes(source: &Path, target: &Path, config: &EngineConfig) -> io::Result<usize> {
    if !config.copy_attributes || !xattr::SUPPORTED_PLATFORM {
        return Ok(0);
    }
    let names = match xattr::list(source) {
        Ok(names) => names,
        Err(e) if is_unsupported(&e) => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut copied = 0;
    for name in names {
        if is_engine_attribute(&name) || config.is_attribute_excluded(&name.to_string_lossy()) {
            continue;
        }
        let Some(value) = xattr::get(source, &name)? else {
            continue;
        };
        match xattr::set(target, &name, &value) {
            Ok(()) => copied += 1,
            Err(e) if is_unsupported(&e) => {
                tracing::debug!(target = %target.display(), "Target keeps no extended attributes");
                return Ok(copied);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(copied)
}

/// Record of a trashed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashRecord {
    pub original_path: PathBuf,
    pub trashed_at: DateTime<Utc>,
}

impl TrashRecord {
    pub fn new(original_path: PathBuf) -> Self {
        Self {
            original_path,
            trashed_at: Utc::now(),
        }
    }

    /// Store the record as attributes of `path`.
    ///
    /// Returns `Ok(false)` when the filesystem cannot hold it there.
    pub fn store_attributes(&self, path: &Path) -> io::Result<bool> {
        if !xattr::SUPPORTED_PLATFORM {
            return Ok(false);
        }
        let original = self.original_path.as_os_str().as_bytes();
        let stamp = self.trashed_at.to_rfc3339();
        match xattr::set(path, ORIGINAL_PATH_ATTR, original)
            .and_then(|()| xattr::set(path, TRASHED_AT_ATTR, stamp.as_bytes()))
        {
            Ok(()) => Ok(true),
            Err(e) if is_unsupported(&e) => {
                let _ = xattr::remove(path, ORIGINAL_PATH_ATTR);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Read a record from the attributes of `path`.
    pub fn load_attributes(path: &Path) -> Option<Self> {
        if !xattr::SUPPORTED_PLATFORM {
            return None;
        }
        let original = xattr::get(path, ORIGINAL_PATH_ATTR).ok()??;
        let original_path = PathBuf::from(OsString::from_vec(original));
        let trashed_at = xattr::get(path, TRASHED_AT_ATTR)
            .ok()
            .flatten()
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|text| DateTime::parse_from_rfc3339(&text).ok())
            .map(|stamp| stamp.with_timezone(&Utc))
            .unwrap_or_default();
        Some(Self {
            original_path,
            trashed_at,
        })
    }

    /// Remove the record's attributes from `path`, ignoring absent ones.
    pub fn clear_attributes(path: &Path) {
        if xattr::SUPPORTED_PLATFORM {
            let _ = xattr::remove(path, ORIGINAL_PATH_ATTR);
            let _ = xattr::remove(path, TRASHED_AT_ATTR);
        }
    }

    /// Store the record as a JSON file.
    pub fn store_sidecar(&self, sidecar: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        std::fs::write(sidecar, json)
    }

    pub fn load_sidecar(sidecar: &Path) -> Option<Self> {
        let text = std::fs::read(sidecar).ok()?;
        serde_json::from_slice(&text).ok()
    }
}
