//! Device, free-space and mount-point queries.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::AccessFlags;

/// Device number of `path`, without following a final symlink.
pub fn device_of(path: &Path) -> io::Result<u64> {
    Ok(std::fs::symlink_metadata(path)?.dev())
}

/// Bytes free to unprivileged users on the volume holding `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let stats = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    Ok((stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64))
}

/// Whether the current user may create entries in `path`.
pub fn is_writable(path: &Path) -> bool {
    nix::unistd::access(path, AccessFlags::W_OK).is_ok()
}

/// Highest directory above `path` that is still on the same device.
pub fn volume_root(path: &Path) -> io::Result<PathBuf> {
    let mut root = path.canonicalize()?;
    let device = std::fs::metadata(&root)?.dev();
    while let Some(parent) = root.parent() {
        if std::fs::metadata(parent)?.dev() != device {
            break;
        }
        root = parent.to_path_buf();
    }
    Ok(root)
}

/// Whether an error says the two paths are on different devices.
pub fn is_cross_device(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::CrossesDevices
        || error.raw_os_error() == Some(nix::libc::EXDEV)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_volume_root_contains_path() {
        let temp = TempDir::new().unwrap();
        let root = volume_root(temp.path()).unwrap();
        let canonical = temp.path().canonicalize().unwrap();
        assert!(canonical.starts_with(&root));
        assert_eq!(device_of(&root).unwrap(), device_of(temp.path()).unwrap());
    }

    #[test]
    fn test_space_and_access() {
        let temp = TempDir::new().unwrap();
        assert!(available_space(temp.path()).unwrap() > 0);
        assert!(is_writable(temp.path()));
    }

    #[test]
    fn test_cross_device_error() {
        assert!(is_cross_device(&io::Error::from_raw_os_error(nix::libc::EXDEV)));
        assert!(!is_cross_device(&io::Error::from_raw_os_error(nix::libc::EACCES)));
    }
}
