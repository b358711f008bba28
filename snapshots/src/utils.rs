use crate::{Error, Result, Usage};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copy the content of `source` into the existing directory `destination`.
///
/// Permissions are kept, symbolic links are copied as links.
pub fn copy_dir(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| Error::CopyDirectory(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::CopyDirectory(e.to_string()))?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::CopyDirectory(e.to_string()))?;
            let metadata = entry
                .metadata()
                .map_err(|e| Error::CopyDirectory(e.to_string()))?;
            fs::set_permissions(&target, metadata.permissions())
                .map_err(|e| Error::CopyDirectory(e.to_string()))?;
        } else if file_type.is_symlink() {
            let link =
                fs::read_link(entry.path()).map_err(|e| Error::CopyDirectory(e.to_string()))?;
            std::os::unix::fs::symlink(link, &target)
                .map_err(|e| Error::CopyDirectory(e.to_string()))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::CopyDirectory(format!(
                    "failed to copy {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
        }
    }

    Ok(())
}

/// Compute the disk usage of a directory.
pub fn disk_usage(path: &Path) -> Result<Usage> {
    let mut usage = Usage::default();

    if !path.exists() {
        return Ok(usage);
    }

    for entry in WalkDir::new(path) {
        let entry =
            entry.map_err(|e| Error::DiskUsage(format!("failed to walk directory: {}", e)))?;
        usage.inodes += 1;

        if entry.file_type().is_file() {
            if let Ok(metadata) = entry.metadata() {
                usage.size += metadata.len() as i64;
            }
        }
    }

    Ok(usage)
}
