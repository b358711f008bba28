use crate::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Find every regular file under `root` whose file name is exactly `name`.
///
/// Symbolic links are neither followed nor reported. The first entry that
/// cannot be read aborts the walk: a partially scanned tree could miss the
/// binary we are looking for.
pub fn locate(root: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(Error::Traversal)?;

        if entry.file_type().is_file() && entry.file_name() == name {
            paths.push(entry.into_path());
        }
    }

    Ok(paths)
}
