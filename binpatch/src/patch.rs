use crate::{Error, Result};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Overwrite the bytes of the file at `path` starting at `offset` with `replacement`.
///
/// The file is modified in place: it is never truncated, recreated or renamed,
/// so descriptors already opened on it keep seeing the same inode. Bytes outside
/// `offset..offset + replacement.len()` are left untouched. Writing past the end
/// of the file extends it.
pub fn patch(path: &Path, offset: u64, replacement: &[u8]) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::Write(path.to_path_buf(), e))?;

    file.write_all_at(replacement, offset)
        .and_then(|_| file.sync_data())
        .map_err(|e| Error::Write(path.to_path_buf(), e))?;

    log::trace!(
        "wrote {} bytes at offset {} into {}",
        replacement.len(),
        offset,
        path.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::patch;
    use crate::find_offset;
    use std::fs::{read, write};
    use tempdir::TempDir;

    #[test]
    fn test_patch_preserves_surrounding_bytes() {
        let dir = TempDir::new("binpatch_patch").unwrap();
        let binary = dir.path().join("httpd");
        let original: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        write(&binary, &original).unwrap();

        patch(&binary, 1000, b"HolaAmigo").unwrap();

        let patched = read(&binary).unwrap();
        assert_eq!(patched.len(), original.len());
        assert_eq!(&patched[..1000], &original[..1000]);
        assert_eq!(&patched[1000..1009], b"HolaAmigo");
        assert_eq!(&patched[1009..], &original[1009..]);
    }

    #[test]
    fn test_patch_removes_target_marker() {
        let dir = TempDir::new("binpatch_patch").unwrap();
        let binary = dir.path().join("httpd");
        write(&binary, b"....postgresql123....").unwrap();

        let offset = find_offset(b"postgresql123", &binary).unwrap().unwrap();
        patch(&binary, offset, b"postgresqll23").unwrap();

        assert_eq!(find_offset(b"postgresql123", &binary).unwrap(), None);
        assert_eq!(read(&binary).unwrap(), b"....postgresqll23....");
    }

    #[test]
    fn test_patch_past_the_end_extends_the_file() {
        let dir = TempDir::new("binpatch_patch").unwrap();
        let binary = dir.path().join("httpd");
        write(&binary, b"0123456789").unwrap();

        patch(&binary, 8, b"abcd").unwrap();

        assert_eq!(read(&binary).unwrap(), b"01234567abcd");
    }

    #[test]
    fn test_patch_missing_file_fails() {
        let dir = TempDir::new("binpatch_patch").unwrap();
        let binary = dir.path().join("httpd");

        assert!(patch(&binary, 0, b"abcd").is_err());
        assert!(!binary.exists());
    }
}
