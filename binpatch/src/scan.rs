use crate::{Error, Result};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Size of the blocks read from the scanned file.
const CHUNK_SIZE: usize = 64 * 1024;

/// Return the offset of the first occurrence of `pattern` in the file at `path`.
///
/// The search is a literal, case-sensitive comparison of raw bytes: no text
/// encoding and no regular expression semantics. `Ok(None)` means the pattern
/// does not occur in the file; an empty pattern never matches.
///
/// A file that cannot be opened or read is an `Error::Read`, not `Ok(None)`:
/// callers decide whether an unreadable file counts as not matching.
pub fn find_offset(pattern: &[u8], path: &Path) -> Result<Option<u64>> {
    if pattern.is_empty() {
        return Ok(None);
    }

    let file = File::open(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;

    find_in_reader(pattern, file).map_err(|e| Error::Read(path.to_path_buf(), e))
}

/// Stream `reader` block by block, carrying the last `pattern.len() - 1` bytes
/// over so that a match straddling two blocks is still found.
fn find_in_reader<R: Read>(pattern: &[u8], mut reader: R) -> std::io::Result<Option<u64>> {
    let keep = pattern.len() - 1;
    let mut block = vec![0u8; CHUNK_SIZE.max(pattern.len())];
    let mut window: Vec<u8> = Vec::with_capacity(block.len() + keep);
    // File offset of `window[0]`
    let mut base: u64 = 0;

    loop {
        let read = match reader.read(&mut block) {
            Ok(0) => return Ok(None),
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        window.extend_from_slice(&block[..read]);

        if let Some(position) = window
            .windows(pattern.len())
            .position(|candidate| candidate == pattern)
        {
            return Ok(Some(base + position as u64));
        }

        if window.len() > keep {
            let consumed = window.len() - keep;
            window.drain(..consumed);
            base += consumed as u64;
        }
    }
}
