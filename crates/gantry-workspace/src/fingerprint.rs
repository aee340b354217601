//! Content fingerprints used for conflict detection and tree comparison.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn file_digest(path: &Path) -> io::Result<String> {
    Ok(digest_bytes(&fs::read(path)?))
}

/// Digest of the file at `path`, or `None` if no regular file is there.
/// Out-of-band replacement of a file by a directory reads as "changed".
pub fn file_digest_opt(path: &Path) -> io::Result<Option<String>> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(file_digest(path)?)),
        Ok(_) => Ok(None),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Relative path -> content digest for every regular file under `root`.
/// The ordered map makes two trees directly comparable.
pub fn tree_digest(root: &Path) -> io::Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .into_owned();
        digests.insert(rel, file_digest(entry.path())?);
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tree_digest_sees_nested_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"deep").unwrap();

        let digests = tree_digest(dir.path()).unwrap();
        assert_eq!(digests.len(), 2);
        assert!(digests.contains_key("top.txt"));
        assert!(digests.contains_key("a/b/deep.txt"));
    }

    #[test]
    fn digest_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"one").unwrap();
        let before = file_digest(&file).unwrap();
        fs::write(&file, b"two").unwrap();
        assert_ne!(before, file_digest(&file).unwrap());
    }

    #[test]
    fn missing_or_nonfile_paths_have_no_digest() {
        let dir = TempDir::new().unwrap();
        assert!(file_digest_opt(&dir.path().join("absent")).unwrap().is_none());
        assert!(file_digest_opt(dir.path()).unwrap().is_none());
    }
}
