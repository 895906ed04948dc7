//! BLAKE3 hashing for manifest sources and catalogs.

use crate::core::error::{Error, Result};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Order-sensitive digest over several component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_string_deterministic() {
        let a = hash_string("class a {}");
        assert_eq!(a, hash_string("class a {}"));
        assert_ne!(a, hash_string("class b {}"));
        assert!(a.starts_with("blake3:"));
        assert_eq!(a.len(), "blake3:".len() + 64);
    }

    #[test]
    fn test_hasher_file_matches_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.pp");
        std::fs::write(&path, "node default {}").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_string("node default {}"));
    }

    #[test]
    fn test_hasher_file_missing() {
        let err = hash_file(Path::new("/nonexistent/site.pp")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_hasher_composite_order_sensitive() {
        let ab = composite_hash(&["a", "b"]);
        assert_ne!(ab, composite_hash(&["b", "a"]));
        assert_ne!(composite_hash(&["ab"]), composite_hash(&["a", "b"]));
    }
}
