// hasher.rs - SHA-256 helpers, lowercase hex.
//
// Used for the outcome-log chain, for file digests compared during copies,
// and for the server's HASH reply, so every side agrees on one encoding.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::AuditError;

pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Digest of a file, streamed in 64 KiB blocks.
pub fn hash_file(path: &Path) -> Result<String, AuditError> {
    let failed = |source| AuditError::HashFileFailed {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(failed)?);
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut block).map_err(failed)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_empty_digest() {
        assert_eq!(
            hash_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = hash_file(Path::new("/nonexistent/cf-audit-test")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cf-audit-test"));
    }
}
