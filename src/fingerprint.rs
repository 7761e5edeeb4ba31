//! Stable content+parameter fingerprint for an image instance.

use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatParams {
    pub format: crate::cache::Format,
    pub quality: u8,
}

/// Compute a fingerprint from the normalised absolute path, the file's mtime
/// (integer nanoseconds since the epoch) and byte size, the final cell-box,
/// and the format parameters.
pub fn compute(
    path: &Path,
    mtime_nanos: i128,
    byte_size: u64,
    cols: u16,
    rows: u16,
    params: FormatParams,
) -> Result<Fingerprint> {
    let abs = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(b"kitgfx-fingerprint-v1\0");
    hasher.update(abs.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(mtime_nanos.to_be_bytes());
    hasher.update(byte_size.to_be_bytes());
    hasher.update(cols.to_be_bytes());
    hasher.update(rows.to_be_bytes());
    hasher.update([params.format as u8]);
    hasher.update([params.quality]);

    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[0..16]);
    Ok(Fingerprint(bytes))
}

/// Read a source file's mtime (as integer nanoseconds since the epoch) and
/// byte size, the two quantities that make a fingerprint change when the
/// underlying file changes.
pub fn file_stat(path: &Path) -> Result<(i128, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta.modified()?;
    let nanos = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0);
    Ok((nanos, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Format;

    #[test]
    fn same_inputs_give_same_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"hello").unwrap();
        let params = FormatParams { format: Format::Png, quality: 90 };
        let fp1 = compute(&path, 123, 5, 10, 5, params).unwrap();
        let fp2 = compute(&path, 123, 5, 10, 5, params).unwrap();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn changing_mtime_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"hello").unwrap();
        let params = FormatParams { format: Format::Png, quality: 90 };
        let fp1 = compute(&path, 123, 5, 10, 5, params).unwrap();
        let fp2 = compute(&path, 124, 5, 10, 5, params).unwrap();
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn hex_is_32_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"hello").unwrap();
        let params = FormatParams { format: Format::Png, quality: 90 };
        let fp = compute(&path, 0, 5, 1, 1, params).unwrap();
        assert_eq!(fp.to_hex().len(), 32);
    }
}
