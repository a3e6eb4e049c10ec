use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::DownloadError;

const HASH_SIDECAR_SUFFIX: &str = "sha256";

/// Compute the SHA-256 digest of a file as a lowercase hex string.
pub fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let file = File::open(path)
        .map_err(|e| DownloadError::fs(format!("opening {} for hashing", path.display()), e))?;
    let mut reader = io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| DownloadError::fs(format!("hashing {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn hash_sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(HASH_SIDECAR_SUFFIX);
    PathBuf::from(name)
}

pub fn write_hash_sidecar(path: &Path, hex: &str) -> Result<(), DownloadError> {
    let sidecar = hash_sidecar_path(path);
    fs::write(&sidecar, format!("{hex}\n"))
        .map_err(|e| DownloadError::fs(format!("writing hash sidecar {}", sidecar.display()), e))
}

pub fn read_hash_sidecar(path: &Path) -> Option<String> {
    let sidecar = hash_sidecar_path(path);
    let content = fs::read_to_string(sidecar).ok()?;
    let hex = content.trim();
    if hex.is_empty() {
        None
    } else {
        Some(hex.to_string())
    }
}

/// Run an integrity test over every entry of a ZIP archive. Reading each
/// entry to the end forces the CRC check; any error marks the file invalid.
pub fn verify_zip(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            warn!("Could not open {} for verification: {err}", path.display());
            return false;
        }
    };

    let mut archive = match zip::ZipArchive::new(file) {
        Ok(a) => a,
        Err(err) => {
            warn!("Invalid ZIP archive {}: {err}", path.display());
            return false;
        }
    };

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(e) => e,
            Err(err) => {
                warn!("Corrupt entry in {}: {err}", path.display());
                return false;
            }
        };
        if io::copy(&mut entry, &mut io::sink()).is_err() {
            warn!(
                "CRC mismatch in {} entry {}",
                path.display(),
                entry.name()
            );
            return false;
        }
    }

    true
}

/// Check whether an already-present target is usable as-is: ZIP archives must
/// pass the integrity test, and a hash sidecar (when present) must match.
pub fn verify_existing(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
        && !verify_zip(path)
    {
        return false;
    }

    if let Some(expected) = read_hash_sidecar(path) {
        match sha256_file(path) {
            Ok(actual) if actual == expected => {}
            Ok(actual) => {
                debug!(
                    "Hash mismatch for {}: sidecar {expected}, actual {actual}",
                    path.display()
                );
                return false;
            }
            Err(_) => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, b"firmware").unwrap();
        let digest = sha256_file(&path).unwrap();
        write_hash_sidecar(&path, &digest).unwrap();
        assert_eq!(read_hash_sidecar(&path).as_deref(), Some(digest.as_str()));
        assert!(verify_existing(&path));
    }

    #[test]
    fn stale_sidecar_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, b"firmware").unwrap();
        write_hash_sidecar(&path, "deadbeef").unwrap();
        assert!(!verify_existing(&path));
    }

    #[test]
    fn valid_zip_passes_and_garbage_fails() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.zip");
        write_zip(&good, &[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        assert!(verify_zip(&good));
        assert!(verify_existing(&good));

        let bad = dir.path().join("bad.zip");
        fs::write(&bad, b"this is not a zip archive").unwrap();
        assert!(!verify_zip(&bad));
        assert!(!verify_existing(&bad));
    }

    #[test]
    fn missing_file_fails_verification() {
        let dir = tempdir().unwrap();
        assert!(!verify_existing(&dir.path().join("absent.bin")));
    }
}
