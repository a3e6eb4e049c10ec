use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde_json::Value;
use tracing::{debug, error, warn};

pub use fetchtastic_dl::verify::{
    hash_sidecar_path, read_hash_sidecar, sha256_file, verify_zip, write_hash_sidecar,
};

use crate::{
    error::ErrorContext,
    pattern::{matches_exclude, matches_include},
    Result,
};

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_os_string();
    temp.push(format!(".tmp.{}", std::process::id()));
    let temp = PathBuf::from(temp);

    let write_result = (|| -> io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, path)
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    write_result.with_context(|| format!("atomically writing {}", path.display()))
}

/// Write JSON to a sibling temp file, fsync, then rename over the target.
/// The target never observes a partial write.
pub fn atomic_write_json(path: &Path, value: &Value) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &payload)
}

pub fn atomic_write_text(path: &Path, content: &str) -> Result<()> {
    atomic_write_bytes(path, content.as_bytes())
}

/// Read and parse a JSON file; missing or unreadable files read as absent.
pub fn read_json(path: &Path) -> Option<Value> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            error!("Could not parse JSON file {}: {err}", path.display());
            None
        }
    }
}

pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

pub fn compare_file_hashes(a: &Path, b: &Path) -> bool {
    match (sha256_file(a), sha256_file(b)) {
        (Ok(ha), Ok(hb)) => ha == hb,
        _ => false,
    }
}

/// Remove a directory tree, refusing to operate when the canonical target is
/// not contained in the canonical base. Missing directories count as success.
pub fn safe_remove_tree(dir: &Path, base_dir: &Path, display_name: &str) -> bool {
    if !dir.exists() {
        return true;
    }

    let (canonical_dir, canonical_base) = match (dir.canonicalize(), base_dir.canonicalize()) {
        (Ok(d), Ok(b)) => (d, b),
        _ => {
            warn!("Could not resolve {display_name} for removal");
            return false;
        }
    };

    if !canonical_dir.starts_with(&canonical_base) {
        warn!(
            "Refusing to remove {display_name}: {} escapes {}",
            canonical_dir.display(),
            canonical_base.display()
        );
        return false;
    }

    match fs::remove_dir_all(&canonical_dir) {
        Ok(()) => true,
        Err(err) => {
            error!("Error removing {display_name}: {err}");
            false
        }
    }
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn entry_is_wanted(base_name: &str, include: &[String], exclude: &[String]) -> bool {
    matches_include(base_name, include) && !matches_exclude(base_name, exclude)
}

/// Extract pattern-matching file entries from a ZIP archive, flattened into
/// `out_dir` by basename. Existing files are never overwritten; `.sh` files
/// get the executable bit where the host supports it.
pub fn extract_archive(
    archive_path: &Path,
    out_dir: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating extraction directory {}", out_dir.display()))?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }

        let base_name = match Path::new(entry.name()).file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        if !entry_is_wanted(&base_name, include, exclude) {
            continue;
        }

        let target = out_dir.join(&base_name);
        if target.exists() {
            debug!("Skipping extraction of {base_name}: already present");
            continue;
        }

        let mut output = File::create(&target)
            .with_context(|| format!("creating extracted file {}", target.display()))?;
        io::copy(&mut entry, &mut output)
            .with_context(|| format!("extracting {base_name} from {}", archive_path.display()))?;

        if base_name.to_lowercase().ends_with(".sh") {
            if let Err(err) = set_executable(&target) {
                warn!("Could not set executable bit on {}: {err}", target.display());
            }
        }

        extracted.push(target);
    }

    Ok(extracted)
}

/// Extraction is idempotent: when every pattern-matching entry already exists
/// in `out_dir`, there is nothing to do.
pub fn extraction_needed(
    archive_path: &Path,
    out_dir: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<bool> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let base_name = match Path::new(entry.name()).file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        if entry_is_wanted(&base_name, include, exclude) && !out_dir.join(&base_name).exists() {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Strip non-ASCII characters; release-note bodies are sanitized this way
/// before hitting disk.
pub fn strip_non_ascii(text: &str) -> String {
    text.chars().filter(char::is_ascii).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
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
    fn atomic_json_round_trip_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let value = json!({"latest_version": "v2.7.13"});

        atomic_write_json(&path, &value).unwrap();
        assert_eq!(read_json(&path), Some(value));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_json_treats_garbage_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        assert!(read_json(&path).is_none());
        assert!(read_json(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn safe_remove_tree_refuses_paths_outside_base() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let inside = base.join("v2.7.13");
        let outside = dir.path().join("elsewhere");
        fs::create_dir_all(&inside).unwrap();
        fs::create_dir_all(&outside).unwrap();

        assert!(!safe_remove_tree(&outside, &base, "outside dir"));
        assert!(outside.exists());

        assert!(safe_remove_tree(&inside, &base, "version dir"));
        assert!(!inside.exists());

        // Missing directories are treated as success.
        assert!(safe_remove_tree(&inside, &base, "version dir"));
    }

    #[test]
    fn extraction_flattens_filters_and_never_overwrites() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("fw.zip");
        write_zip(
            &archive,
            &[
                ("nested/dir/firmware-rak4631-2.7.13.bin", b"rak"),
                ("firmware-tbeam-2.7.13.bin", b"tbeam"),
                ("device-install.sh", b"#!/bin/sh\n"),
                ("littlefs-debug.bin", b"debug"),
            ],
        );

        let out = dir.path().join("out");
        let include = vec!["rak4631".to_string(), "device-".to_string()];
        let exclude = vec!["debug".to_string()];
        let extracted = extract_archive(&archive, &out, &include, &exclude).unwrap();

        let names: Vec<_> = extracted
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"firmware-rak4631-2.7.13.bin".to_string()));
        assert!(names.contains(&"device-install.sh".to_string()));
        // Flattened: the nested path collapses to the basename.
        assert!(out.join("firmware-rak4631-2.7.13.bin").exists());
        assert!(!out.join("nested").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(out.join("device-install.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_ne!(mode & 0o111, 0);
        }

        // Second pass extracts nothing and does not clobber files.
        fs::write(out.join("device-install.sh"), b"local edit").unwrap();
        let again = extract_archive(&archive, &out, &include, &exclude).unwrap();
        assert!(again.is_empty());
        assert_eq!(fs::read(out.join("device-install.sh")).unwrap(), b"local edit");
        assert!(!extraction_needed(&archive, &out, &include, &exclude).unwrap());
    }

    #[test]
    fn extraction_needed_reports_missing_matches() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("fw.zip");
        write_zip(&archive, &[("firmware-rak4631-2.7.13.bin", b"rak")]);

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let include = vec!["rak4631".to_string()];
        assert!(extraction_needed(&archive, &out, &include, &[]).unwrap());
    }

    #[test]
    fn strip_non_ascii_keeps_plain_text() {
        assert_eq!(strip_non_ascii("Release 2.7.13 \u{1F680} notes"), "Release 2.7.13  notes");
        assert_eq!(strip_non_ascii("plain"), "plain");
    }

    #[test]
    fn compare_file_hashes_detects_difference() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        fs::write(&c, b"different").unwrap();

        assert!(compare_file_hashes(&a, &b));
        assert!(!compare_file_hashes(&a, &c));
        assert!(!compare_file_hashes(&a, &dir.path().join("missing")));
    }
}
