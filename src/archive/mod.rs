//! Content bundle (zip) extraction and packing.
//!
//! Bundles may carry a `manifest.json` at the archive root describing the
//! expected files with optional sha256 digests; extraction verifies digests
//! when present. Entry paths are contained to the destination directory —
//! a bundle can never write outside it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive entry '{0}' escapes the destination directory")]
    PathTraversal(String),
    #[error("checksum mismatch for '{path}': expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("malformed archive: {0}")]
    Malformed(#[from] zip::result::ZipError),
    #[error("malformed bundle manifest: {0}")]
    BadManifest(#[from] serde_json::Error),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `manifest.json` embedded at the root of a content bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the bundle root, forward slashes.
    pub path: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// What an extraction produced: the files written (paths relative to the
/// destination) and how many of them were digest-verified.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    pub files: Vec<ExtractedFile>,
    pub verified: usize,
}

/// Extract a zip bundle into `dest`.
///
/// Every entry path must resolve inside `dest`; `..` components and absolute
/// paths are rejected before anything is written. If the bundle carries a
/// root `manifest.json`, files listed there with a sha256 are verified and a
/// mismatch aborts the extraction.
pub fn extract(bytes: &[u8], dest: &Path) -> Result<ExtractReport, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let manifest = read_manifest(&mut archive)?;
    let expected: std::collections::HashMap<&str, &str> = manifest
        .iter()
        .flat_map(|m| m.files.iter())
        .filter_map(|e| e.sha256.as_deref().map(|h| (e.path.as_str(), h)))
        .collect();

    std::fs::create_dir_all(dest).map_err(|source| ArchiveError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    let mut report = ExtractReport::default();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw_name = entry.name().to_string();

        let rel: PathBuf = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => return Err(ArchiveError::PathTraversal(raw_name)),
        };
        if raw_name == MANIFEST_NAME {
            continue;
        }

        let target = dest.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|source| ArchiveError::Io {
                path: target.clone(),
                source,
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|source| ArchiveError::Io {
                path: target.clone(),
                source,
            })?;

        let rel_key = rel.to_string_lossy().replace('\\', "/");
        if let Some(want) = expected.get(rel_key.as_str()) {
            let actual = hex::encode(Sha256::digest(&data));
            if !actual.eq_ignore_ascii_case(want) {
                return Err(ArchiveError::Integrity {
                    path: rel_key,
                    expected: (*want).to_string(),
                    actual,
                });
            }
            report.verified += 1;
        }

        std::fs::write(&target, &data).map_err(|source| ArchiveError::Io {
            path: target.clone(),
            source,
        })?;
        report.files.push(ExtractedFile {
            path: rel,
            size: data.len() as u64,
        });
    }

    tracing::info!(
        "Extracted {} file(s) into {} ({} verified)",
        report.files.len(),
        dest.display(),
        report.verified
    );
    Ok(report)
}

fn read_manifest(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
) -> Result<Option<ArchiveManifest>, ArchiveError> {
    let mut content = String::new();
    match archive.by_name(MANIFEST_NAME) {
        Ok(mut entry) => {
            entry
                .read_to_string(&mut content)
                .map_err(|source| ArchiveError::Io {
                    path: PathBuf::from(MANIFEST_NAME),
                    source,
                })?;
        }
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    Ok(Some(serde_json::from_str(&content)?))
}

/// Pack a directory tree into a zip bundle.
///
/// Entries are sorted by path and written with a fixed timestamp and
/// permissions, so identical trees produce identical bytes.
pub fn compress(source_dir: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut paths = Vec::new();
    collect_paths(source_dir, source_dir, &mut paths)?;
    paths.sort();

    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, is_dir) in &paths {
        if *is_dir {
            writer.add_directory(name.clone(), options)?;
        } else {
            writer.start_file(name.clone(), options)?;
            let full = source_dir.join(name);
            let data = std::fs::read(&full).map_err(|source| ArchiveError::Io {
                path: full,
                source,
            })?;
            writer.write_all(&data).map_err(|source| ArchiveError::Io {
                path: source_dir.join(name),
                source,
            })?;
        }
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

fn collect_paths(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, bool)>,
) -> Result<(), ArchiveError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ArchiveError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ArchiveError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .expect("walked path is under root")
            .to_string_lossy()
            .replace('\\', "/");
        if path.is_dir() {
            out.push((rel, true));
            collect_paths(root, &path, out)?;
        } else {
            out.push((rel, false));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_plain_archive() {
        let dest = tempfile::tempdir().unwrap();
        let bytes = build_archive(&[
            ("mods/worldedit.jar", b"fake jar"),
            ("config/we.toml", b"limit = 10\n"),
        ]);

        let report = extract(&bytes, dest.path()).unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.verified, 0);
        assert_eq!(
            std::fs::read(dest.path().join("mods/worldedit.jar")).unwrap(),
            b"fake jar"
        );
    }

    #[test]
    fn test_extract_rejects_parent_traversal() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("inner");
        std::fs::create_dir_all(&dest).unwrap();
        let bytes = build_archive(&[("../evil.txt", b"pwned")]);

        match extract(&bytes, &dest) {
            Err(ArchiveError::PathTraversal(name)) => assert_eq!(name, "../evil.txt"),
            other => panic!("expected PathTraversal, got {:?}", other),
        }
        assert!(!root.path().join("evil.txt").exists());
    }

    #[test]
    fn test_extract_rejects_absolute_path() {
        let dest = tempfile::tempdir().unwrap();
        let bytes = build_archive(&[("/etc/evil.txt", b"pwned")]);
        assert!(matches!(
            extract(&bytes, dest.path()),
            Err(ArchiveError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_manifest_checksum_verified() {
        let dest = tempfile::tempdir().unwrap();
        let digest = hex::encode(Sha256::digest(b"fake jar"));
        let manifest = format!(
            r#"{{"files":[{{"path":"mods/a.jar","sha256":"{}"}}]}}"#,
            digest
        );
        let bytes = build_archive(&[
            (MANIFEST_NAME, manifest.as_bytes()),
            ("mods/a.jar", b"fake jar"),
        ]);

        let report = extract(&bytes, dest.path()).unwrap();
        assert_eq!(report.verified, 1);
    }

    #[test]
    fn test_manifest_checksum_mismatch_aborts() {
        let dest = tempfile::tempdir().unwrap();
        let manifest = format!(
            r#"{{"files":[{{"path":"mods/a.jar","sha256":"{}"}}]}}"#,
            "0".repeat(64)
        );
        let bytes = build_archive(&[
            (MANIFEST_NAME, manifest.as_bytes()),
            ("mods/a.jar", b"fake jar"),
        ]);

        match extract(&bytes, dest.path()) {
            Err(ArchiveError::Integrity { path, .. }) => assert_eq!(path, "mods/a.jar"),
            other => panic!("expected Integrity, got {:?}", other),
        }
        // 검증 실패한 파일은 기록되지 않음
        assert!(!dest.path().join("mods/a.jar").exists());
    }

    #[test]
    fn test_compress_is_deterministic() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        // same tree, files created in different order
        for (dir, order) in [(&a, ["z.txt", "a.txt"]), (&b, ["a.txt", "z.txt"])] {
            std::fs::create_dir_all(dir.path().join("sub")).unwrap();
            for name in order {
                std::fs::write(dir.path().join(name), b"same content").unwrap();
            }
            std::fs::write(dir.path().join("sub/nested.txt"), b"deep").unwrap();
        }

        assert_eq!(compress(a.path()).unwrap(), compress(b.path()).unwrap());
    }

    #[test]
    fn test_compress_then_extract() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("plugins")).unwrap();
        std::fs::write(src.path().join("plugins/essentials.jar"), b"jar bytes").unwrap();
        std::fs::write(src.path().join("server.properties"), b"motd=hi\n").unwrap();

        let bytes = compress(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let report = extract(&bytes, dest.path()).unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(
            std::fs::read(dest.path().join("plugins/essentials.jar")).unwrap(),
            b"jar bytes"
        );
    }
}
