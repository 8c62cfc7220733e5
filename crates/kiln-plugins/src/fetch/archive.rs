//! Bundle extraction.
//!
//! Registry bundles are gzip-compressed tarballs or zip archives, told
//! apart by their magic bytes. Extraction refuses absolute paths, `..`
//! components, links and device entries, and caps both the entry count
//! and the total unpacked size. When every entry lives under one
//! top-level directory, that directory becomes the source root.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::error::{PluginError, PluginResult};

/// Maximum entries in one bundle.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total unpacked size (200 MB).
const MAX_EXTRACTED_SIZE: u64 = 200_000_000;

/// Whether `data` starts with the gzip magic number.
#[must_use]
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

/// Whether `data` starts with a zip local file header.
#[must_use]
pub fn is_zip(data: &[u8]) -> bool {
    data.starts_with(b"PK\x03\x04")
}

/// Extract a registry bundle of either supported format into `dest` and
/// return the source root.
///
/// # Errors
///
/// As for [`extract_tar_gz`] and [`extract_zip`], or
/// [`PluginError::FetchFailed`] if `data` is in neither format.
pub fn extract_bundle(label: &str, data: &[u8], dest: &Path) -> PluginResult<PathBuf> {
    if is_gzip(data) {
        extract_tar_gz(label, data, dest)
    } else if is_zip(data) {
        extract_zip(label, data, dest)
    } else {
        Err(PluginError::FetchFailed {
            source_desc: label.to_string(),
            message: "bundle is neither a gzip-compressed tarball nor a zip archive".into(),
        })
    }
}

/// Reject absolute paths and anything but plain components.
fn check_relative(entry_path: &Path, display: &str) -> PluginResult<()> {
    if entry_path.is_absolute()
        || entry_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(PluginError::PathTraversal {
            path: display.to_string(),
        });
    }
    Ok(())
}

/// Extract a `.tar.gz` into `dest` and return the source root.
///
/// # Errors
///
/// Returns [`PluginError::PathTraversal`] or
/// [`PluginError::UnsafeEntryType`] for hostile entries, and
/// [`PluginError::FetchFailed`] for corrupt or oversized archives.
pub fn extract_tar_gz(label: &str, data: &[u8], dest: &Path) -> PluginResult<PathBuf> {
    let failed = |message: String| PluginError::FetchFailed {
        source_desc: label.to_string(),
        message,
    };

    let mut archive = Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let dest = dest
        .canonicalize()
        .map_err(|e| failed(format!("failed to canonicalize staging dir: {e}")))?;

    let mut entry_count = 0usize;
    let mut total_size: u64 = 0;

    let entries = archive
        .entries()
        .map_err(|e| failed(format!("failed to read archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| failed(format!("failed to read archive entry: {e}")))?;

        entry_count = entry_count.saturating_add(1);
        if entry_count > MAX_ENTRY_COUNT {
            return Err(failed(format!(
                "archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"
            )));
        }

        let entry_path = entry
            .path()
            .map_err(|e| failed(format!("failed to read entry path: {e}")))?
            .into_owned();
        let display = entry_path.display().to_string();

        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Regular | EntryType::Directory => {},
            // Metadata records; the tar crate folds them into the next entry.
            EntryType::GNULongName | EntryType::XHeader | EntryType::XGlobalHeader => continue,
            other => {
                return Err(PluginError::UnsafeEntryType {
                    path: display,
                    entry_type: format!("{other:?}"),
                });
            },
        }

        check_relative(&entry_path, &display)?;

        let size = entry
            .header()
            .size()
            .map_err(|e| failed(format!("failed to read entry size: {e}")))?;
        total_size = total_size.saturating_add(size);
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(failed(format!(
                "archive exceeds maximum extracted size ({MAX_EXTRACTED_SIZE} bytes)"
            )));
        }

        let target = dest.join(&entry_path);
        if !target.starts_with(&dest) {
            return Err(PluginError::PathTraversal { path: display });
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PluginError::io(format!("failed to create {}", parent.display()), e))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| failed(format!("failed to unpack {display}: {e}")))?;
    }

    if entry_count == 0 {
        return Err(failed("archive is empty".into()));
    }

    single_top_level_dir(&dest)
}

/// Extract a zip archive into `dest` and return the source root.
///
/// # Errors
///
/// Returns [`PluginError::PathTraversal`] or
/// [`PluginError::UnsafeEntryType`] for hostile entries, and
/// [`PluginError::FetchFailed`] for corrupt or oversized archives.
pub fn extract_zip(label: &str, data: &[u8], dest: &Path) -> PluginResult<PathBuf> {
    let failed = |message: String| PluginError::FetchFailed {
        source_desc: label.to_string(),
        message,
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| failed(format!("failed to read archive: {e}")))?;
    if archive.len() > MAX_ENTRY_COUNT {
        return Err(failed(format!(
            "archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"
        )));
    }
    if archive.is_empty() {
        return Err(failed("archive is empty".into()));
    }

    let dest = dest
        .canonicalize()
        .map_err(|e| failed(format!("failed to canonicalize staging dir: {e}")))?;
    let mut total_size: u64 = 0;

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| failed(format!("failed to read archive entry: {e}")))?;
        let display = file.name().to_string();

        if file.is_symlink() {
            return Err(PluginError::UnsafeEntryType {
                path: display,
                entry_type: "Symlink".into(),
            });
        }
        let entry_path = file
            .enclosed_name()
            .ok_or_else(|| PluginError::PathTraversal {
                path: display.clone(),
            })?;
        check_relative(&entry_path, &display)?;

        let target = dest.join(&entry_path);
        if !target.starts_with(&dest) {
            return Err(PluginError::PathTraversal { path: display });
        }
        if file.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| PluginError::io(format!("failed to create {}", target.display()), e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PluginError::io(format!("failed to create {}", parent.display()), e))?;
        }

        // Declared sizes can lie; count what actually comes out.
        let budget = MAX_EXTRACTED_SIZE.saturating_sub(total_size);
        let mut out = std::fs::File::create(&target)
            .map_err(|e| PluginError::io(format!("failed to create {}", target.display()), e))?;
        let written = std::io::copy(&mut (&mut file).take(budget.saturating_add(1)), &mut out)
            .map_err(|e| failed(format!("failed to unpack {display}: {e}")))?;
        total_size = total_size.saturating_add(written);
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(failed(format!(
                "archive exceeds maximum extracted size ({MAX_EXTRACTED_SIZE} bytes)"
            )));
        }
    }

    single_top_level_dir(&dest)
}

/// `dest/<only>` if `dest` holds exactly one directory and nothing else.
fn single_top_level_dir(dest: &Path) -> PluginResult<PathBuf> {
    let mut entries = std::fs::read_dir(dest)
        .map_err(|e| PluginError::io(format!("failed to list {}", dest.display()), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PluginError::io(format!("failed to list {}", dest.display()), e))?;

    if entries.len() == 1
        && let Some(only) = entries.pop()
        && only.file_type().is_ok_and(|t| t.is_dir())
    {
        return Ok(only.path());
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn unwraps_single_top_level_dir() {
        let data = tarball(&[
            ("package/plugin.toml", b"x"),
            ("package/index.js", b"y"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let root = extract_tar_gz("t", &data, dir.path()).unwrap();
        assert!(root.ends_with("package"));
        assert!(root.join("plugin.toml").is_file());
    }

    #[test]
    fn flat_archive_keeps_dest_as_root() {
        let data = tarball(&[("plugin.toml", b"x"), ("index.js", b"y")]);
        let dir = tempfile::tempdir().unwrap();
        let root = extract_tar_gz("t", &data, dir.path()).unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn rejects_parent_components() {
        // `append_data` refuses `..`, so write the raw header by hand.
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(EntryType::Regular);
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();

        let mut raw = Vec::new();
        raw.extend_from_slice(header.as_bytes());
        let mut block = [0u8; 512];
        block[0] = b'z';
        raw.extend_from_slice(&block);
        raw.extend_from_slice(&[0u8; 1024]);

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&raw).unwrap();
        let data = gz.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = extract_tar_gz("t", &data, dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }), "{err}");
    }

    #[test]
    fn rejects_symlinks() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "link", "/etc/passwd")
            .unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = extract_tar_gz("t", &data, dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::UnsafeEntryType { .. }), "{err}");
    }

    fn zipped(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (path, body) in files {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn zip_bundles_extract_like_tarballs() {
        let data = zipped(&[
            ("package/plugin.toml", b"x"),
            ("package/src/index.js", b"y"),
        ]);
        assert!(is_zip(&data));
        let dir = tempfile::tempdir().unwrap();
        let root = extract_bundle("t", &data, dir.path()).unwrap();
        assert!(root.ends_with("package"));
        assert_eq!(std::fs::read(root.join("src/index.js")).unwrap(), b"y");
    }

    #[test]
    fn zip_rejects_escaping_names() {
        let data = zipped(&[("../escape.txt", b"z")]);
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip("t", &data, dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }), "{err}");
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn zip_rejects_symlinks() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_symlink("link", "/etc/passwd", zip::write::SimpleFileOptions::default())
            .unwrap();
        let data = writer.finish().unwrap().into_inner();

        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip("t", &data, dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::UnsafeEntryType { .. }), "{err}");
    }

    #[test]
    fn unknown_bundle_format_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_bundle("t", b"plain text", dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::FetchFailed { .. }), "{err}");
    }

    #[test]
    fn garbage_is_a_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_tar_gz("t", b"\x1f\x8bnot really", dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::FetchFailed { .. }));
        assert!(is_gzip(b"\x1f\x8b..."));
        assert!(!is_gzip(b"PK\x03\x04"));
    }
}
