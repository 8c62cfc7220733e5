//! Local directory sources.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{PluginError, PluginResult};
use crate::manifest::MANIFEST_FILE_NAME;

/// Directories never copied into staging.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules"];

/// Check that `path` is a plugin directory and return its canonical form.
pub(super) fn locate(path: &Path) -> PluginResult<PathBuf> {
    let not_found = |reason: &str| PluginError::SourceNotFound {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let root = path
        .canonicalize()
        .map_err(|_| not_found("path does not exist"))?;
    if !root.is_dir() {
        return Err(not_found("not a directory"));
    }
    if !root.join(MANIFEST_FILE_NAME).is_file() {
        return Err(not_found("no plugin.toml in directory"));
    }
    Ok(root)
}

/// Copy the tree under `root` into `dest`.
///
/// Symlinks are followed only when their target stays inside `root`; the
/// copy holds regular files.
pub(super) fn copy_tree(root: &Path, dest: &Path) -> PluginResult<()> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIPPED_DIRS.iter().any(|d| e.file_name() == *d))
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            PluginError::io(
                format!("failed to walk {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| PluginError::PathTraversal {
                path: entry.path().display().to_string(),
            })?;
        let target = dest.join(rel);

        let source = if entry.path_is_symlink() {
            let resolved = entry.path().canonicalize().map_err(|e| {
                PluginError::io(format!("dangling symlink {}", entry.path().display()), e)
            })?;
            if !resolved.starts_with(root) {
                return Err(PluginError::PathTraversal {
                    path: entry.path().display().to_string(),
                });
            }
            resolved
        } else {
            entry.path().to_path_buf()
        };

        if source.is_dir() {
            if entry.path_is_symlink() {
                // Directory links inside the root would duplicate content
                // or loop; the real directory is copied on its own.
                continue;
            }
            std::fs::create_dir_all(&target)
                .map_err(|e| PluginError::io(format!("failed to create {}", target.display()), e))?;
        } else {
            std::fs::copy(&source, &target).map_err(|e| {
                PluginError::io(format!("failed to copy {}", source.display()), e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dir_and_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, PluginError::SourceNotFound { .. }));

        let err = locate(dir.path()).unwrap_err();
        assert!(err.to_string().contains("plugin.toml"));
    }

    #[test]
    fn copies_tree_skipping_vcs_and_modules() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("plugin.toml"), "m").unwrap();
        std::fs::create_dir_all(src.path().join("src/lib")).unwrap();
        std::fs::write(src.path().join("src/lib/a.ts"), "a").unwrap();
        std::fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/dep")).unwrap();
        std::fs::write(src.path().join("node_modules/dep/index.js"), "d").unwrap();

        let root = locate(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        copy_tree(&root, dest.path()).unwrap();

        assert!(dest.path().join("plugin.toml").is_file());
        assert_eq!(
            std::fs::read_to_string(dest.path().join("src/lib/a.ts")).unwrap(),
            "a"
        );
        assert!(!dest.path().join(".git").exists());
        assert!(!dest.path().join("node_modules").exists());
    }

    #[cfg(unix)]
    #[test]
    fn escaping_symlink_is_refused() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("plugin.toml"), "m").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), src.path().join("leak"))
            .unwrap();

        let root = locate(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let err = copy_tree(&root, dest.path()).unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn internal_symlink_is_copied_as_file() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("plugin.toml"), "m").unwrap();
        std::fs::write(src.path().join("real.js"), "r").unwrap();
        std::os::unix::fs::symlink(src.path().join("real.js"), src.path().join("alias.js"))
            .unwrap();

        let root = locate(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        copy_tree(&root, dest.path()).unwrap();
        let alias = dest.path().join("alias.js");
        assert!(!alias.is_symlink());
        assert_eq!(std::fs::read_to_string(alias).unwrap(), "r");
    }
}
