//! Filesystem utilities shared by the archive writers and the installers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::error::{IoResultExt, Result};

/// Every entry below `root` (not `root` itself), sorted by relative path.
///
/// Symlinks are listed, not followed. The order is what makes archives of
/// identical trees byte-identical.
pub fn sorted_entries(root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry?;
        entries.push(entry.path().to_path_buf());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(root).unwrap_or(a);
        let rb = b.strip_prefix(root).unwrap_or(b);
        ra.as_os_str().cmp(rb.as_os_str())
    });
    Ok(entries)
}

/// Recursively copy a directory, preserving symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", src.display()))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("Failed to stat {}", src_path.display()))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("Failed to read link {}", src_path.display()))?;
            if dst_path.symlink_metadata().is_ok() {
                fs::remove_file(&dst_path)
                    .with_context(|| format!("Failed to replace {}", dst_path.display()))?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// Temporary sibling of `dst` used while an artifact is being written.
pub fn temp_sibling(dst: &Path) -> PathBuf {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{}.tmp-{}", name, n))
}

/// Atomically move a file by renaming, with fallback to copy+delete.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Write `contents` to `dst` through a temporary sibling and a rename.
pub fn atomic_write(dst: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_sibling(dst);
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = atomic_move(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<()> {
    let Ok(md) = path.symlink_metadata() else {
        return Ok(());
    };
    if md.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn truncate_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}

/// Create `dir` empty, removing whatever was there.
pub fn make_empty_dir(dir: &Path) -> Result<()> {
    remove_path(dir)?;
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_recursive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::write(src.join("file.txt"), "hello").unwrap();
        fs::write(src.join("subdir/nested.txt"), "world").unwrap();
        std::os::unix::fs::symlink("file.txt", src.join("link")).unwrap();

        copy_dir_recursive(&src, &dst).unwrap();

        assert!(dst.join("file.txt").exists());
        assert!(dst.join("subdir/nested.txt").exists());
        assert!(dst.join("link").is_symlink());
        assert_eq!(fs::read_link(dst.join("link")).unwrap().to_str().unwrap(), "file.txt");
    }

    #[test]
    fn test_sorted_entries() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("b/c")).unwrap();
        fs::write(temp.path().join("a"), "").unwrap();
        fs::write(temp.path().join("b/c/d"), "").unwrap();

        let rel: Vec<_> = sorted_entries(temp.path())
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(temp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rel,
            [
                PathBuf::from("a"),
                PathBuf::from("b"),
                PathBuf::from("b/c"),
                PathBuf::from("b/c/d")
            ]
        );
    }

    #[test]
    fn test_atomic_write_replaces() {
        let temp = TempDir::new().unwrap();
        let dst = temp.path().join("grub.cfg");
        fs::write(&dst, "old").unwrap();
        atomic_write(&dst, b"new").unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_truncate_and_empty_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("boot");
        fs::create_dir_all(dir.join("grub")).unwrap();
        fs::write(dir.join("kernel-x"), "").unwrap();
        std::os::unix::fs::symlink("/nonexistent", dir.join("dangling")).unwrap();

        truncate_dir(&dir).unwrap();
        assert!(dir.exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        fs::write(dir.join("x"), "").unwrap();
        make_empty_dir(&dir).unwrap();
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        remove_path(&temp.path().join("missing")).unwrap();
    }
}
