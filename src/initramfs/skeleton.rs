//! Fixed directory tree and account databases of the initramfs.

use std::fs;
use std::path::{Path, PathBuf};

use super::binaries::resolve_in_root;
use crate::error::{Error, IoResultExt, Result};
use crate::layout::FsLayout;

const STANDARD_DIRS: &[&str] = &[
    "/bin", "/dev", "/etc", "/lib", "/lib64", "/proc", "/run", "/sbin", "/sys", "/tmp", "/usr/bin",
    "/usr/sbin", "/usr/lib", "/usr/lib64", "/var",
];

pub const PASSWD: &str = "root:x:0:0::/root:/bin/sh\nnobody:x:65534:65534::/:/sbin/nologin\n";

pub const GROUP: &str = "tty:x:5:\nkmem:x:9:\ndisk:x:6:adm\nfloppy:x:11:\ncdrom:x:19:\n";

/// Logical directories every image starts with.
pub fn skeleton_dirs(verstr: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = STANDARD_DIRS.iter().map(PathBuf::from).collect();
    dirs.push(PathBuf::from(format!("/lib/modules/{}", verstr)));
    dirs.push(PathBuf::from("/lib/firmware"));
    dirs
}

/// Create `logical` in `root` the way the host has it.
///
/// A directory that is a symlink on the host (`/lib64 -> lib`) becomes the
/// same symlink. One the host lacks is created as a plain directory.
pub fn install_dir(layout: &FsLayout, logical: &Path, root: &Path) -> Result<()> {
    let host = layout.host_path(logical);
    let dst = resolve_in_root(root, logical)?;
    if dst.symlink_metadata().is_ok() {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    match host.symlink_metadata() {
        Ok(md) if md.file_type().is_symlink() => {
            let target = fs::read_link(&host)
                .with_context(|| format!("Failed to read link {}", host.display()))?;
            std::os::unix::fs::symlink(&target, &dst)
                .with_context(|| format!("Failed to create symlink {}", dst.display()))?;
        }
        Ok(md) if !md.is_dir() => {
            return Err(Error::initramfs(format!(
                "{} is not a directory",
                host.display()
            )));
        }
        _ => {
            fs::create_dir_all(&dst)
                .with_context(|| format!("Failed to create {}", dst.display()))?;
        }
    }
    Ok(())
}

/// Lay down the directory skeleton, `sysroot` and the account stubs.
pub fn create_skeleton(layout: &FsLayout, root: &Path, verstr: &str) -> Result<()> {
    for dir in skeleton_dirs(verstr) {
        install_dir(layout, &dir, root)?;
    }
    let sysroot = root.join("sysroot");
    fs::create_dir_all(&sysroot)
        .with_context(|| format!("Failed to create {}", sysroot.display()))?;

    let etc = root.join("etc");
    fs::write(etc.join("passwd"), PASSWD)
        .with_context(|| format!("Failed to write {}", etc.join("passwd").display()))?;
    fs::write(etc.join("group"), GROUP)
        .with_context(|| format!("Failed to write {}", etc.join("group").display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn recreates_symlinked_dirs() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        let image = temp.path().join("image");
        fs::create_dir_all(host.join("usr/lib")).unwrap();
        fs::create_dir_all(host.join("lib")).unwrap();
        symlink("lib", host.join("lib64")).unwrap();
        symlink("usr/bin", host.join("bin")).unwrap();
        fs::create_dir_all(&image).unwrap();

        create_skeleton(&FsLayout::new(&host), &image, "6.1.0").unwrap();

        assert_eq!(fs::read_link(image.join("lib64")).unwrap(), PathBuf::from("lib"));
        assert_eq!(fs::read_link(image.join("bin")).unwrap(), PathBuf::from("usr/bin"));
        assert!(image.join("usr/bin").is_dir());
        assert!(image.join("lib/modules/6.1.0").is_dir());
        assert!(image.join("lib/firmware").is_dir());
        assert!(image.join("sysroot").is_dir());
        assert_eq!(fs::read_to_string(image.join("etc/passwd")).unwrap(), PASSWD);
        assert!(fs::read_to_string(image.join("etc/group"))
            .unwrap()
            .contains("disk:x:6:adm"));
    }

    #[test]
    fn rejects_file_where_dir_expected() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        let image = temp.path().join("image");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("var"), "").unwrap();
        fs::create_dir_all(&image).unwrap();

        let err = create_skeleton(&FsLayout::new(&host), &image, "6.1.0").unwrap_err();
        assert!(matches!(err, Error::InitramfsInstall(_)));
    }
}
