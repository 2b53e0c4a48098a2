//! Copying host files into the initramfs tree.
//!
//! Binaries are copied with their shared library closure (from `ldd`).
//! Symlink chains are reproduced link by link so the image contains the
//! same names the host uses. Nothing already present in the tree is
//! overwritten, which keeps repeated installs of shared libraries cheap.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::layout::{relative_to_root, FsLayout};
use crate::process::Cmd;

const MAX_LINK_HOPS: usize = 40;

/// Shared libraries a dynamically linked binary needs.
pub trait LibraryDeps {
    /// Absolute library paths; empty for static binaries.
    fn libraries(&self, binary: &Path) -> Result<Vec<PathBuf>>;
}

/// [`LibraryDeps`] backed by `ldd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ldd;

impl LibraryDeps for Ldd {
    fn libraries(&self, binary: &Path) -> Result<Vec<PathBuf>> {
        let result = Cmd::new("ldd")
            .arg_path(binary)
            .allow_fail() // static binaries make ldd exit 1
            .run()?;
        let output = result.combined_output();
        if is_static(&output) {
            return Ok(Vec::new());
        }
        if !result.success() {
            return Err(Error::Command {
                program: "ldd".to_string(),
                status: format!("{:?}", result.code),
                message: format!("failed to list libraries of {}", binary.display()),
                output,
            });
        }
        Ok(parse_ldd(&result.stdout))
    }
}

fn is_static(output: &str) -> bool {
    output.contains("statically linked") || output.contains("not a dynamic executable")
}

/// Library paths from `ldd` output.
///
/// Handles both `\tlibc.so.6 => /lib64/libc.so.6 (0x...)` and the loader
/// line `\t/lib64/ld-linux-x86-64.so.2 (0x...)`. The vDSO has no file and
/// is dropped.
pub fn parse_ldd(output: &str) -> Vec<PathBuf> {
    if is_static(output) {
        return Vec::new();
    }
    let mut libs = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("linux-vdso.so") || line.starts_with("linux-gate.so")
        {
            continue;
        }
        let candidate = match line.split_once("=>") {
            Some((_, after)) => after.split_whitespace().next(),
            None => line.split_whitespace().next(),
        };
        if let Some(path) = candidate.filter(|p| p.starts_with('/')) {
            let path = PathBuf::from(path);
            if !libs.contains(&path) {
                libs.push(path);
            }
        }
    }
    libs
}

/// Find a binary in the host root.
///
/// Searches usr/bin, bin, usr/sbin, sbin in order and returns the logical
/// path (e.g. `/usr/bin/bash`).
pub fn find_binary(layout: &FsLayout, name: &str) -> Option<PathBuf> {
    ["/usr/bin", "/bin", "/usr/sbin", "/sbin"]
        .into_iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| layout.host_path(candidate).exists())
}

/// Lexically resolve `.` and `..` in an absolute path.
pub fn normalize_logical(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Where `logical` lives inside the tree at `root`.
///
/// Symlinks already present in the tree are followed with absolute
/// targets re-rooted at `root`, so a `bin -> /usr/bin` link in the image
/// never leads outside it.
pub fn resolve_in_root(root: &Path, logical: &Path) -> Result<PathBuf> {
    let mut pending: Vec<PathBuf> = relative_to_root(logical)
        .components()
        .rev()
        .map(|c| PathBuf::from(c.as_os_str()))
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part == Path::new("..") {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let host = root.join(&candidate);
        // The last component is the entry itself and is never followed.
        let is_last = pending.is_empty();
        match host.symlink_metadata() {
            Ok(md) if md.file_type().is_symlink() && !is_last => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(Error::initramfs(format!(
                        "too many levels of symbolic links resolving {}",
                        logical.display()
                    )));
                }
                let target = fs::read_link(&host)
                    .with_context(|| format!("Failed to read link {}", host.display()))?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                for c in relative_to_root(&target).components().rev() {
                    pending.push(PathBuf::from(c.as_os_str()));
                }
            }
            _ => resolved = candidate,
        }
    }
    Ok(root.join(resolved))
}

/// Copy `logical` (and every link in its symlink chain) from the host root
/// into the tree at `root`. Existing destinations are left untouched.
pub fn copy_to_initrd(layout: &FsLayout, logical: &Path, root: &Path) -> Result<()> {
    let mut current = normalize_logical(logical);
    for _ in 0..MAX_LINK_HOPS {
        let src = layout.host_path(&current);
        let md = src
            .symlink_metadata()
            .with_context(|| format!("{} does not exist", src.display()))?;
        let dst = resolve_in_root(root, &current)?;
        let present = dst.symlink_metadata().is_ok();

        if !present {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        if md.file_type().is_symlink() {
            let target = fs::read_link(&src)
                .with_context(|| format!("Failed to read link {}", src.display()))?;
            if !present {
                std::os::unix::fs::symlink(&target, &dst)
                    .with_context(|| format!("Failed to create symlink {}", dst.display()))?;
            }
            current = match current.parent() {
                Some(parent) => normalize_logical(&parent.join(&target)),
                None => normalize_logical(&target),
            };
            continue;
        }

        if !present {
            tracing::debug!("copying {}", current.display());
            fs::copy(&src, &dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
        }
        return Ok(());
    }
    Err(Error::initramfs(format!(
        "too many levels of symbolic links copying {}",
        logical.display()
    )))
}

/// Copy a host binary and its shared libraries.
pub fn install_bin(
    layout: &FsLayout,
    logical: &Path,
    root: &Path,
    deps: &dyn LibraryDeps,
) -> Result<()> {
    copy_to_initrd(layout, logical, root)?;
    for lib in deps.libraries(&layout.host_path(logical))? {
        copy_to_initrd(layout, &lib, root)?;
    }
    Ok(())
}

/// Install an executable that is not part of the host root (the init
/// program) at `dest` inside the tree, replacing any previous copy.
pub fn install_external_bin(
    src: &Path,
    dest: &Path,
    layout: &FsLayout,
    root: &Path,
    deps: &dyn LibraryDeps,
) -> Result<()> {
    let dst = root.join(relative_to_root(dest));
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(&dst).with_context(|| format!("Failed to replace {}", dst.display()))?;
    }
    fs::copy(src, &dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    fs::set_permissions(&dst, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to chmod {}", dst.display()))?;
    for lib in deps.libraries(&dst)? {
        copy_to_initrd(layout, &lib, root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct NoLibs;

    impl LibraryDeps for NoLibs {
        fn libraries(&self, _: &Path) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn parses_both_ldd_styles() {
        let output = "\
\tlinux-vdso.so.1 (0x00007ffd2b9e6000)
\tlibtinfo.so.6 => /lib64/libtinfo.so.6 (0x00007f0e1c9a1000)
\tlibc.so.6 => /lib64/libc.so.6 (0x00007f0e1c7c0000)
\t/lib64/ld-linux-x86-64.so.2 (0x00007f0e1cb1f000)
";
        assert_eq!(
            parse_ldd(output),
            [
                PathBuf::from("/lib64/libtinfo.so.6"),
                PathBuf::from("/lib64/libc.so.6"),
                PathBuf::from("/lib64/ld-linux-x86-64.so.2"),
            ]
        );
        assert!(parse_ldd("\tstatically linked\n").is_empty());
        assert!(parse_ldd("\tnot a dynamic executable\n").is_empty());
    }

    #[test]
    fn normalizes_dot_dot() {
        assert_eq!(
            normalize_logical(Path::new("/usr/lib/../lib64/./libc.so")),
            PathBuf::from("/usr/lib64/libc.so")
        );
    }

    #[test]
    fn follows_symlink_chain() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        let image = temp.path().join("image");
        fs::create_dir_all(host.join("lib64")).unwrap();
        fs::create_dir_all(&image).unwrap();
        fs::write(host.join("lib64/libz.so.1.3"), "zlib").unwrap();
        symlink("libz.so.1.3", host.join("lib64/libz.so.1")).unwrap();

        let layout = FsLayout::new(&host);
        copy_to_initrd(&layout, Path::new("/lib64/libz.so.1"), &image).unwrap();

        assert_eq!(
            fs::read_link(image.join("lib64/libz.so.1")).unwrap(),
            PathBuf::from("libz.so.1.3")
        );
        assert_eq!(fs::read_to_string(image.join("lib64/libz.so.1.3")).unwrap(), "zlib");
    }

    #[test]
    fn never_overwrites() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        let image = temp.path().join("image");
        fs::create_dir_all(host.join("bin")).unwrap();
        fs::create_dir_all(image.join("bin")).unwrap();
        fs::write(host.join("bin/sh"), "new").unwrap();
        fs::write(image.join("bin/sh"), "old").unwrap();

        let layout = FsLayout::new(&host);
        install_bin(&layout, Path::new("/bin/sh"), &image, &NoLibs).unwrap();
        assert_eq!(fs::read_to_string(image.join("bin/sh")).unwrap(), "old");
    }

    #[test]
    fn absolute_links_in_image_stay_inside() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("image");
        fs::create_dir_all(image.join("usr/bin")).unwrap();
        symlink("/usr/bin", image.join("bin")).unwrap();

        assert_eq!(
            resolve_in_root(&image, Path::new("/bin/bash")).unwrap(),
            image.join("usr/bin/bash")
        );
    }

    #[test]
    fn finds_binary() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("usr/sbin")).unwrap();
        fs::write(temp.path().join("usr/sbin/lvm"), "").unwrap();
        let layout = FsLayout::new(temp.path());

        assert_eq!(find_binary(&layout, "lvm"), Some(PathBuf::from("/usr/sbin/lvm")));
        assert_eq!(find_binary(&layout, "nonexistent"), None);
    }

    #[test]
    fn external_bin_is_executable() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("image");
        fs::create_dir_all(&image).unwrap();
        let init = temp.path().join("init");
        fs::write(&init, "#!/bin/sh\n").unwrap();

        let layout = FsLayout::new(temp.path().join("host"));
        install_external_bin(&init, Path::new("/init"), &layout, &image, &NoLibs).unwrap();
        let mode = fs::metadata(image.join("init")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
