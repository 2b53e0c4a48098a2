//! Debug images: a shell instead of the init program.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use super::binaries::{find_binary, install_bin, LibraryDeps};
use crate::artifact::filesystem::copy_dir_recursive;
use crate::error::{Error, IoResultExt, Result};
use crate::layout::{relative_to_root, FsLayout};

const DEBUG_TOOLS: &[&str] = &[
    "bash", "cat", "cp", "dd", "echo", "ls", "ln", "mount", "ps", "rm", "touch", "basename",
    "dirname", "find", "sleep", "tree", "xargs", "hexdump", "blkid", "switch_root", "lsmod",
    "modinfo", "modprobe", "dmsetup", "lvm",
];

const OPTIONAL_DEBUG_TOOLS: &[&str] = &["nano"];

const AUTOLOAD_DRIVER_DIRS: &[&str] = &["usb", "hid", "input"];

/// `.bashrc` for the debug shell.
pub fn bashrc(verstr: &str) -> String {
    let mut buf = String::new();
    buf.push_str("echo \"<initramfs-debug> Mounting basic file systems\"\n");
    buf.push_str("mount -t sysfs none /sys\n");
    buf.push_str("mount -t proc none /proc\n");
    buf.push_str("mount -t devtmpfs none /dev\n");
    buf.push('\n');
    for dir in AUTOLOAD_DRIVER_DIRS {
        let _ = writeln!(buf, "echo \"<initramfs-debug> Loading all the {} drivers\"", dir);
        let _ = writeln!(
            buf,
            "find \"/lib/modules/{}/kernel/drivers/{}\" -name \"*.ko\" | xargs basename -a -s \".ko\" | xargs /sbin/modprobe -a",
            verstr, dir
        );
    }
    buf
}

/// Turn a finished tree at `root` into a debug image.
///
/// The whole module and firmware trees and the toolset are added, the init
/// program is kept as `init.bak` and `init` points at the bash that was
/// copied in.
pub fn install_debug_tools(
    layout: &FsLayout,
    root: &Path,
    verstr: &str,
    deps: &dyn LibraryDeps,
) -> Result<()> {
    tracing::info!("Adding debug tools to initramfs");

    let modules = Path::new("/lib/modules").join(verstr);
    copy_dir_recursive(&layout.host_path(&modules), &root.join(relative_to_root(&modules)))?;
    copy_dir_recursive(&layout.firmware_dir(), &root.join("lib/firmware"))?;

    let mut shell = None;
    for name in DEBUG_TOOLS {
        let bin = find_binary(layout, name).ok_or_else(|| {
            Error::initramfs(format!("debug tool \"{}\" not found on the host", name))
        })?;
        install_bin(layout, &bin, root, deps)?;
        if *name == "bash" {
            shell = Some(bin);
        }
    }
    let shell = shell.ok_or_else(|| Error::initramfs("bash is missing from the debug tools"))?;
    for name in OPTIONAL_DEBUG_TOOLS {
        if let Some(bin) = find_binary(layout, name) {
            install_bin(layout, &bin, root, deps)?;
        }
    }

    let modprobe_d = layout.host_path(Path::new("/etc/modprobe.d"));
    if modprobe_d.is_dir() {
        copy_dir_recursive(&modprobe_d, &root.join("etc/modprobe.d"))?;
    }

    let init = root.join("init");
    fs::rename(&init, root.join("init.bak"))
        .with_context(|| format!("Failed to rename {}", init.display()))?;
    std::os::unix::fs::symlink(&shell, &init)
        .with_context(|| format!("Failed to create symlink {}", init.display()))?;

    let rc = root.join(".bashrc");
    fs::write(&rc, bashrc(verstr)).with_context(|| format!("Failed to write {}", rc.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initramfs::skeleton::create_skeleton;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct NoLibs;

    impl LibraryDeps for NoLibs {
        fn libraries(&self, _: &Path) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn bashrc_loads_input_drivers() {
        let rc = bashrc("6.1.0");
        assert!(rc.starts_with("echo \"<initramfs-debug> Mounting basic file systems\"\n"));
        assert!(rc.contains("find \"/lib/modules/6.1.0/kernel/drivers/hid\" -name \"*.ko\""));
        assert_eq!(rc.matches("/sbin/modprobe -a\n").count(), 3);
    }

    #[test]
    fn init_becomes_shell() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        let image = temp.path().join("image");
        fs::create_dir_all(host.join("usr/bin")).unwrap();
        fs::create_dir_all(host.join("lib/modules/6.1.0/kernel")).unwrap();
        fs::write(host.join("lib/modules/6.1.0/modules.dep"), "").unwrap();
        fs::create_dir_all(host.join("lib/firmware")).unwrap();
        fs::write(host.join("lib/firmware/regulatory.db"), "db").unwrap();
        for tool in DEBUG_TOOLS {
            fs::write(host.join("usr/bin").join(tool), tool).unwrap();
        }
        fs::create_dir_all(&image).unwrap();

        let layout = FsLayout::new(&host);
        create_skeleton(&layout, &image, "6.1.0").unwrap();
        fs::write(image.join("init"), "real init").unwrap();

        install_debug_tools(&layout, &image, "6.1.0", &NoLibs).unwrap();

        assert_eq!(
            fs::read_link(image.join("init")).unwrap(),
            PathBuf::from("/usr/bin/bash")
        );
        assert!(image.join("usr/bin/bash").exists());
        assert_eq!(fs::read_to_string(image.join("init.bak")).unwrap(), "real init");
        assert!(image.join("usr/bin/lvm").exists());
        assert!(image.join("lib/modules/6.1.0/modules.dep").exists());
        assert!(image.join("lib/firmware/regulatory.db").exists());
        assert!(!image.join("usr/bin/nano").exists());
    }

    #[test]
    fn init_follows_bash_location() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        let image = temp.path().join("image");
        fs::create_dir_all(host.join("bin")).unwrap();
        fs::create_dir_all(host.join("usr/bin")).unwrap();
        fs::create_dir_all(host.join("lib/modules/6.1.0")).unwrap();
        fs::create_dir_all(host.join("lib/firmware")).unwrap();
        for tool in DEBUG_TOOLS {
            let dir = if *tool == "bash" { "bin" } else { "usr/bin" };
            fs::write(host.join(dir).join(tool), tool).unwrap();
        }
        fs::create_dir_all(&image).unwrap();
        fs::write(image.join("init"), "real init").unwrap();

        let layout = FsLayout::new(&host);
        install_debug_tools(&layout, &image, "6.1.0", &NoLibs).unwrap();

        let target = fs::read_link(image.join("init")).unwrap();
        assert_eq!(target, PathBuf::from("/bin/bash"));
        assert!(image.join("bin/bash").exists());
    }
}
