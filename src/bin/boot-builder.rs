use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use boot_builder::artifact::filesystem::copy_dir_recursive;
use boot_builder::config::{Config, TomlConfig, DEFAULT_CONFIG_DIR};
use boot_builder::preflight::{check_host, check_privileges, Operation};
use boot_builder::repo::{Atom, AtomExecutor, AtomKind};
use boot_builder::{BootEntry, BootManager, FsLayout, HostInfo, InitramfsOptions};
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST_FILE: &str = "host.toml";

fn usage() -> &'static str {
    "Usage:\n  boot-builder [--config-dir <dir>] [--host <file>] [--root <dir>] <command>\n\nCommands:\n  entries\n  check\n  clean [--pretend]\n  stable-flag [get]\n  stable-flag set <true|false>\n  mkinitramfs <work-dir> [--debug]\n  bootloader install\n  bootloader update\n  bootloader remove [--force]"
}

struct Options {
    config_dir: PathBuf,
    host_file: Option<PathBuf>,
    root: PathBuf,
    command: Vec<String>,
}

fn parse_options(args: Vec<String>) -> Result<Options> {
    let mut options = Options {
        config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
        host_file: None,
        root: PathBuf::from("/"),
        command: Vec::new(),
    };
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config-dir" => options.config_dir = option_value(&mut iter, &arg)?,
            "--host" => options.host_file = Some(option_value(&mut iter, &arg)?),
            "--root" => options.root = option_value(&mut iter, &arg)?,
            "-h" | "--help" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            _ => {
                options.command.push(arg);
                options.command.extend(iter.by_ref());
            }
        }
    }
    Ok(options)
}

fn option_value(iter: &mut impl Iterator<Item = String>, name: &str) -> Result<PathBuf> {
    iter.next()
        .map(PathBuf::from)
        .with_context(|| format!("{} needs a value\n\n{}", name, usage()))
}

fn load_host(options: &Options) -> Result<Option<HostInfo>> {
    let (path, explicit) = match &options.host_file {
        Some(path) => (path.clone(), true),
        None => (options.config_dir.join(DEFAULT_HOST_FILE), false),
    };
    if !explicit && !path.exists() {
        return Ok(None);
    }
    let host = HostInfo::load(&path)
        .with_context(|| format!("loading host description '{}'", path.display()))?;
    host.validate()?;
    Ok(Some(host))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let options = parse_options(std::env::args().skip(1).collect())?;
    let layout = FsLayout::new(&options.root);
    let config = TomlConfig::load(&options.config_dir).with_context(|| {
        format!("loading configuration from '{}'", options.config_dir.display())
    })?;
    let host = load_host(&options)?;
    let manager = BootManager::new(layout.clone(), &config, host);

    let command: Vec<&str> = options.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["entries"] => {
            check_host(&layout, Operation::Inspect)?;
            print_entries(&manager)
        }
        ["check"] => {
            check_host(&layout, Operation::Inspect)?;
            run_check(&manager)
        }
        ["clean"] => clean(&manager, &layout, false),
        ["clean", "--pretend"] => clean(&manager, &layout, true),
        ["stable-flag"] | ["stable-flag", "get"] => {
            println!("{}", manager.stable_flag()?);
            Ok(())
        }
        ["stable-flag", "set", value] => {
            let value: bool = value
                .parse()
                .with_context(|| format!("'{}' is not true or false", value))?;
            check_privileges(&layout)?;
            Ok(manager.set_stable_flag(value)?)
        }
        ["mkinitramfs", work_dir] => mkinitramfs(&manager, &config, &layout, work_dir, false),
        ["mkinitramfs", work_dir, "--debug"] => {
            mkinitramfs(&manager, &config, &layout, work_dir, true)
        }
        ["bootloader", action @ ..] => bootloader(&manager, &layout, action),
        _ => bail!(usage()),
    }
}

fn print_entries(manager: &BootManager) -> Result<()> {
    let pending = manager.pending_entry()?;
    let current = manager.current_entry()?;
    for entry in manager.boot_entries()? {
        let mut marks = Vec::new();
        if Some(&entry) == current.as_ref() {
            marks.push("current");
        }
        if Some(&entry) == pending.as_ref() {
            marks.push("pending");
        }
        if !entry.is_complete() {
            marks.push("incomplete");
        }
        if marks.is_empty() {
            println!("{}", entry.postfix());
        } else {
            println!("{} ({})", entry.postfix(), marks.join(", "));
        }
    }
    for entry in manager.history_entries()? {
        println!("{} (history)", entry.postfix());
    }
    Ok(())
}

fn run_check(manager: &BootManager) -> Result<()> {
    let issues = manager.check()?;
    for issue in &issues {
        println!("{}", issue);
    }
    if !issues.is_empty() {
        bail!("{} problem(s) found", issues.len());
    }
    println!("No problems found.");
    Ok(())
}

fn clean(manager: &BootManager, layout: &FsLayout, pretend: bool) -> Result<()> {
    check_host(layout, Operation::Initramfs)?;
    if !pretend {
        check_privileges(layout)?;
    }
    let plan = manager.clean(pretend)?;
    if plan.is_empty() {
        println!("Nothing to clean.");
    }
    Ok(())
}

/// Unpacks an initramfs program already present in a local directory.
struct LocalDirectory {
    dir: PathBuf,
}

impl AtomExecutor for LocalDirectory {
    fn fetch(&self, _atom: &Atom) -> boot_builder::Result<()> {
        Ok(())
    }

    fn unpack(&self, _atom: &Atom, work_dir: &Path) -> boot_builder::Result<()> {
        copy_dir_recursive(&self.dir, work_dir)
    }

    fn install_kernel(
        &self,
        kernel: &Atom,
        _addons: &[Atom],
        _entry: &BootEntry,
    ) -> boot_builder::Result<()> {
        Err(boot_builder::Error::config(format!(
            "{} cannot be installed from a local directory",
            kernel
        )))
    }
}

fn mkinitramfs(
    manager: &BootManager,
    config: &TomlConfig,
    layout: &FsLayout,
    work_dir: &str,
    debug: bool,
) -> Result<()> {
    check_host(layout, Operation::Initramfs)?;
    check_privileges(layout)?;
    let entry = manager
        .newest_entry()?
        .context("no kernel installed in the boot directory")?;
    let executor = LocalDirectory {
        dir: PathBuf::from(work_dir),
    };
    let atom = Atom {
        kernel_type: config.kernel_type(),
        kind: AtomKind::Initramfs,
        name: config.initramfs_name().to_string(),
        verstr: "local".to_string(),
    };
    let options = InitramfsOptions {
        debug,
        ..InitramfsOptions::default()
    };
    manager
        .install_initramfs(&executor, &atom, &entry, options)
        .with_context(|| format!("building initramfs for {}", entry))?;
    println!("Installed {}", entry.initrd_filepath().display());
    Ok(())
}

fn bootloader(manager: &BootManager, layout: &FsLayout, action: &[&str]) -> Result<()> {
    match action {
        ["install"] => {
            check_host(layout, Operation::Bootloader)?;
            check_privileges(layout)?;
            Ok(manager.install_bootloader()?)
        }
        ["update"] => {
            check_host(layout, Operation::Inspect)?;
            check_privileges(layout)?;
            Ok(manager.update_bootloader()?)
        }
        ["remove"] => {
            check_privileges(layout)?;
            Ok(manager.remove_bootloader(false)?)
        }
        ["remove", "--force"] => {
            check_privileges(layout)?;
            Ok(manager.remove_bootloader(true)?)
        }
        _ => bail!(usage()),
    }
}
