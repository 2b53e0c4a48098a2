//! `grub.cfg` generation.

use std::fmt::Write as _;

use crate::boot_entry::BootEntry;
use crate::host::{AuxOs, BootMode};

/// Kernel options every entry gets. The console is only wanted when
/// debugging the boot process.
const KERNEL_OPTIONS: &str = "console=ttynull";

/// Everything `grub.cfg` is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct MenuInputs<'a> {
    pub boot_mode: BootMode,
    /// Filesystem UUID GRUB loads the kernel from, or `lvm/{vg}-{lv}`.
    pub grub_root: &'a str,
    pub main_entry: &'a BootEntry,
    /// Complete history entries, newest first.
    pub history: &'a [BootEntry],
    pub aux_os: &'a [AuxOs],
    /// Seconds added to both timeouts.
    pub extra_wait_time: u32,
    /// Init command recorded in the initramfs; only noted in a comment.
    pub init_cmd: &'a str,
    pub kernel_cmdline: &'a str,
}

fn root_command(uuid: &str) -> String {
    if uuid.starts_with("lvm/") {
        format!("set root=({})", uuid)
    } else {
        format!("search --fs-uuid --no-floppy --set {}", uuid)
    }
}

fn linux_args(quiet: bool, cmdline: &str) -> String {
    let mut args = Vec::new();
    if quiet {
        args.push("quiet");
    }
    args.push(KERNEL_OPTIONS);
    if !cmdline.trim().is_empty() {
        args.push(cmdline.trim());
    }
    args.join(" ")
}

/// Directory of the boot files as GRUB sees it.
fn boot_prefix(mode: BootMode) -> &'static str {
    match mode {
        // the ESP is mounted at /boot and is GRUB's root
        BootMode::Efi => "",
        BootMode::Bios => "/boot",
    }
}

/// Render `grub.cfg`. Same inputs, same bytes.
pub fn render(inputs: &MenuInputs) -> String {
    let mut buf = String::new();
    let prefix = boot_prefix(inputs.boot_mode);
    let root_cmd = root_command(inputs.grub_root);

    buf.push_str("load_env\n");
    buf.push_str("if [ \"${recordfail}\" ] ; then\n");
    buf.push_str("  unset stable\n");
    buf.push_str("  save_env stable\n");
    buf.push_str("  unset recordfail\n");
    buf.push_str("  save_env recordfail\n");
    buf.push_str("fi\n");
    buf.push('\n');

    match inputs.boot_mode {
        BootMode::Efi => {
            buf.push_str("insmod efi_gop\n");
            buf.push_str("insmod efi_uga\n");
        }
        BootMode::Bios => buf.push_str("insmod vbe\n"),
    }
    buf.push_str("if [ \"${stable}\" ] ; then\n");
    buf.push_str("  set default=0\n");
    let _ = writeln!(buf, "  set timeout={}", inputs.extra_wait_time);
    buf.push_str("else\n");
    buf.push_str("  set default=1\n");
    let _ = writeln!(
        buf,
        "  if sleep --verbose --interruptible {} ; then",
        3 + inputs.extra_wait_time
    );
    buf.push_str("    set timeout=0\n");
    buf.push_str("  else\n");
    buf.push_str("    set timeout=-1\n");
    buf.push_str("  fi\n");
    buf.push_str("fi\n");
    buf.push('\n');

    buf.push_str("# These options are recorded in initramfs\n");
    let _ = writeln!(buf, "#   rootfs={}", inputs.grub_root);
    if !inputs.init_cmd.is_empty() {
        let _ = writeln!(buf, "#   init={}", inputs.init_cmd);
    }
    buf.push('\n');

    let main = inputs.main_entry;
    let _ = writeln!(buf, "menuentry \"Stable: Linux-{}\" {{", main.postfix());
    buf.push_str("  set gfxpayload=keep\n");
    buf.push_str("  set recordfail=1\n");
    buf.push_str("  save_env recordfail\n");
    let _ = writeln!(buf, "  {}", root_cmd);
    let _ = writeln!(
        buf,
        "  linux {}/{} {}",
        prefix,
        main.kernel_filename(),
        linux_args(true, inputs.kernel_cmdline)
    );
    let _ = writeln!(buf, "  initrd {}/{}", prefix, main.initrd_filename());
    buf.push_str("}\n");
    buf.push('\n');

    let _ = writeln!(buf, "menuentry \"Current: Linux-{}\" {{", main.postfix());
    write_verbose_entry(&mut buf, &root_cmd, prefix, main, inputs.kernel_cmdline);

    for entry in inputs.history {
        let _ = writeln!(buf, "menuentry \"History: Linux-{}\" {{", entry.postfix());
        let history_prefix = format!("{}/history", prefix);
        write_verbose_entry(&mut buf, &root_cmd, &history_prefix, entry, inputs.kernel_cmdline);
    }

    for aux in inputs.aux_os {
        let _ = writeln!(buf, "menuentry \"Auxillary: {}\" {{", aux.name);
        let _ = writeln!(buf, "  {}", root_command(&aux.partition_uuid));
        let _ = writeln!(buf, "  chainloader +{}", aux.chainloader_number);
        buf.push_str("}\n");
        buf.push('\n');
    }

    buf.push_str("menuentry \"Restart\" {\n");
    buf.push_str("    reboot\n");
    buf.push_str("}\n");
    buf.push('\n');

    if inputs.boot_mode == BootMode::Efi {
        buf.push_str("menuentry \"Restart to UEFI setup\" {\n");
        buf.push_str("  fwsetup\n");
        buf.push_str("}\n");
        buf.push('\n');
    }

    buf.push_str("menuentry \"Power Off\" {\n");
    buf.push_str("    halt\n");
    buf.push_str("}\n");
    buf.push('\n');
    buf
}

fn write_verbose_entry(
    buf: &mut String,
    root_cmd: &str,
    prefix: &str,
    entry: &BootEntry,
    cmdline: &str,
) {
    let _ = writeln!(buf, "  {}", root_cmd);
    buf.push_str("  echo \"Loading Linux kernel ...\"\n");
    let _ = writeln!(
        buf,
        "  linux {}/{} {}",
        prefix,
        entry.kernel_filename(),
        linux_args(false, cmdline)
    );
    buf.push_str("  echo \"Loading initial ramdisk ...\"\n");
    let _ = writeln!(buf, "  initrd {}/{}", prefix, entry.initrd_filename());
    buf.push_str("}\n");
    buf.push('\n');
}

/// Postfix of the main entry of a generated `grub.cfg`.
///
/// The "Stable" entry names it twice, in its title and in its `linux`
/// line; both must agree.
pub fn parse_main_entry(text: &str) -> Option<String> {
    let mut lines = text.lines();
    let postfix = loop {
        let line = lines.next()?;
        if let Some(rest) = line.strip_prefix("menuentry \"Stable: Linux-") {
            break rest.strip_suffix("\" {")?.to_string();
        }
    };

    for line in lines {
        if line == "}" {
            return None;
        }
        if let Some(args) = line.trim_start().strip_prefix("linux ") {
            let kernel = args.split_whitespace().next()?;
            let name = kernel.rsplit('/').next()?;
            return (name.strip_prefix("kernel-")? == postfix).then_some(postfix);
        }
    }
    None
}
