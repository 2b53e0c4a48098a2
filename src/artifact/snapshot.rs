//! Archival `tar.bz2` snapshot of an initramfs tree.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bzip2::write::BzEncoder;
use bzip2::Compression;
use tar::{Builder as TarBuilder, EntryType, Header};

use super::filesystem::sorted_entries;
use crate::error::{IoResultExt, Result};

fn header_for(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

/// Write a deterministic bzip2 compressed tar of `src_dir` to `out_path`.
pub fn create_tar_bz2(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = BzEncoder::new(BufWriter::new(out), Compression::best());
    let mut builder = TarBuilder::new(encoder);

    for p in sorted_entries(src_dir)? {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();
        let md = fs::symlink_metadata(&p)
            .with_context(|| format!("Failed to stat {}", p.display()))?;
        let mode = md.permissions().mode() & 0o7777;

        if md.file_type().is_symlink() {
            let target = fs::read_link(&p)
                .with_context(|| format!("Failed to read link {}", p.display()))?;
            let mut header = header_for(EntryType::Symlink, mode, 0);
            builder
                .append_link(&mut header, &rel, &target)
                .with_context(|| format!("Failed to archive {}", rel.display()))?;
        } else if md.is_dir() {
            let mut header = header_for(EntryType::Directory, mode, 0);
            builder
                .append_data(&mut header, &rel, io::empty())
                .with_context(|| format!("Failed to archive {}", rel.display()))?;
        } else if md.is_file() {
            let mut f = File::open(&p).with_context(|| format!("Failed to open {}", p.display()))?;
            let mut header = header_for(EntryType::Regular, mode, md.len());
            builder
                .append_data(&mut header, &rel, &mut f)
                .with_context(|| format!("Failed to archive {}", rel.display()))?;
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    let mut out = encoder
        .finish()
        .with_context(|| format!("Failed to compress {}", out_path.display()))?;
    out.flush()
        .with_context(|| format!("Failed to flush {}", out_path.display()))?;
    Ok(())
}
