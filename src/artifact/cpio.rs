//! CPIO archive creation for initramfs.
//!
//! The archive is written in-process in `newc` format (the only format the
//! kernel unpacks) and compressed as legacy `.lzma`, which every kernel
//! built with `CONFIG_RD_LZMA` can decompress. Entries are emitted in sorted
//! order with zeroed timestamps and ownership so identical trees give
//! identical archives.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use xz2::stream::{LzmaOptions, Stream};
use xz2::write::XzEncoder;

use super::filesystem::sorted_entries;
use crate::error::{IoResultExt, Result};

const NEWC_MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Streaming `newc` writer.
pub struct CpioWriter<W: Write> {
    inner: W,
    next_ino: u32,
    offset: u64,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            next_ino: 1,
            offset: 0,
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let rem = (self.offset % 4) as usize;
        if rem != 0 {
            self.write_all(&[0u8; 4][..4 - rem])?;
        }
        Ok(())
    }

    fn header(&mut self, name: &str, mode: u32, nlink: u32, size: u32) -> io::Result<()> {
        let ino = if name == TRAILER {
            0
        } else {
            let ino = self.next_ino;
            self.next_ino += 1;
            ino
        };
        let namesize = name.len() as u32 + 1;
        let header = format!(
            "{}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
            NEWC_MAGIC, ino, mode, 0, 0, nlink, 0, size, 0, 0, 0, 0, namesize, 0
        );
        self.write_all(header.as_bytes())?;
        self.write_all(name.as_bytes())?;
        self.write_all(&[0])?;
        self.pad()
    }

    pub fn append_dir(&mut self, name: &str, perm: u32) -> io::Result<()> {
        self.header(name, S_IFDIR | (perm & 0o7777), 2, 0)
    }

    pub fn append_file(&mut self, name: &str, perm: u32, data: &[u8]) -> io::Result<()> {
        let size = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{} is too large for cpio", name))
        })?;
        self.header(name, S_IFREG | (perm & 0o7777), 1, size)?;
        self.write_all(data)?;
        self.pad()
    }

    pub fn append_symlink(&mut self, name: &str, target: &str) -> io::Result<()> {
        self.header(name, S_IFLNK | 0o777, 1, target.len() as u32)?;
        self.write_all(target.as_bytes())?;
        self.pad()
    }

    /// Write the trailer and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.header(TRAILER, 0, 1, 0)?;
        Ok(self.inner)
    }
}

/// Archive the tree below `root`; names are relative to `root`.
pub fn write_tree<W: Write>(root: &Path, writer: &mut CpioWriter<W>) -> Result<()> {
    for path in sorted_entries(root)? {
        let name = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let md = fs::symlink_metadata(&path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let perm = md.permissions().mode();
        let ft = md.file_type();
        if ft.is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("Failed to read link {}", path.display()))?;
            writer
                .append_symlink(&name, &target.to_string_lossy())
                .with_context(|| format!("Failed to archive {}", name))?;
        } else if ft.is_dir() {
            writer
                .append_dir(&name, perm)
                .with_context(|| format!("Failed to archive {}", name))?;
        } else if ft.is_file() {
            let data =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            writer
                .append_file(&name, perm, &data)
                .with_context(|| format!("Failed to archive {}", name))?;
        } else {
            tracing::warn!("skipping special file {} (mode {:o})", name, md.mode());
        }
    }
    Ok(())
}

/// Build an LZMA compressed `newc` archive of `root` at `output`.
pub fn build_cpio_lzma(root: &Path, output: &Path, preset: u32) -> Result<()> {
    let file =
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    let options = LzmaOptions::new_preset(preset)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        .with_context(|| format!("invalid lzma preset {}", preset))?;
    let stream = Stream::new_lzma_encoder(&options)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .with_context(|| "Failed to set up lzma encoder")?;
    let encoder = XzEncoder::new_stream(BufWriter::new(file), stream);

    let mut writer = CpioWriter::new(encoder);
    write_tree(root, &mut writer)?;
    let encoder = writer
        .finish()
        .with_context(|| format!("Failed to finish {}", output.display()))?;
    let mut buffered = encoder
        .finish()
        .with_context(|| format!("Failed to compress {}", output.display()))?;
    buffered
        .flush()
        .with_context(|| format!("Failed to flush {}", output.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/test"), "#!/bin/sh\necho hello\n").unwrap();
        fs::write(root.join("init"), "#!/bin/sh\nexec /bin/sh\n").unwrap();
        std::os::unix::fs::symlink("bin", root.join("sbin")).unwrap();
    }

    fn decompress(path: &Path) -> Vec<u8> {
        let stream = Stream::new_lzma_decoder(u64::MAX).unwrap();
        let mut decoder = xz2::read::XzDecoder::new_stream(File::open(path).unwrap(), stream);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    /// Names of all entries in a newc archive.
    fn list_names(data: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        let mut pos = 0;
        loop {
            let header = std::str::from_utf8(&data[pos..pos + 110]).unwrap();
            assert_eq!(&header[..6], NEWC_MAGIC);
            let field = |i: usize| u32::from_str_radix(&header[6 + i * 8..14 + i * 8], 16).unwrap();
            let size = field(6) as usize;
            let namesize = field(11) as usize;
            let name = std::str::from_utf8(&data[pos + 110..pos + 110 + namesize - 1])
                .unwrap()
                .to_string();
            pos = (pos + 110 + namesize + 3) & !3;
            pos = (pos + size + 3) & !3;
            if name == TRAILER {
                break;
            }
            names.push(name);
        }
        assert_eq!(pos, data.len());
        names
    }

    #[test]
    fn test_build_cpio_lzma() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        sample_tree(&root);

        let output = temp.path().join("initramfs");
        build_cpio_lzma(&root, &output, 9).unwrap();

        let data = decompress(&output);
        assert_eq!(list_names(&data), ["bin", "bin/test", "init", "sbin"]);
    }

    #[test]
    fn identical_trees_give_identical_archives() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        sample_tree(&a);
        sample_tree(&b);

        let mut wa = CpioWriter::new(Vec::new());
        write_tree(&a, &mut wa).unwrap();
        let mut wb = CpioWriter::new(Vec::new());
        write_tree(&b, &mut wb).unwrap();
        assert_eq!(wa.finish().unwrap(), wb.finish().unwrap());
    }
}
