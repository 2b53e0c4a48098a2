//! Artifact writers for boot files.
//!
//! - [`cpio`] - LZMA compressed `newc` archives used as initramfs images
//! - [`snapshot`] - `tar.bz2` snapshots of the same tree, kept for inspection
//! - [`filesystem`] - Directory walking, copying and atomic replacement

pub mod cpio;
pub mod filesystem;
pub mod snapshot;
