//! Read-only file system and the polymorphic file layer.

pub mod file;
pub mod image;

#[cfg(test)]
pub mod testfs;

pub use image::{init, FileSystemImage, FileType, BLOCK_SIZE, FILENAME_LEN, MAX_DENTRIES};
