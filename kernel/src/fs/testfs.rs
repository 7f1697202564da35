//! Test-only builder that lays out file-system images in memory with the
//! exact on-disk format the walker expects.

use std::{vec, vec::Vec};

use super::image::{BLOCK_SIZE, FILENAME_LEN};

enum Entry {
    Rtc(&'static str),
    Directory(&'static str),
    File(&'static str, Vec<u8>),
}

/// Builds a boot block + inodes + data blocks image.
pub struct ImageBuilder {
    entries: Vec<Entry>,
}

impl ImageBuilder {
    /// Start with the customary "." directory entry.
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::Directory(".")],
        }
    }

    /// Add an RTC-type entry.
    pub fn rtc(mut self, name: &'static str) -> Self {
        self.entries.push(Entry::Rtc(name));
        self
    }

    /// Add a regular file with the given contents.
    pub fn file(mut self, name: &'static str, data: &[u8]) -> Self {
        self.entries.push(Entry::File(name, data.to_vec()));
        self
    }

    /// Add a regular file that passes the loader's executable checks: the
    /// ELF magic, then the 32-bit entry address at bytes 24..28, padded to
    /// `len` bytes.
    pub fn executable(mut self, name: &'static str, entry_point: u32, len: usize) -> Self {
        let mut data = vec![0u8; len.max(28)];
        data[0..4].copy_from_slice(&[0x7F, 0x45, 0x4C, 0x46]);
        data[24..28].copy_from_slice(&entry_point.to_le_bytes());
        self.entries.push(Entry::File(name, data));
        self
    }

    /// Serialize the image.
    pub fn build(self) -> Vec<u8> {
        let file_count = self
            .entries
            .iter()
            .filter(|e| matches!(e, Entry::File(..)))
            .count();

        // Assign inodes to regular files in order of appearance.
        let mut inode_data: Vec<&Vec<u8>> = Vec::new();
        let mut dentries: Vec<([u8; FILENAME_LEN], u32, u32)> = Vec::new();
        for entry in &self.entries {
            let (name, file_type, inode) = match entry {
                Entry::Rtc(name) => (name, 0u32, 0u32),
                Entry::Directory(name) => (name, 1, 0),
                Entry::File(name, data) => {
                    inode_data.push(data);
                    (name, 2, (inode_data.len() - 1) as u32)
                }
            };
            let mut padded = [0u8; FILENAME_LEN];
            let bytes = name.as_bytes();
            padded[..bytes.len()].copy_from_slice(bytes);
            dentries.push((padded, file_type, inode));
        }

        let blocks_for = |len: usize| len.div_ceil(BLOCK_SIZE);
        let data_block_count: usize = inode_data.iter().map(|d| blocks_for(d.len())).sum();

        let mut image = vec![0u8; BLOCK_SIZE * (1 + file_count + data_block_count)];
        image[0..4].copy_from_slice(&(dentries.len() as u32).to_le_bytes());
        image[4..8].copy_from_slice(&(file_count as u32).to_le_bytes());
        image[8..12].copy_from_slice(&(data_block_count as u32).to_le_bytes());

        for (index, (name, file_type, inode)) in dentries.iter().enumerate() {
            let offset = 64 + index * 64;
            image[offset..offset + FILENAME_LEN].copy_from_slice(name);
            image[offset + 32..offset + 36].copy_from_slice(&file_type.to_le_bytes());
            image[offset + 36..offset + 40].copy_from_slice(&inode.to_le_bytes());
        }

        let mut next_block = 0u32;
        for (inode, data) in inode_data.iter().enumerate() {
            let inode_base = BLOCK_SIZE * (1 + inode);
            image[inode_base..inode_base + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            for slot in 0..blocks_for(data.len()) {
                let slot_offset = inode_base + 4 + slot * 4;
                image[slot_offset..slot_offset + 4].copy_from_slice(&next_block.to_le_bytes());
                let data_base = BLOCK_SIZE * (1 + file_count + next_block as usize);
                let chunk = &data[slot * BLOCK_SIZE..data.len().min((slot + 1) * BLOCK_SIZE)];
                image[data_base..data_base + chunk.len()].copy_from_slice(chunk);
                next_block += 1;
            }
        }
        image
    }

    /// Serialize and leak, for APIs that want a `'static` image.
    pub fn build_static(self) -> &'static [u8] {
        std::boxed::Box::leak(self.build().into_boxed_slice())
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
