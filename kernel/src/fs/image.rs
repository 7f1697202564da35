//! Walker for the in-memory read-only file-system image.
//!
//! The image is laid out contiguously: a 4 KiB boot block (summary counts
//! plus up to 63 directory entries), `inode_count` 4 KiB inodes, then the
//! data blocks. File names are 32 bytes, zero padded, and need not carry a
//! terminator.

use spin::Mutex;

use crate::error::{FsError, KernelError, KernelResult};

/// Block granularity of the image.
pub const BLOCK_SIZE: usize = 4096;
/// Maximum file-name length; a full-length name has no NUL.
pub const FILENAME_LEN: usize = 32;
/// The boot block holds at most this many directory entries.
pub const MAX_DENTRIES: usize = 63;
/// Data-block slots in one inode.
pub const INODE_BLOCK_SLOTS: usize = 1023;

/// Byte size of one directory entry.
const DENTRY_SIZE: usize = 64;
/// Directory entries start after the summary counts.
const DENTRY_OFFSET: usize = 64;

/// On-disk file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// User-level RTC access file.
    Rtc,
    /// The (single, flat) directory.
    Directory,
    /// Regular file.
    Regular,
}

impl FileType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FileType::Rtc),
            1 => Some(FileType::Directory),
            2 => Some(FileType::Regular),
            _ => None,
        }
    }
}

/// A decoded directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dentry {
    name: [u8; FILENAME_LEN],
    /// On-disk file type.
    pub file_type: FileType,
    /// Inode index; meaningful only for regular files.
    pub inode: u32,
}

impl Dentry {
    /// The stored name, trimmed at the first NUL (a full 32-byte name has
    /// none).
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        &self.name[..len]
    }
}

/// View over a complete file-system image.
#[derive(Clone, Copy)]
pub struct FileSystemImage {
    image: &'static [u8],
}

impl FileSystemImage {
    /// Wrap `image`. The boot block must at least be complete.
    pub fn new(image: &'static [u8]) -> KernelResult<Self> {
        if image.len() < BLOCK_SIZE {
            return Err(KernelError::Fs(FsError::BadIndex));
        }
        Ok(Self { image })
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let bytes = &self.image[offset..offset + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Number of directory entries recorded in the boot block.
    pub fn dentry_count(&self) -> u32 {
        self.read_u32(0).min(MAX_DENTRIES as u32)
    }

    /// Number of inodes recorded in the boot block.
    pub fn inode_count(&self) -> u32 {
        self.read_u32(4)
    }

    /// Number of data blocks recorded in the boot block.
    pub fn data_block_count(&self) -> u32 {
        self.read_u32(8)
    }

    /// Decode directory entry `index`; bounds-checked against the count.
    pub fn dentry_by_index(&self, index: u32) -> KernelResult<Dentry> {
        if index >= self.dentry_count() {
            return Err(KernelError::Fs(FsError::BadIndex));
        }
        let offset = DENTRY_OFFSET + index as usize * DENTRY_SIZE;
        let mut name = [0u8; FILENAME_LEN];
        name.copy_from_slice(&self.image[offset..offset + FILENAME_LEN]);
        let file_type = FileType::from_raw(self.read_u32(offset + FILENAME_LEN))
            .ok_or(KernelError::Fs(FsError::WrongType))?;
        let inode = self.read_u32(offset + FILENAME_LEN + 4);
        Ok(Dentry {
            name,
            file_type,
            inode,
        })
    }

    /// Linear-scan lookup by name. Name lengths must match exactly before
    /// the bytes are compared.
    pub fn dentry_by_name(&self, name: &[u8]) -> KernelResult<Dentry> {
        if name.is_empty() || name.len() > FILENAME_LEN {
            return Err(KernelError::Fs(FsError::BadName));
        }
        for index in 0..self.dentry_count() {
            let Ok(dentry) = self.dentry_by_index(index) else {
                continue;
            };
            if dentry.name() == name {
                return Ok(dentry);
            }
        }
        Err(KernelError::Fs(FsError::NotFound))
    }

    /// Byte length of `inode`'s file.
    pub fn inode_length(&self, inode: u32) -> KernelResult<u32> {
        if inode >= self.inode_count() {
            return Err(KernelError::Fs(FsError::BadInode));
        }
        Ok(self.read_u32(self.inode_offset(inode)))
    }

    fn inode_offset(&self, inode: u32) -> usize {
        BLOCK_SIZE * (1 + inode as usize)
    }

    fn data_block_offset(&self, block: u32) -> usize {
        BLOCK_SIZE * (1 + self.inode_count() as usize + block as usize)
    }

    /// Read up to `buf.len()` bytes of `inode`'s file starting at byte
    /// `offset`. Returns the byte count actually copied; `0` signals end
    /// of file. An empty `buf` reads nothing and succeeds.
    ///
    /// Fails when the inode index is out of range, when `offset` lies
    /// beyond the file, or when a data-block index inside the declared
    /// file size exceeds the block count.
    pub fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> KernelResult<usize> {
        if inode >= self.inode_count() {
            return Err(KernelError::Fs(FsError::BadInode));
        }
        let inode_base = self.inode_offset(inode);
        let length = self.read_u32(inode_base);
        if offset > length {
            return Err(KernelError::Fs(FsError::OffsetBeyondEof));
        }

        let mut copied = 0usize;
        let mut position = offset;
        while copied < buf.len() && position < length {
            let slot = (position as usize) / BLOCK_SIZE;
            let block = self.read_u32(inode_base + 4 + slot * 4);
            if block > self.data_block_count() {
                return Err(KernelError::Fs(FsError::BadDataBlock));
            }
            let in_block = (position as usize) % BLOCK_SIZE;
            buf[copied] = self.image[self.data_block_offset(block) + in_block];
            copied += 1;
            position += 1;
        }
        Ok(copied)
    }
}

static FS_IMAGE: Mutex<Option<FileSystemImage>> = Mutex::new(None);

/// Record the boot-time image location.
pub fn init(image: &'static [u8]) -> KernelResult<()> {
    let fs = FileSystemImage::new(image)?;
    *FS_IMAGE.lock() = Some(fs);
    log::info!("fs: {} dentries, {} inodes", fs.dentry_count(), fs.inode_count());
    Ok(())
}

/// The mounted image; fails before [`init`].
pub fn mounted() -> KernelResult<FileSystemImage> {
    (*FS_IMAGE.lock()).ok_or(KernelError::Fs(FsError::NotFound))
}
