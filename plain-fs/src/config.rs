// Constants and mount options used by PlainFS

pub const BLOCK_SZ_BITS: usize = 9;
pub const BLOCK_SZ: usize = 1 << BLOCK_SZ_BITS; // 512

/// Inode number of the synthesized root directory. It has no on-disk record.
pub const FS_ROOT_INO: u32 = 1;
/// File names are stored in a fixed field of this many bytes.
pub const FS_FNAME_LEN: usize = 10;
/// Direct data block pointers per inode.
pub const FS_IDATA: usize = 3;

pub const FS_SB_BLK: usize = 0;
pub const FS_INO_BLK: usize = 1;

/// Written at the start of block 0 by the formatter.
pub const FS_MAGIC: &[u8] = b"plainfs superblock";
pub const FS_MAGIC_LEN: usize = 30;

/// Blocks kept resident by the per-mount block cache.
pub const BLOCK_CACHE_SIZE: usize = 16;

/// Largest block count that fits the 16-bit superblock and pointer fields.
pub const MAX_BLOCKS: usize = u16::MAX as usize;

pub const S_IFREG: u16 = 0o100000;
pub const S_IFDIR: u16 = 0o040000;

/// Per-mount settings.
#[derive(Clone, Copy)]
pub struct MountOptions {
  /// owner recorded on files created during this mount
  pub uid: u8,
  pub gid: u8,
  /// seconds since the epoch, used for modification timestamps
  pub now: fn() -> u32,
  /// capacity of the block cache, at least 4
  pub cache_blocks: usize,
}

fn epoch() -> u32 {
  0
}

impl Default for MountOptions {
  fn default() -> Self {
    Self {
      uid: 0,
      gid: 0,
      now: epoch,
      cache_blocks: BLOCK_CACHE_SIZE,
    }
  }
}
