use thiserror::Error;

/// Errors reported by every PlainFS operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FsError {
  #[error("i/o error on block {block_id}")]
  Io { block_id: usize },
  #[error("short transfer on block {block_id}: {done} of {expected} bytes")]
  ShortTransfer { block_id: usize, expected: usize, done: usize },
  #[error("block {block_id} is beyond the end of the device")]
  OutOfRange { block_id: usize },

  #[error("superblock magic is missing, device is not formatted")]
  BadMagic,
  #[error("device block size {0} is not supported, must be 512")]
  BlockSize(usize),
  #[error("superblock geometry does not fit: {inode_count} inodes on {total_blocks} blocks")]
  BadGeometry { inode_count: usize, total_blocks: usize },
  #[error("device of {blocks} blocks is too small to hold a filesystem")]
  DeviceTooSmall { blocks: usize },
  #[error("device of {blocks} blocks exceeds the 65535 block limit")]
  DeviceTooLarge { blocks: usize },

  #[error("inode table is full")]
  TableFull,
  #[error("no space left on device")]
  NoSpace,

  #[error("no such file")]
  NotFound,
  #[error("file exists")]
  AlreadyExists,
  #[error("invalid file name")]
  InvalidName,
  #[error("inode {0} does not belong to this filesystem")]
  BadInode(u32),
  #[error("inode {0} has been unlinked")]
  Unlinked(u32),

  #[error("all block cache entries are in use")]
  CacheExhausted,
}

pub type Result<T> = core::result::Result<T, FsError>;
