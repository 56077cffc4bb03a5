//! PlainFS: a flat filesystem with one root directory, a linear inode table
//! and three direct block pointers per file.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bitmap;
mod block_cache;
mod block_dev;
pub mod config;
mod dir;
mod error;
mod fs;
mod layout;
mod mkfs;
mod name_index;
mod vfs;

#[cfg(test)]
mod testing;

pub use config::{MountOptions, BLOCK_SZ, FS_FNAME_LEN, FS_IDATA, FS_ROOT_INO};
pub use block_dev::BlockDevice;
pub use dir::{DirEntry, RootDir};
pub use error::{FsError, Result};
pub use fs::{FsStat, PlainFileSystem};
pub use layout::{Geometry, DISK_INODE_SZ, INODES_PER_BLOCK};
pub use mkfs::format;
pub use vfs::{BlockMapping, Inode, InodeStat};

type DataBlock = [u8; BLOCK_SZ];
