//! Layout of FileSystem Structure
//!
//! ```text
//! block 0                      superblock
//! blocks 1 ..= table_blocks    inode table, INODES_PER_BLOCK records each
//! data_zone_start ..           data zone, one block per inode slot
//! tail                         lost blocks, never referenced
//! ```
use core::fmt::{self, Debug, Formatter};

use alloc::string::String;

use crate::{
  config::{FS_FNAME_LEN, FS_IDATA, FS_INO_BLK, FS_MAGIC, FS_MAGIC_LEN, FS_ROOT_INO, MAX_BLOCKS},
  error::{FsError, Result},
  BLOCK_SZ,
};

/// Size of one on-disk inode record
pub const DISK_INODE_SZ: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SZ / DISK_INODE_SZ;

/// A block of the inode table
pub type InodeTableBlock = [DiskInode; INODES_PER_BLOCK];

const _: () = assert!(core::mem::size_of::<DiskInode>() == DISK_INODE_SZ);
const _: () = assert!(core::mem::size_of::<InodeTableBlock>() == BLOCK_SZ);
const _: () = assert!(core::mem::size_of::<SuperBlock>() <= BLOCK_SZ);

/// Super block of a filesystem
#[repr(C)]
pub struct SuperBlock {
  magic: [u8; FS_MAGIC_LEN],
  /// number of inodes (one record per slot)
  nnodes: u16,
  /// total blocks on the device
  nblocks: u16,
}

impl Debug for SuperBlock {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("SuperBlock")
      .field("nnodes", &self.nnodes())
      .field("nblocks", &self.nblocks())
      .finish()
  }
}

impl SuperBlock {
  pub fn new(inode_count: u16, total_blocks: u16) -> Self {
    let mut magic = [0u8; FS_MAGIC_LEN];
    magic[..FS_MAGIC.len()].copy_from_slice(FS_MAGIC);
    Self {
      magic,
      nnodes: inode_count.to_le(),
      nblocks: total_blocks.to_le(),
    }
  }

  pub fn is_valid(&self) -> bool {
    self.magic[..FS_MAGIC.len()] == *FS_MAGIC
  }

  pub fn nnodes(&self) -> usize {
    u16::from_le(self.nnodes) as usize
  }

  pub fn nblocks(&self) -> usize {
    u16::from_le(self.nblocks) as usize
  }
}

/// Inode record as stored in the inode table. A zero link count marks a free slot.
#[repr(C)]
pub struct DiskInode {
  name: [u8; FS_FNAME_LEN],
  ino: u16,
  mode: u16,
  /// size in bytes
  size: u16,
  nlinks: u8,
  uid: u8,
  gid: u8,
  _pad: u8,
  /// modification time, seconds
  mtime: u32,
  data: [u16; FS_IDATA],
  _tail: u16,
}

impl DiskInode {
  /// Zero the record, freeing the slot
  pub fn clear(&mut self) {
    self.name = [0; FS_FNAME_LEN];
    self.ino = 0;
    self.mode = 0;
    self.size = 0;
    self.nlinks = 0;
    self.uid = 0;
    self.gid = 0;
    self._pad = 0;
    self.mtime = 0;
    self.data = [0; FS_IDATA];
    self._tail = 0;
  }

  pub fn is_linked(&self) -> bool {
    self.nlinks != 0
  }

  pub fn raw_name(&self) -> &[u8; FS_FNAME_LEN] {
    &self.name
  }

  pub fn name(&self) -> String {
    unpack_name(&self.name)
  }

  pub fn set_name(&mut self, name: &[u8; FS_FNAME_LEN]) {
    self.name = *name;
  }

  pub fn ino(&self) -> u32 {
    u16::from_le(self.ino) as u32
  }

  pub fn set_ino(&mut self, ino: u32) {
    self.ino = (ino as u16).to_le();
  }

  pub fn mode(&self) -> u16 {
    u16::from_le(self.mode)
  }

  pub fn set_mode(&mut self, mode: u16) {
    self.mode = mode.to_le();
  }

  pub fn size(&self) -> u16 {
    u16::from_le(self.size)
  }

  pub fn set_size(&mut self, size: u16) {
    self.size = size.to_le();
  }

  pub fn nlinks(&self) -> u8 {
    self.nlinks
  }

  pub fn set_nlinks(&mut self, nlinks: u8) {
    self.nlinks = nlinks;
  }

  pub fn uid(&self) -> u8 {
    self.uid
  }

  pub fn gid(&self) -> u8 {
    self.gid
  }

  pub fn set_owner(&mut self, uid: u8, gid: u8) {
    self.uid = uid;
    self.gid = gid;
  }

  pub fn mtime(&self) -> u32 {
    u32::from_le(self.mtime)
  }

  pub fn set_mtime(&mut self, mtime: u32) {
    self.mtime = mtime.to_le();
  }

  pub fn direct(&self) -> [u16; FS_IDATA] {
    self.data.map(u16::from_le)
  }

  pub fn set_direct(&mut self, direct: [u16; FS_IDATA]) {
    self.data = direct.map(u16::to_le);
  }
}

/// Validate a file name and pack it into the fixed on-disk name field.
///
/// Names longer than `FS_FNAME_LEN` bytes are cut at the last character
/// boundary that fits, so lookups of the long and the cut name agree.
pub fn pack_name(name: &str) -> Result<[u8; FS_FNAME_LEN]> {
  if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
    return Err(FsError::InvalidName);
  }
  let mut len = name.len().min(FS_FNAME_LEN);
  while !name.is_char_boundary(len) {
    len -= 1;
  }
  if len == 0 {
    return Err(FsError::InvalidName);
  }
  let mut raw = [0u8; FS_FNAME_LEN];
  raw[..len].copy_from_slice(&name.as_bytes()[..len]);
  Ok(raw)
}

pub fn unpack_name(raw: &[u8; FS_FNAME_LEN]) -> String {
  let len = raw.iter().position(|byte| *byte == 0).unwrap_or(FS_FNAME_LEN);
  String::from_utf8_lossy(&raw[..len]).into_owned()
}

/// First block of the data zone for a table of `inode_count` records.
///
/// The one formula used by the formatter, the allocator and the read-inode path.
pub fn data_zone_start(inode_count: usize) -> usize {
  FS_INO_BLK + (inode_count + INODES_PER_BLOCK - 1) / INODES_PER_BLOCK
}

/// Placement of every zone on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
  /// device size in bytes
  pub device_bytes: u64,
  pub total_blocks: usize,
  /// trailing bytes that do not make up a whole block
  pub lost_bytes: usize,
  pub inode_table_blocks: usize,
  pub inode_count: usize,
  pub data_zone_start: usize,
  pub data_zone_blocks: usize,
  /// tail blocks outside every zone
  pub lost_blocks: usize,
}

impl Geometry {
  /// Lay out a device of `device_bytes` bytes.
  ///
  /// Each inode-table block is balanced against the data blocks its records can
  /// address: `inode_table_blocks * (INODES_PER_BLOCK + 1)` fills the blocks after
  /// the superblock as closely as possible.
  pub fn from_device_size(device_bytes: u64) -> Result<Self> {
    let total_blocks = (device_bytes / BLOCK_SZ as u64) as usize;
    let lost_bytes = (device_bytes % BLOCK_SZ as u64) as usize;
    if total_blocks > MAX_BLOCKS {
      return Err(FsError::DeviceTooLarge { blocks: total_blocks });
    }
    let usable = total_blocks.saturating_sub(FS_INO_BLK);
    let inode_table_blocks = usable / (INODES_PER_BLOCK + 1);
    if inode_table_blocks == 0 {
      return Err(FsError::DeviceTooSmall { blocks: total_blocks });
    }
    let inode_count = inode_table_blocks * INODES_PER_BLOCK;
    Ok(Self {
      device_bytes,
      total_blocks,
      lost_bytes,
      inode_table_blocks,
      inode_count,
      data_zone_start: data_zone_start(inode_count),
      data_zone_blocks: inode_count,
      lost_blocks: usable - inode_table_blocks - inode_count,
    })
  }

  /// Rebuild the geometry recorded in a superblock, checking that it fits.
  pub fn from_superblock(sb: &SuperBlock) -> Result<Self> {
    let inode_count = sb.nnodes();
    let total_blocks = sb.nblocks();
    let start = data_zone_start(inode_count);
    if inode_count == 0 || start + inode_count > total_blocks {
      return Err(FsError::BadGeometry { inode_count, total_blocks });
    }
    Ok(Self {
      device_bytes: (total_blocks * BLOCK_SZ) as u64,
      total_blocks,
      lost_bytes: 0,
      inode_table_blocks: start - FS_INO_BLK,
      inode_count,
      data_zone_start: start,
      data_zone_blocks: inode_count,
      lost_blocks: total_blocks - start - inode_count,
    })
  }

  /// returns (block_id, inner_block_offset) of the record in `slot`
  pub fn inode_pos(&self, slot: usize) -> (usize, usize) {
    (
      FS_INO_BLK + slot / INODES_PER_BLOCK,
      slot % INODES_PER_BLOCK * DISK_INODE_SZ,
    )
  }

  /// physical block behind bitmap bit `bit`
  pub fn data_block(&self, bit: usize) -> usize {
    self.data_zone_start + bit
  }

  /// bitmap bit of physical block `block_id`, if it lies in the data zone
  pub fn data_bit(&self, block_id: usize) -> Option<usize> {
    block_id
      .checked_sub(self.data_zone_start)
      .filter(|bit| *bit < self.data_zone_blocks)
  }

  pub fn ino_of(&self, slot: usize) -> u32 {
    FS_ROOT_INO + 1 + slot as u32
  }

  /// slot of inode `ino`, `None` for the root and out-of-table numbers
  pub fn slot_of(&self, ino: u32) -> Option<usize> {
    let slot = ino.checked_sub(FS_ROOT_INO + 1)? as usize;
    (slot < self.inode_count).then_some(slot)
  }
}
