use alloc::format;
use core::mem::size_of;

use crate::{
  block_dev::BlockDevice,
  config::{FS_INO_BLK, FS_SB_BLK},
  error::{FsError, Result},
  layout::{Geometry, SuperBlock},
  DataBlock, BLOCK_SZ,
};

/// Write an empty PlainFS onto `block_dev`.
///
/// The superblock records the inode count and total block count, every
/// inode-table block is zeroed so all slots read as free, and each data-zone
/// block starts with an ASCII `blockNNNNN` tag. Blocks past the data zone are
/// not touched.
pub fn format(block_dev: &dyn BlockDevice, geometry: &Geometry) -> Result<()> {
  let block_size = block_dev.block_size();
  if block_size != BLOCK_SZ {
    return Err(FsError::BlockSize(block_size));
  }

  let mut blk: DataBlock = [0; BLOCK_SZ];
  let super_blk = SuperBlock::new(geometry.inode_count as u16, geometry.total_blocks as u16);
  // SAFETY: SuperBlock is repr(C), made of byte arrays and u16s, and fits in a block
  let raw = unsafe {
    core::slice::from_raw_parts(&super_blk as *const SuperBlock as *const u8, size_of::<SuperBlock>())
  };
  blk[..raw.len()].copy_from_slice(raw);
  block_dev.write_block(FS_SB_BLK, &blk)?;

  blk.fill(0);
  for block_id in FS_INO_BLK..geometry.data_zone_start {
    block_dev.write_block(block_id, &blk)?;
  }

  for i in 0..geometry.data_zone_blocks {
    blk.fill(0);
    let tag = format!("block{:05}", i);
    blk[..tag.len()].copy_from_slice(tag.as_bytes());
    block_dev.write_block(geometry.data_block(i), &blk)?;
  }

  log::info!(
    "formatted plainfs: {} inodes in {} table blocks, data zone {}..{}, {} blocks lost",
    geometry.inode_count,
    geometry.inode_table_blocks,
    geometry.data_zone_start,
    geometry.data_zone_start + geometry.data_zone_blocks,
    geometry.lost_blocks
  );
  Ok(())
}
