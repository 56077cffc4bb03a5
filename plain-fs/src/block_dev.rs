use core::any::Any;

use crate::{error::Result, BLOCK_SZ};

/// API a block device provides to the filesystem
///
/// Block numbers are absolute from the start of the device and every transfer
/// moves exactly one block.
pub trait BlockDevice: Send + Sync + Any {
  /// read block `block_id` into `buf`
  fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()>;

  /// write `buf` back to block `block_id`
  fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()>;

  /// Block size the device works with. Mounting fails unless it is `BLOCK_SZ`.
  fn block_size(&self) -> usize {
    BLOCK_SZ
  }
}
