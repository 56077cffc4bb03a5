//! In-memory block device for unit tests.
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::{block_dev::BlockDevice, error::{FsError, Result}, BLOCK_SZ};

pub struct RamDisk {
  blocks: Mutex<Vec<[u8; BLOCK_SZ]>>,
  writes: AtomicUsize,
  /// writes allowed before every further write fails
  write_budget: AtomicUsize,
  /// block whose next read fails, `usize::MAX` for none
  failing_read: AtomicUsize,
}

impl RamDisk {
  pub fn new(nblocks: usize) -> Self {
    Self {
      blocks: Mutex::new(alloc::vec![[0u8; BLOCK_SZ]; nblocks]),
      writes: AtomicUsize::new(0),
      write_budget: AtomicUsize::new(usize::MAX),
      failing_read: AtomicUsize::new(usize::MAX),
    }
  }

  pub fn block(&self, block_id: usize) -> [u8; BLOCK_SZ] {
    self.blocks.lock()[block_id]
  }

  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn fail_writes_after(&self, writes: usize) {
    self.write_budget.store(writes, Ordering::SeqCst);
  }

  pub fn fail_read_once(&self, block_id: usize) {
    self.failing_read.store(block_id, Ordering::SeqCst);
  }
}

impl BlockDevice for RamDisk {
  fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<()> {
    if self
      .failing_read
      .compare_exchange(block_id, usize::MAX, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      return Err(FsError::Io { block_id });
    }
    let blocks = self.blocks.lock();
    let block = blocks.get(block_id).ok_or(FsError::OutOfRange { block_id })?;
    buf.copy_from_slice(block);
    Ok(())
  }

  fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<()> {
    let budget = self.write_budget.load(Ordering::SeqCst);
    if budget == 0 {
      return Err(FsError::Io { block_id });
    }
    if budget != usize::MAX {
      self.write_budget.store(budget - 1, Ordering::SeqCst);
    }
    let mut blocks = self.blocks.lock();
    let block = blocks.get_mut(block_id).ok_or(FsError::OutOfRange { block_id })?;
    block.copy_from_slice(buf);
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
