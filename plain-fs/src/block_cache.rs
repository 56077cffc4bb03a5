use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use spin::Mutex;

use crate::{block_dev::BlockDevice, error::{FsError, Result}, BLOCK_SZ};

/// Block buffer aligned so typed views of on-disk records stay aligned.
#[repr(C, align(8))]
struct CacheData([u8; BLOCK_SZ]);

pub struct BlockCache {
  /// cached block data
  cache: CacheData,
  /// corresponding block id
  block_id: usize,
  /// corresponding block device
  block_device: Arc<dyn BlockDevice>,
  /// dirty bit
  modified: bool,
}

impl BlockCache {
  /// Load a new BlockCache from disk.
  pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Result<Self> {
    let mut cache = CacheData([0u8; BLOCK_SZ]);
    block_device.read_block(block_id, &mut cache.0)?;
    Ok(Self {
      cache,
      block_id,
      block_device,
      modified: false,
    })
  }

  fn addr_of_offset(&self, offset: usize) -> usize {
    &self.cache.0[offset] as *const u8 as usize
  }

  /// get ref of data type `T` from block cache entry
  pub fn get_ref<T>(&self, offset: usize) -> &T where T: Sized {
    let type_size = core::mem::size_of::<T>();
    assert!(offset + type_size <= BLOCK_SZ);
    assert_eq!(offset % core::mem::align_of::<T>(), 0);
    unsafe { &*(self.addr_of_offset(offset) as *const T) }
  }

  /// get mut ref of data type `T` from block cache entry, marking the block dirty
  pub fn get_mut<T>(&mut self, offset: usize) -> &mut T where T: Sized {
    let type_size = core::mem::size_of::<T>();
    assert!(offset + type_size <= BLOCK_SZ);
    assert_eq!(offset % core::mem::align_of::<T>(), 0);
    self.modified = true;
    unsafe { &mut *(self.addr_of_offset(offset) as *mut T) }
  }

  pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
    f(self.get_ref(offset))
  }

  pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
    f(self.get_mut(offset))
  }

  #[cfg(test)]
  pub fn is_dirty(&self) -> bool {
    self.modified
  }

  /// if dirty, write back to block device
  pub fn sync(&mut self) -> Result<()> {
    if self.modified {
      self.block_device.write_block(self.block_id, &self.cache.0)?;
      self.modified = false;
      log::trace!("block {} written back", self.block_id);
    }
    Ok(())
  }
}

impl Drop for BlockCache {
  fn drop(&mut self) {
    if let Err(err) = self.sync() {
      log::error!("lost write-back of block {}: {}", self.block_id, err);
    }
  }
}

/// Block cache of one mounted device.
pub struct BlockCacheManager {
  block_device: Arc<dyn BlockDevice>,
  capacity: usize,
  queue: Mutex<VecDeque<(usize, Arc<Mutex<BlockCache>>)>>,
}

impl BlockCacheManager {
  pub fn new(block_device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
    Self {
      block_device,
      capacity: capacity.max(4),
      queue: Mutex::new(VecDeque::new()),
    }
  }

  /// find `block_id`-th block on the device and place it in the cache
  pub fn get_block_cache(&self, block_id: usize) -> Result<Arc<Mutex<BlockCache>>> {
    let mut queue = self.queue.lock();
    if let Some((_, entry)) = queue.iter().find(|entry| entry.0 == block_id) {
      return Ok(entry.clone());
    }
    if queue.len() >= self.capacity {
      // evict the oldest entry nobody holds
      let idx = queue
        .iter()
        .position(|(_, cache)| Arc::strong_count(cache) == 1)
        .ok_or(FsError::CacheExhausted)?;
      if let Some((_, victim)) = queue.remove(idx) {
        victim.lock().sync()?;
      }
    }
    let entry = Arc::new(Mutex::new(BlockCache::new(block_id, self.block_device.clone())?));
    queue.push_back((block_id, entry.clone()));
    Ok(entry)
  }

  /// Sync every cached block to the device
  pub fn sync_all(&self) -> Result<()> {
    // one entry is held at a time and without the queue lock, so concurrent
    // lookups can still evict; an entry gone meanwhile was synced on eviction
    let block_ids: Vec<usize> = self.queue.lock().iter().map(|(block_id, _)| *block_id).collect();
    for block_id in block_ids {
      let entry = self
        .queue
        .lock()
        .iter()
        .find(|(id, _)| *id == block_id)
        .map(|(_, cache)| cache.clone());
      if let Some(cache) = entry {
        cache.lock().sync()?;
      }
    }
    Ok(())
  }

  /// Number of blocks currently marked dirty
  #[cfg(test)]
  pub fn dirty_blocks(&self) -> usize {
    let entries: Vec<_> = self.queue.lock().iter().map(|(_, cache)| cache.clone()).collect();
    entries.iter().filter(|cache| cache.lock().is_dirty()).count()
  }

  /// Flush and forget every cached block.
  pub fn clear(&self) -> Result<()> {
    self.sync_all()?;
    self.queue.lock().clear();
    Ok(())
  }
}
