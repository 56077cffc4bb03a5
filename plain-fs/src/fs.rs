use alloc::{
  collections::BTreeMap,
  sync::{Arc, Weak},
  vec::Vec,
};
use spin::Mutex;

use crate::{
  bitmap::Bitmap,
  block_cache::BlockCacheManager,
  block_dev::BlockDevice,
  config::{MountOptions, FS_FNAME_LEN, FS_IDATA, FS_SB_BLK},
  dir::RootDir,
  error::{FsError, Result},
  layout::{DiskInode, Geometry, InodeTableBlock, SuperBlock, INODES_PER_BLOCK},
  name_index::NameIndex,
  vfs::{Inode, InodeInner},
  BLOCK_SZ,
};

/// Filesystem statistics, as reported to `statfs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
  pub block_size: usize,
  pub name_len: usize,
  /// data blocks, one per inode slot
  pub blocks: usize,
  pub bfree: usize,
  pub files: usize,
  /// inode slots without a Name Index entry
  pub ffree: usize,
}

/// State of one mounted PlainFS device.
///
/// Owns the block cache, the data bitmap and the Name Index for as long as the
/// device stays mounted. Every mutating operation runs with this state locked.
pub struct PlainFileSystem {
  pub(crate) cache: Arc<BlockCacheManager>,
  pub(crate) geometry: Geometry,
  pub(crate) bitmap: Bitmap,
  pub(crate) names: NameIndex,
  pub(crate) options: MountOptions,
  /// inodes with live handles, so each inode has a single in-memory mirror
  open_inodes: BTreeMap<u32, Weak<Inode>>,
}

impl PlainFileSystem {
  /// Open a block device as a filesystem
  pub fn open(block_dev: Arc<dyn BlockDevice>) -> Result<Arc<Mutex<Self>>> {
    Self::open_with(block_dev, MountOptions::default())
  }

  pub fn open_with(
    block_dev: Arc<dyn BlockDevice>,
    options: MountOptions,
  ) -> Result<Arc<Mutex<Self>>> {
    let block_size = block_dev.block_size();
    if block_size != BLOCK_SZ {
      return Err(FsError::BlockSize(block_size));
    }
    let cache = Arc::new(BlockCacheManager::new(block_dev, options.cache_blocks));
    let geometry = cache
      .get_block_cache(FS_SB_BLK)?
      .lock()
      .read(0, |super_blk: &SuperBlock| {
        if !super_blk.is_valid() {
          return Err(FsError::BadMagic);
        }
        Geometry::from_superblock(super_blk)
      })?;

    let mut fs = Self {
      cache,
      geometry,
      bitmap: Bitmap::new(geometry.inode_count),
      names: NameIndex::new(geometry.inode_count),
      options,
      open_inodes: BTreeMap::new(),
    };
    fs.seed_bitmap()?;
    log::info!(
      "mounted plainfs: {} inodes, {} blocks, data zone at block {}, {} blocks in use",
      geometry.inode_count,
      geometry.total_blocks,
      geometry.data_zone_start,
      fs.bitmap.count_set()
    );
    Ok(Arc::new(Mutex::new(fs)))
  }

  /// The synthesized root directory
  pub fn root_inode(fs: &Arc<Mutex<Self>>) -> RootDir {
    RootDir::new(fs.clone())
  }

  /// Open the file with inode number `ino` (read-inode).
  pub fn iget(fs: &Arc<Mutex<Self>>, ino: u32) -> Result<Arc<Inode>> {
    fs.lock().load_inode(fs, ino)
  }

  pub fn geometry(&self) -> &Geometry {
    &self.geometry
  }

  pub fn statfs(&self) -> FsStat {
    let slots = self.geometry.inode_count;
    FsStat {
      block_size: BLOCK_SZ,
      name_len: FS_FNAME_LEN,
      blocks: slots,
      bfree: slots - self.bitmap.count_set(),
      files: slots,
      ffree: slots - self.names.populated(),
    }
  }

  /// Write every dirty block back to the device
  pub fn sync(&self) -> Result<()> {
    self.cache.sync_all()
  }

  /// Flush the device and release the Name Index.
  ///
  /// Handles still alive keep their entry in the open-inode table, so a later
  /// `iget` of the same inode returns that handle instead of a second mirror.
  pub fn unmount(fs: Arc<Mutex<Self>>) -> Result<()> {
    let mut fs = fs.lock();
    fs.cache.clear()?;
    fs.names.clear();
    fs.open_inodes.retain(|_, inode| inode.strong_count() > 0);
    log::info!("unmounted plainfs");
    Ok(())
  }

  /// Log the bitmap at debug level, 20 bits per line
  pub fn dump_bitmap(&self) {
    for row in self.bitmap.rows(20) {
      log::debug!("inode_bm: {}", row);
    }
  }

  pub(crate) fn now(&self) -> u32 {
    (self.options.now)()
  }

  pub(crate) fn read_disk_inode<V>(&self, slot: usize, f: impl FnOnce(&DiskInode) -> V) -> Result<V> {
    let (block_id, block_offset) = self.geometry.inode_pos(slot);
    Ok(self.cache.get_block_cache(block_id)?.lock().read(block_offset, f))
  }

  pub(crate) fn modify_disk_inode<V>(
    &self,
    slot: usize,
    f: impl FnOnce(&mut DiskInode) -> V,
  ) -> Result<V> {
    let (block_id, block_offset) = self.geometry.inode_pos(slot);
    Ok(self.cache.get_block_cache(block_id)?.lock().modify(block_offset, f))
  }

  /// Mark the data blocks held by every linked record.
  fn seed_bitmap(&mut self) -> Result<()> {
    for table_block in 0..self.geometry.inode_table_blocks {
      let (block_id, _) = self.geometry.inode_pos(table_block * INODES_PER_BLOCK);
      let held: Vec<(usize, [u16; FS_IDATA])> = self
        .cache
        .get_block_cache(block_id)?
        .lock()
        .read(0, |records: &InodeTableBlock| {
          records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_linked())
            .map(|(i, record)| (table_block * INODES_PER_BLOCK + i, record.direct()))
            .collect()
        });
      for (slot, direct) in held {
        if slot < self.geometry.inode_count {
          self.reserve_blocks(slot, &direct);
        }
      }
    }
    Ok(())
  }

  /// returns the inode number of the first slot that is free both in the Name
  /// Index and on disk
  pub(crate) fn find_free_inode_slot(&self) -> Result<u32> {
    for slot in self.names.empty_slots() {
      if self.read_disk_inode(slot, DiskInode::is_linked)? {
        log::debug!("slot {} holds a file not seen yet, skipped", slot);
        continue;
      }
      return Ok(self.geometry.ino_of(slot));
    }
    Err(FsError::TableFull)
  }

  /// Claim the first free data block for a file in `slot`
  pub(crate) fn alloc_data(&mut self, slot: usize) -> Result<u16> {
    let bit = self.bitmap.alloc().ok_or(FsError::NoSpace)?;
    let block_id = self.geometry.data_block(bit);
    log::debug!("slot {}: allocated bit {}, block {}", slot, bit, block_id);
    Ok(block_id as u16)
  }

  /// Clear the bitmap bit of every non-zero pointer
  pub(crate) fn release_slot_blocks(&mut self, slot: usize, direct: &[u16; FS_IDATA]) {
    for &block_id in direct.iter().filter(|ptr| **ptr != 0) {
      match self.geometry.data_bit(block_id as usize) {
        Some(bit) => {
          if !self.bitmap.clear(bit) {
            log::warn!("slot {}: block {} was not marked in use", slot, block_id);
          }
        }
        None => log::warn!("slot {}: pointer {} is outside the data zone", slot, block_id),
      }
    }
  }

  /// Mark the bitmap bit of every non-zero pointer
  pub(crate) fn reserve_blocks(&mut self, slot: usize, direct: &[u16; FS_IDATA]) {
    for &block_id in direct.iter().filter(|ptr| **ptr != 0) {
      match self.geometry.data_bit(block_id as usize) {
        Some(bit) => self.bitmap.set(bit),
        None => log::warn!("slot {}: pointer {} is outside the data zone", slot, block_id),
      }
    }
  }

  /// Look up the live handle of `ino` or read its record from disk.
  pub(crate) fn load_inode(&mut self, this: &Arc<Mutex<Self>>, ino: u32) -> Result<Arc<Inode>> {
    if let Some(inode) = self.open_inodes.get(&ino).and_then(Weak::upgrade) {
      return Ok(inode);
    }
    let slot = self.geometry.slot_of(ino).ok_or(FsError::BadInode(ino))?;
    let inner = self.read_disk_inode(slot, |record| {
      record.is_linked().then(|| InodeInner::from_disk(record))
    })?;
    let inner = inner.ok_or(FsError::NotFound)?;
    if inner
      .direct
      .iter()
      .any(|ptr| *ptr != 0 && self.geometry.data_bit(*ptr as usize).is_none())
    {
      log::warn!("inode {} points outside the data zone", ino);
      return Err(FsError::BadInode(ino));
    }
    self.reserve_blocks(slot, &inner.direct);
    Ok(self.install_inode(this, slot, inner))
  }

  /// Create the shared handle of the inode in `slot`
  pub(crate) fn install_inode(
    &mut self,
    this: &Arc<Mutex<Self>>,
    slot: usize,
    inner: InodeInner,
  ) -> Arc<Inode> {
    let ino = self.geometry.ino_of(slot);
    let (block_id, block_offset) = self.geometry.inode_pos(slot);
    let inode = Arc::new(Inode::new(
      ino,
      slot,
      block_id,
      block_offset,
      this.clone(),
      self.cache.clone(),
      inner,
    ));
    self.open_inodes.insert(ino, Arc::downgrade(&inode));
    inode
  }

  pub(crate) fn forget_inode(&mut self, ino: u32) {
    self.open_inodes.remove(&ino);
  }
}

impl Drop for PlainFileSystem {
  fn drop(&mut self) {
    if let Err(err) = self.cache.sync_all() {
      log::error!("failed to flush plainfs on drop: {}", err);
    }
  }
}
