use alloc::{format, sync::Arc};
use core::cmp::min;
use spin::{Mutex, MutexGuard};

use crate::{
  block_cache::BlockCacheManager,
  config::{FS_FNAME_LEN, FS_IDATA, S_IFREG},
  error::{FsError, Result},
  fs::PlainFileSystem,
  layout::{pack_name, DiskInode},
  DataBlock, BLOCK_SZ,
};

/// Largest file size: every direct block full
pub const MAX_FILE_SIZE: usize = FS_IDATA * BLOCK_SZ;

/// Where a logical block of a file lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMapping {
  /// not mapped, reads as zeros
  Hole,
  /// mapped before this call
  Mapped(usize),
  /// allocated by this call, content is undefined until written
  New(usize),
}

/// Attributes of a file or of the root directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
  pub ino: u32,
  pub mode: u16,
  pub size: u64,
  pub nlinks: u32,
  pub uid: u8,
  pub gid: u8,
  pub mtime: u32,
  /// mapped data blocks
  pub blocks: usize,
}

/// In-memory mirror of an inode record
#[derive(Debug, Clone)]
pub(crate) struct InodeInner {
  pub mode: u16,
  pub size: u16,
  pub nlinks: u8,
  pub uid: u8,
  pub gid: u8,
  pub mtime: u32,
  pub direct: [u16; FS_IDATA],
}

impl InodeInner {
  pub fn from_disk(record: &DiskInode) -> Self {
    Self {
      mode: record.mode(),
      size: record.size(),
      nlinks: record.nlinks(),
      uid: record.uid(),
      gid: record.gid(),
      mtime: record.mtime(),
      direct: record.direct(),
    }
  }

  /// A linked, empty file
  pub fn new_file(mode: u16, uid: u8, gid: u8, mtime: u32) -> Self {
    Self {
      mode: mode & 0o7777 | S_IFREG,
      size: 0,
      nlinks: 1,
      uid,
      gid,
      mtime,
      direct: [0; FS_IDATA],
    }
  }
}

/// An open file of a mounted PlainFS.
///
/// Different from `DiskInode`, `Inode` is stored in memory: it mirrors the
/// record's fields so block lookups do not go back to the inode table, and
/// `sync` copies them back.
pub struct Inode {
  ino: u32,
  slot: usize,
  block_id: usize,     // inode-table block holding the record
  block_offset: usize, // record offset within that block
  fs: Arc<Mutex<PlainFileSystem>>,
  cache: Arc<BlockCacheManager>,
  inner: Mutex<InodeInner>,
}

impl Inode {
  pub(crate) fn new(
    ino: u32,
    slot: usize,
    block_id: usize,
    block_offset: usize,
    fs: Arc<Mutex<PlainFileSystem>>,
    cache: Arc<BlockCacheManager>,
    inner: InodeInner,
  ) -> Self {
    Self {
      ino,
      slot,
      block_id,
      block_offset,
      fs,
      cache,
      inner: Mutex::new(inner),
    }
  }

  pub fn ino(&self) -> u32 {
    self.ino
  }

  pub fn size(&self) -> usize {
    self.inner.lock().size as usize
  }

  pub fn stat(&self) -> InodeStat {
    let inner = self.inner.lock();
    InodeStat {
      ino: self.ino,
      mode: inner.mode,
      size: inner.size as u64,
      nlinks: inner.nlinks as u32,
      uid: inner.uid,
      gid: inner.gid,
      mtime: inner.mtime,
      blocks: inner.direct.iter().filter(|ptr| **ptr != 0).count(),
    }
  }

  fn read_disk_inode<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> Result<V> {
    Ok(self.cache.get_block_cache(self.block_id)?.lock().read(self.block_offset, f))
  }

  fn modify_disk_inode<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> Result<V> {
    Ok(self.cache.get_block_cache(self.block_id)?.lock().modify(self.block_offset, f))
  }

  /// Map logical block `block` to its physical block, allocating it when
  /// `create` is set and the block is unmapped.
  pub fn get_block(&self, block: usize, create: bool) -> Result<BlockMapping> {
    if !create {
      return Ok(Self::lookup_block(&self.inner.lock(), block));
    }
    let mut fs = self.fs.lock();
    let mut inner = self.inner.lock();
    match self.map_block(&mut fs, &mut inner, block)? {
      (block_id, false) => Ok(BlockMapping::Mapped(block_id)),
      (block_id, true) => {
        if let Err(err) = self.sync_locked(&fs, &inner) {
          self.unmap_fresh(&mut fs, &mut inner, block);
          return Err(err);
        }
        Ok(BlockMapping::New(block_id))
      }
    }
  }

  fn lookup_block(inner: &InodeInner, block: usize) -> BlockMapping {
    match inner.direct.get(block) {
      Some(&ptr) if ptr != 0 => BlockMapping::Mapped(ptr as usize),
      _ => BlockMapping::Hole,
    }
  }

  /// returns (block_id, freshly allocated)
  fn map_block(
    &self,
    fs: &mut PlainFileSystem,
    inner: &mut InodeInner,
    block: usize,
  ) -> Result<(usize, bool)> {
    if inner.nlinks == 0 {
      return Err(FsError::Unlinked(self.ino));
    }
    if block >= FS_IDATA {
      return Err(FsError::NoSpace);
    }
    if inner.direct[block] != 0 {
      return Ok((inner.direct[block] as usize, false));
    }
    let block_id = fs.alloc_data(self.slot)?;
    inner.direct[block] = block_id;
    Ok((block_id as usize, true))
  }

  /// Give back a block allocated by `map_block` that never got initialized,
  /// so a later mapping of `block` starts fresh again
  fn unmap_fresh(&self, fs: &mut PlainFileSystem, inner: &mut InodeInner, block: usize) {
    let mut held = [0; FS_IDATA];
    held[0] = core::mem::take(&mut inner.direct[block]);
    fs.release_slot_blocks(self.slot, &held);
  }

  /// Read file content at `offset` into `buf`; holes read as zeros
  pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
    let (size, direct) = {
      let inner = self.inner.lock();
      (min(inner.size as usize, MAX_FILE_SIZE), inner.direct)
    };
    // [start, end)
    let mut start = offset;
    let end = min(size, offset.saturating_add(buf.len()));
    if start >= end {
      return Ok(0);
    }
    let mut read_size = 0usize;
    while start < end {
      let block = start / BLOCK_SZ;
      let cur_block_end = min(end, (block + 1) * BLOCK_SZ);
      let block_read_size = cur_block_end - start;
      let dst = &mut buf[read_size..read_size + block_read_size];
      let src_range = start % BLOCK_SZ..start % BLOCK_SZ + block_read_size;
      match direct[block] {
        0 => dst.fill(0),
        ptr => self
          .cache
          .get_block_cache(ptr as usize)?
          .lock()
          .read(0, |data: &DataBlock| dst.copy_from_slice(&data[src_range])),
      }
      read_size += block_read_size;
      start = cur_block_end;
    }
    Ok(read_size)
  }

  /// Write `buf` at `offset`, allocating blocks as needed.
  ///
  /// Returns a short count when the write runs past the last direct block or
  /// out of free blocks after some bytes were stored; fails when nothing was.
  pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    let mut fs = self.fs.lock();
    let mut inner = self.inner.lock();
    let end = offset.saturating_add(buf.len());
    let mut start = offset;
    let mut write_size = 0usize;
    let mut failure = None;
    while start < end {
      let block = start / BLOCK_SZ;
      let (block_id, fresh) = match self.map_block(&mut fs, &mut inner, block) {
        Ok(mapped) => mapped,
        Err(err) => {
          failure = Some(err);
          break;
        }
      };
      let cur_block_end = min(end, (block + 1) * BLOCK_SZ);
      let block_write_size = cur_block_end - start;
      let src = &buf[write_size..write_size + block_write_size];
      let dst_range = start % BLOCK_SZ..start % BLOCK_SZ + block_write_size;
      let data_block = match self.cache.get_block_cache(block_id) {
        Ok(data_block) => data_block,
        Err(err) => {
          if fresh {
            self.unmap_fresh(&mut fs, &mut inner, block);
          }
          failure = Some(err);
          break;
        }
      };
      data_block
        .lock()
        .modify(0, |data: &mut DataBlock| {
          if fresh {
            // formatter filler is still in the block
            data.fill(0);
          }
          data[dst_range].copy_from_slice(src);
        });
      write_size += block_write_size;
      start = cur_block_end;
    }
    if write_size == 0 {
      if let Some(err) = failure {
        return Err(err);
      }
    }
    let new_end = offset + write_size;
    if new_end > inner.size as usize {
      inner.size = new_end as u16;
    }
    inner.mtime = fs.now();
    self.sync_locked(&fs, &inner)?;
    drop(inner);
    drop(fs);
    self.cache.sync_all()?;
    Ok(write_size)
  }

  /// Release every data block and set the size to zero
  pub fn clear(&self) -> Result<()> {
    let mut fs = self.fs.lock();
    let mut inner = self.inner.lock();
    if inner.nlinks == 0 {
      return Err(FsError::Unlinked(self.ino));
    }
    fs.release_slot_blocks(self.slot, &inner.direct);
    inner.direct = [0; FS_IDATA];
    inner.size = 0;
    inner.mtime = fs.now();
    self.sync_locked(&fs, &inner)?;
    drop(inner);
    drop(fs);
    self.cache.sync_all()
  }

  /// Store permission bits; the file type bits are kept
  pub fn set_mode(&self, mode: u16) -> Result<()> {
    self.update(|inner| inner.mode = mode & 0o7777 | S_IFREG)
  }

  pub fn set_owner(&self, uid: u8, gid: u8) -> Result<()> {
    self.update(|inner| {
      inner.uid = uid;
      inner.gid = gid;
    })
  }

  pub fn set_mtime(&self, mtime: u32) -> Result<()> {
    self.update(|inner| inner.mtime = mtime)
  }

  fn update(&self, f: impl FnOnce(&mut InodeInner)) -> Result<()> {
    let fs = self.fs.lock();
    let mut inner = self.inner.lock();
    if inner.nlinks == 0 {
      return Err(FsError::Unlinked(self.ino));
    }
    f(&mut inner);
    self.sync_locked(&fs, &inner)
  }

  /// Copy the in-memory fields to the on-disk record (write-inode)
  pub fn sync(&self) -> Result<()> {
    let fs = self.fs.lock();
    let inner = self.inner.lock();
    self.sync_locked(&fs, &inner)?;
    drop(inner);
    drop(fs);
    self.cache.sync_all()
  }

  /// Copy every mirrored field into the record and mark its block dirty.
  pub(crate) fn sync_locked(&self, fs: &PlainFileSystem, inner: &InodeInner) -> Result<()> {
    if inner.nlinks == 0 {
      // the slot is free on disk
      return Ok(());
    }
    let name = match fs.names.name_of(self.ino) {
      Some(name) => *name,
      None => self.fallback_name()?,
    };
    let ino = self.ino;
    self.modify_disk_inode(|record| {
      record.set_name(&name);
      record.set_ino(ino);
      record.set_mode(inner.mode);
      record.set_owner(inner.uid, inner.gid);
      record.set_size(inner.size);
      record.set_nlinks(inner.nlinks);
      record.set_mtime(inner.mtime);
      record.set_direct(inner.direct);
    })
  }

  /// Name for a record the Name Index has not seen: the one already on disk,
  /// or a placeholder when the record is not linked
  fn fallback_name(&self) -> Result<[u8; FS_FNAME_LEN]> {
    let on_disk = self.read_disk_inode(|record| {
      (record.is_linked() && record.raw_name()[0] != 0).then(|| *record.raw_name())
    })?;
    match on_disk {
      Some(name) => Ok(name),
      None => {
        log::warn!("bug: unlinked inode {} was found", self.ino);
        pack_name(&format!("ufile{}", self.ino))
      }
    }
  }

  /// Drop one link; the inode is deleted when none remain.
  ///
  /// Returns whether the inode was deleted.
  pub(crate) fn unlink_locked(&self, fs: &mut PlainFileSystem) -> Result<bool> {
    let mut inner = self.inner.lock();
    if inner.nlinks == 0 {
      return Err(FsError::Unlinked(self.ino));
    }
    inner.nlinks -= 1;
    inner.mtime = fs.now();
    if inner.nlinks > 0 {
      self.sync_locked(fs, &inner)?;
      return Ok(false);
    }
    self.delete_inner(fs, &mut inner)?;
    Ok(true)
  }

  /// Free the record, its data blocks and its Name Index entry (delete-inode)
  pub fn delete(&self) -> Result<()> {
    let mut fs = self.fs.lock();
    self.delete_locked(&mut fs)?;
    drop(fs);
    self.cache.sync_all()
  }

  pub(crate) fn delete_locked(&self, fs: &mut PlainFileSystem) -> Result<()> {
    let mut inner = self.inner.lock();
    self.delete_inner(fs, &mut inner)
  }

  fn delete_inner(&self, fs: &mut PlainFileSystem, inner: &mut MutexGuard<InodeInner>) -> Result<()> {
    fs.release_slot_blocks(self.slot, &inner.direct);
    inner.direct = [0; FS_IDATA];
    inner.size = 0;
    inner.nlinks = 0;
    self.modify_disk_inode(DiskInode::clear)?;
    fs.names.remove(self.slot);
    fs.forget_inode(self.ino);
    log::debug!("inode {} deleted, slot {} free", self.ino, self.slot);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use alloc::vec;

  use super::*;
  use crate::{
    fs::PlainFileSystem, layout::Geometry, mkfs::format, testing::RamDisk, FS_ROOT_INO,
  };

  fn mounted(blocks: usize) -> (Arc<RamDisk>, Arc<Mutex<PlainFileSystem>>) {
    let disk = Arc::new(RamDisk::new(blocks));
    let geometry = Geometry::from_device_size((blocks * BLOCK_SZ) as u64).unwrap();
    format(disk.as_ref(), &geometry).unwrap();
    let fs = PlainFileSystem::open(disk.clone()).unwrap();
    (disk, fs)
  }

  #[test]
  fn each_logical_block_gets_a_distinct_block() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("f", 0o644).unwrap();
    let mut seen = vec![];
    for block in 0..FS_IDATA {
      assert_eq!(file.get_block(block, false).unwrap(), BlockMapping::Hole);
      match file.get_block(block, true).unwrap() {
        BlockMapping::New(block_id) => seen.push(block_id),
        other => panic!("expected a new block, got {:?}", other),
      }
      assert_eq!(file.get_block(block, true).unwrap(), BlockMapping::Mapped(seen[block]));
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3);
    assert_eq!(file.get_block(3, true), Err(FsError::NoSpace));
    assert_eq!(file.get_block(3, false).unwrap(), BlockMapping::Hole);
  }

  #[test]
  fn write_then_read_back() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("greet", 0o644).unwrap();
    let greet = b"Hello, world!";
    assert_eq!(file.write_at(0, greet).unwrap(), greet.len());
    let mut buf = [0u8; 64];
    let len = file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf[..len], greet);
    assert_eq!(file.stat().size, greet.len() as u64);
    assert_eq!(file.stat().blocks, 1);
  }

  #[test]
  fn fresh_blocks_do_not_leak_filler() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("f", 0o644).unwrap();
    file.write_at(10, b"x").unwrap();
    let mut buf = [0xffu8; 11];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 11);
    assert_eq!(&buf[..10], &[0u8; 10]);
    assert_eq!(buf[10], b'x');
  }

  #[test]
  fn holes_read_as_zeros() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("sparse", 0o644).unwrap();
    file.write_at(2 * BLOCK_SZ, b"tail").unwrap();
    assert_eq!(file.stat().blocks, 1);
    let mut buf = vec![0xaau8; 2 * BLOCK_SZ + 4];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 2 * BLOCK_SZ + 4);
    assert!(buf[..2 * BLOCK_SZ].iter().all(|byte| *byte == 0));
    assert_eq!(&buf[2 * BLOCK_SZ..], b"tail");
  }

  #[test]
  fn writes_stop_at_three_blocks() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("big", 0o644).unwrap();
    let data = vec![7u8; MAX_FILE_SIZE + 100];
    assert_eq!(file.write_at(0, &data).unwrap(), MAX_FILE_SIZE);
    assert_eq!(file.size(), MAX_FILE_SIZE);
    assert_eq!(file.write_at(MAX_FILE_SIZE, b"more"), Err(FsError::NoSpace));
    let mut buf = vec![0u8; MAX_FILE_SIZE + 10];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), MAX_FILE_SIZE);
  }

  #[test]
  fn sync_writes_every_field() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("attrs", 0o600).unwrap();
    file.write_at(0, b"abc").unwrap();
    file.set_owner(3, 4).unwrap();
    file.set_mtime(1234).unwrap();
    file.set_mode(0o640).unwrap();
    let fs = fs.lock();
    let slot = fs.geometry().slot_of(file.ino()).unwrap();
    fs.read_disk_inode(slot, |record| {
      assert_eq!(record.name(), "attrs");
      assert_eq!(record.ino(), FS_ROOT_INO + 1);
      assert_eq!(record.mode(), 0o640 | S_IFREG);
      assert_eq!(record.size(), 3);
      assert_eq!(record.nlinks(), 1);
      assert_eq!((record.uid(), record.gid()), (3, 4));
      assert_eq!(record.mtime(), 1234);
      assert_ne!(record.direct()[0], 0);
      assert_eq!(record.direct()[1..], [0, 0]);
    })
    .unwrap();
  }

  #[test]
  fn placeholder_name_for_unindexed_record() {
    let (_, fs) = mounted(100);
    let file = {
      let mut guard = fs.lock();
      guard.install_inode(&fs, 4, InodeInner::new_file(0o644, 0, 0, 0))
    };
    file.sync().unwrap();
    let fs = fs.lock();
    let name = fs.read_disk_inode(4, |record| record.name()).unwrap();
    assert_eq!(name, "ufile6");
  }

  #[test]
  fn clear_releases_blocks() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("f", 0o644).unwrap();
    file.write_at(0, &[1u8; 1000]).unwrap();
    assert_eq!(fs.lock().statfs().bfree, 78);
    file.clear().unwrap();
    assert_eq!(fs.lock().statfs().bfree, 80);
    assert_eq!(file.size(), 0);
    let mut buf = [0u8; 8];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 0);
  }

  #[test]
  fn delete_frees_record_and_blocks() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("tmp", 0o644).unwrap();
    file.write_at(0, b"data").unwrap();
    file.delete().unwrap();
    assert_eq!(root.lookup_ino("tmp").unwrap(), None);
    assert_eq!(file.stat().nlinks, 0);
    assert!(matches!(file.set_mtime(1), Err(FsError::Unlinked(_))));
    let fs = fs.lock();
    assert_eq!(fs.statfs().bfree, 80);
    assert!(!fs.read_disk_inode(0, DiskInode::is_linked).unwrap());
  }

  #[test]
  fn iget_shares_one_handle() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("shared", 0o644).unwrap();
    let again = PlainFileSystem::iget(&fs, file.ino()).unwrap();
    assert!(Arc::ptr_eq(&file, &again));
    assert!(matches!(PlainFileSystem::iget(&fs, FS_ROOT_INO), Err(FsError::BadInode(_))));
    assert!(matches!(PlainFileSystem::iget(&fs, 9), Err(FsError::NotFound)));
    assert!(matches!(PlainFileSystem::iget(&fs, 500), Err(FsError::BadInode(500))));
  }

  #[test]
  fn failed_block_load_gives_the_block_back() {
    let (disk, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("f", 0o644).unwrap();
    let first_data = fs.lock().geometry().data_zone_start;
    disk.fail_read_once(first_data);
    assert_eq!(file.write_at(0, b"hello"), Err(FsError::Io { block_id: first_data }));
    assert_eq!(file.get_block(0, false).unwrap(), BlockMapping::Hole);
    assert_eq!(file.size(), 0);
    assert_eq!(fs.lock().statfs().bfree, 80);

    assert_eq!(file.write_at(20, b"x").unwrap(), 1);
    assert_eq!(file.get_block(0, false).unwrap(), BlockMapping::Mapped(first_data));
    let mut buf = [0xffu8; 21];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 21);
    assert_eq!(&buf[..20], &[0u8; 20]);
    assert_eq!(buf[20], b'x');
  }

  #[test]
  fn failed_write_back_is_reported() {
    let (disk, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("f", 0o644).unwrap();
    disk.fail_writes_after(0);
    assert!(matches!(file.write_at(0, b"data"), Err(FsError::Io { .. })));
  }
}
