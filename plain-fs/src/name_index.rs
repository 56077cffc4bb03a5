//! Name lookup cache of the root directory.
//!
//! Slot `i` holds the name and inode number of inode-table record `i` once that
//! record has been seen. Entries appear when a file is created during this
//! mount or when `rebuild_from_disk` scans the table; lookups never read the
//! disk, so a file from an earlier mount stays invisible until the directory
//! has been enumerated.
use alloc::vec::Vec;

use crate::{
  block_cache::BlockCacheManager,
  config::FS_FNAME_LEN,
  error::Result,
  layout::{Geometry, InodeTableBlock, INODES_PER_BLOCK},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
  pub name: [u8; FS_FNAME_LEN],
  pub ino: u32,
}

pub struct NameIndex {
  entries: Vec<Option<NameEntry>>,
}

impl NameIndex {
  /// An index of `slots` empty entries
  pub fn new(slots: usize) -> Self {
    Self {
      entries: (0..slots).map(|_| None).collect(),
    }
  }

  /// inode number cached under `name`
  pub fn lookup(&self, name: &[u8; FS_FNAME_LEN]) -> Option<u32> {
    self
      .entries
      .iter()
      .flatten()
      .find(|entry| entry.name == *name)
      .map(|entry| entry.ino)
  }

  /// Cached name of inode `ino`
  pub fn name_of(&self, ino: u32) -> Option<&[u8; FS_FNAME_LEN]> {
    self
      .entries
      .iter()
      .flatten()
      .find(|entry| entry.ino == ino)
      .map(|entry| &entry.name)
  }

  /// Put an entry in `slot`, returning the one it replaced
  pub fn insert(&mut self, slot: usize, name: [u8; FS_FNAME_LEN], ino: u32) -> Option<NameEntry> {
    self.entries[slot].replace(NameEntry { name, ino })
  }

  pub fn remove(&mut self, slot: usize) -> Option<NameEntry> {
    self.entries.get_mut(slot).and_then(Option::take)
  }

  /// Empty slots in ascending order
  pub fn empty_slots(&self) -> impl Iterator<Item = usize> + '_ {
    self
      .entries
      .iter()
      .enumerate()
      .filter(|(_, entry)| entry.is_none())
      .map(|(slot, _)| slot)
  }

  pub fn populated(&self) -> usize {
    self.entries.iter().filter(|entry| entry.is_some()).count()
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Release every entry
  pub fn clear(&mut self) {
    self.entries.iter_mut().for_each(|entry| *entry = None);
  }

  /// Read the inode table once and refresh the entry of every linked record.
  ///
  /// Slots whose record is free on disk are left as they are. Returns the
  /// linked records as `(slot, entry)` in table order.
  pub fn rebuild_from_disk(
    &mut self,
    geometry: &Geometry,
    cache: &BlockCacheManager,
  ) -> Result<Vec<(usize, NameEntry)>> {
    let mut linked = Vec::new();
    for table_block in 0..geometry.inode_table_blocks {
      let (block_id, _) = geometry.inode_pos(table_block * INODES_PER_BLOCK);
      let found: Vec<(usize, NameEntry, u32)> = cache
        .get_block_cache(block_id)?
        .lock()
        .read(0, |records: &InodeTableBlock| {
          records
            .iter()
            .enumerate()
            .map(|(i, record)| (table_block * INODES_PER_BLOCK + i, record))
            .filter(|(slot, record)| *slot < geometry.inode_count && record.is_linked())
            .map(|(slot, record)| {
              let entry = NameEntry { name: *record.raw_name(), ino: geometry.ino_of(slot) };
              (slot, entry, record.ino())
            })
            .collect()
        });
      for (slot, entry, stored_ino) in found {
        if stored_ino != entry.ino {
          log::warn!("slot {} records inode {}, expected {}", slot, stored_ino, entry.ino);
        }
        self.insert(slot, entry.name, entry.ino);
        linked.push((slot, entry));
      }
    }
    log::debug!("name index rebuilt: {} linked records", linked.len());
    Ok(linked)
  }
}
