use alloc::{
  string::{String, ToString},
  sync::Arc,
  vec::Vec,
};
use spin::Mutex;

use crate::{
  config::{S_IFDIR, FS_ROOT_INO},
  error::{FsError, Result},
  fs::PlainFileSystem,
  layout::{pack_name, unpack_name},
  vfs::{Inode, InodeInner, InodeStat},
};

/// One entry produced by `RootDir::enumerate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  pub name: String,
  pub ino: u32,
}

/// The root directory, the only directory of a PlainFS.
///
/// Name lookups go through the mount's Name Index, which knows the files
/// created during this mount and everything seen by the last `enumerate`.
pub struct RootDir {
  fs: Arc<Mutex<PlainFileSystem>>,
}

impl RootDir {
  pub(crate) fn new(fs: Arc<Mutex<PlainFileSystem>>) -> Self {
    Self { fs }
  }

  pub fn ino(&self) -> u32 {
    FS_ROOT_INO
  }

  /// Synthesized attributes; the root has no on-disk record
  pub fn stat(&self) -> InodeStat {
    let fs = self.fs.lock();
    InodeStat {
      ino: FS_ROOT_INO,
      mode: S_IFDIR | 0o644,
      size: fs.geometry().inode_count as u64,
      nlinks: 2,
      uid: 0,
      gid: 0,
      mtime: fs.now(),
      blocks: 0,
    }
  }

  /// Create an empty file in the first free slot
  pub fn create(&self, name: &str, mode: u16) -> Result<Arc<Inode>> {
    let raw = pack_name(name)?;
    let mut fs = self.fs.lock();
    if fs.names.lookup(&raw).is_some() {
      return Err(FsError::AlreadyExists);
    }
    let ino = fs.find_free_inode_slot()?;
    let slot = fs.geometry().slot_of(ino).ok_or(FsError::BadInode(ino))?;
    let (uid, gid) = (fs.options.uid, fs.options.gid);
    let inner = InodeInner::new_file(mode, uid, gid, fs.now());
    fs.names.insert(slot, raw, ino);
    let inode = fs.install_inode(&self.fs, slot, inner.clone());
    if let Err(err) = inode.sync_locked(&fs, &inner) {
      fs.names.remove(slot);
      fs.forget_inode(ino);
      return Err(err);
    }
    drop(fs);
    self.sync()?;
    log::debug!("created {:?} as inode {}", unpack_name(&raw), ino);
    Ok(inode)
  }

  /// inode number behind `name`, as far as the Name Index knows
  pub fn lookup_ino(&self, name: &str) -> Result<Option<u32>> {
    let raw = pack_name(name)?;
    Ok(self.fs.lock().names.lookup(&raw))
  }

  /// Open the file behind `name`, as far as the Name Index knows
  pub fn find_name(&self, name: &str) -> Result<Option<Arc<Inode>>> {
    let raw = pack_name(name)?;
    let mut fs = self.fs.lock();
    match fs.names.lookup(&raw) {
      Some(ino) => fs.load_inode(&self.fs, ino).map(Some),
      None => Ok(None),
    }
  }

  /// List `.`, `..` and every linked file, refreshing the Name Index from disk
  pub fn enumerate(&self) -> Result<Vec<DirEntry>> {
    let mut guard = self.fs.lock();
    let fs = &mut *guard;
    let linked = fs.names.rebuild_from_disk(&fs.geometry, &fs.cache)?;
    let mut entries = Vec::with_capacity(linked.len() + 2);
    entries.push(DirEntry { name: ".".to_string(), ino: FS_ROOT_INO });
    entries.push(DirEntry { name: "..".to_string(), ino: FS_ROOT_INO });
    entries.extend(linked.into_iter().map(|(_, entry)| DirEntry {
      name: unpack_name(&entry.name),
      ino: entry.ino,
    }));
    Ok(entries)
  }

  /// list file names under the root
  pub fn ls(&self) -> Result<Vec<String>> {
    Ok(self
      .enumerate()?
      .into_iter()
      .skip(2)
      .map(|entry| entry.name)
      .collect())
  }

  /// Give the file `old` the name `new`, replacing a file already named `new`
  pub fn rename(&self, old: &str, new: &str) -> Result<()> {
    let old_raw = pack_name(old)?;
    let new_raw = pack_name(new)?;
    let mut fs = self.fs.lock();
    let ino = fs.names.lookup(&old_raw).ok_or(FsError::NotFound)?;
    if old_raw == new_raw {
      return Ok(());
    }
    let inode = fs.load_inode(&self.fs, ino)?;
    if let Some(target) = fs.names.lookup(&new_raw) {
      let target = fs.load_inode(&self.fs, target)?;
      target.delete_locked(&mut fs)?;
    }
    let slot = fs.geometry().slot_of(ino).ok_or(FsError::BadInode(ino))?;
    fs.modify_disk_inode(slot, |record| record.set_name(&new_raw))?;
    fs.names.insert(slot, new_raw, inode.ino());
    drop(fs);
    self.sync()
  }

  /// Remove `name`; its inode is deleted once no links remain
  pub fn unlink(&self, name: &str) -> Result<()> {
    let raw = pack_name(name)?;
    let mut fs = self.fs.lock();
    let ino = fs.names.lookup(&raw).ok_or(FsError::NotFound)?;
    let inode = fs.load_inode(&self.fs, ino)?;
    inode.unlink_locked(&mut fs)?;
    drop(fs);
    self.sync()
  }

  pub fn statfs(&self) -> crate::FsStat {
    self.fs.lock().statfs()
  }

  fn sync(&self) -> Result<()> {
    self.fs.lock().sync()
  }
}

#[cfg(test)]
mod tests {
  use alloc::{format, vec};

  use super::*;
  use crate::{layout::Geometry, mkfs::format, testing::RamDisk, BLOCK_SZ};

  fn mounted(blocks: usize) -> (Arc<RamDisk>, Arc<Mutex<PlainFileSystem>>) {
    let disk = Arc::new(RamDisk::new(blocks));
    let geometry = Geometry::from_device_size((blocks * BLOCK_SZ) as u64).unwrap();
    format(disk.as_ref(), &geometry).unwrap();
    let fs = PlainFileSystem::open(disk.clone()).unwrap();
    (disk, fs)
  }

  fn names(entries: &[DirEntry]) -> Vec<&str> {
    entries.iter().map(|entry| entry.name.as_str()).collect()
  }

  #[test]
  fn fresh_device_lists_only_dot_entries() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let entries = root.enumerate().unwrap();
    assert_eq!(names(&entries), [".", ".."]);
    assert!(entries.iter().all(|entry| entry.ino == FS_ROOT_INO));
    assert_eq!(fs.lock().names.populated(), 0);
  }

  #[test]
  fn three_files_scenario() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let files: Vec<_> = ["f0", "f1", "f2"]
      .iter()
      .map(|name| root.create(name, 0o644).unwrap())
      .collect();
    let inos: Vec<_> = files.iter().map(|file| file.ino()).collect();
    assert_eq!(inos, [FS_ROOT_INO + 1, FS_ROOT_INO + 2, FS_ROOT_INO + 3]);

    let mut blocks = vec![];
    for file in &files {
      match file.get_block(0, true).unwrap() {
        crate::BlockMapping::New(block_id) => blocks.push(block_id),
        other => panic!("expected a fresh block, got {:?}", other),
      }
    }
    blocks.sort();
    blocks.dedup();
    assert_eq!(blocks.len(), 3);

    let entries = root.enumerate().unwrap();
    assert_eq!(names(&entries), [".", "..", "f0", "f1", "f2"]);
  }

  #[test]
  fn create_fills_the_table_then_fails() {
    let (_, fs) = mounted(18);
    let root = PlainFileSystem::root_inode(&fs);
    for i in 0..16 {
      root.create(&format!("file{}", i), 0o644).unwrap();
    }
    assert!(matches!(root.create("onemore", 0o644), Err(FsError::TableFull)));
  }

  #[test]
  fn create_rejects_duplicates_and_bad_names() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    root.create("same", 0o644).unwrap();
    assert!(matches!(root.create("same", 0o644), Err(FsError::AlreadyExists)));
    assert!(matches!(root.create("", 0o644), Err(FsError::InvalidName)));
    assert!(matches!(root.create("a/b", 0o644), Err(FsError::InvalidName)));
  }

  #[test]
  fn long_names_are_found_by_their_prefix() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("averylongname", 0o644).unwrap();
    assert_eq!(root.lookup_ino("averylongn").unwrap(), Some(file.ino()));
    assert_eq!(root.ls().unwrap(), ["averylongn"]);
  }

  #[test]
  fn lookup_sees_current_session_creations() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("now", 0o644).unwrap();
    assert_eq!(root.lookup_ino("now").unwrap(), Some(file.ino()));
    let found = root.find_name("now").unwrap().unwrap();
    assert!(Arc::ptr_eq(&found, &file));
    assert!(root.find_name("missing").unwrap().is_none());
  }

  #[test]
  fn prior_session_files_need_an_enumerate() {
    let (disk, fs) = mounted(100);
    let ino = {
      let root = PlainFileSystem::root_inode(&fs);
      let file = root.create("a", 0o644).unwrap();
      file.write_at(0, b"kept").unwrap();
      file.ino()
    };
    PlainFileSystem::unmount(fs).unwrap();

    let fs = PlainFileSystem::open(disk).unwrap();
    let root = PlainFileSystem::root_inode(&fs);
    assert_eq!(root.lookup_ino("a").unwrap(), None);
    assert!(root.find_name("a").unwrap().is_none());

    let entries = root.enumerate().unwrap();
    assert_eq!(names(&entries), [".", "..", "a"]);
    assert_eq!(root.lookup_ino("a").unwrap(), Some(ino));
    let file = root.find_name("a").unwrap().unwrap();
    let mut buf = [0u8; 8];
    let len = file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"kept");
  }

  #[test]
  fn create_before_enumerate_keeps_prior_files() {
    let (disk, fs) = mounted(100);
    {
      let root = PlainFileSystem::root_inode(&fs);
      root.create("old", 0o644).unwrap().write_at(0, b"old data").unwrap();
    }
    drop(fs);

    let fs = PlainFileSystem::open(disk).unwrap();
    let root = PlainFileSystem::root_inode(&fs);
    let new = root.create("new", 0o644).unwrap();
    assert_eq!(new.ino(), FS_ROOT_INO + 2);
    match new.get_block(0, true).unwrap() {
      crate::BlockMapping::New(block_id) => {
        assert_ne!(block_id, fs.lock().geometry().data_zone_start)
      }
      other => panic!("expected a fresh block, got {:?}", other),
    }
    assert_eq!(names(&root.enumerate().unwrap()), [".", "..", "old", "new"]);
  }

  #[test]
  fn unlink_releases_blocks_and_slot() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let keep = root.create("keep", 0o644).unwrap();
    keep.write_at(0, b"k").unwrap();
    let gone = root.create("gone", 0o644).unwrap();
    gone.write_at(0, &[1u8; 2 * BLOCK_SZ]).unwrap();
    let gone_ino = gone.ino();
    assert_eq!(root.statfs().bfree, 77);

    root.unlink("gone").unwrap();
    assert_eq!(root.statfs().bfree, 79);
    assert_eq!(root.lookup_ino("gone").unwrap(), None);
    assert_eq!(gone.stat().nlinks, 0);
    assert!(matches!(gone.write_at(0, b"x"), Err(FsError::Unlinked(_))));
    assert!(matches!(root.unlink("gone"), Err(FsError::NotFound)));
    assert_eq!(names(&root.enumerate().unwrap()), [".", "..", "keep"]);

    let reused = root.create("again", 0o644).unwrap();
    assert_eq!(reused.ino(), gone_ino);
    assert!(!Arc::ptr_eq(&reused, &gone));
    assert_eq!(reused.size(), 0);
  }

  #[test]
  fn rename_updates_disk_and_index() {
    let (disk, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let file = root.create("before", 0o644).unwrap();
    root.rename("before", "after").unwrap();
    assert_eq!(root.lookup_ino("before").unwrap(), None);
    assert_eq!(root.lookup_ino("after").unwrap(), Some(file.ino()));
    file.write_at(0, b"x").unwrap();
    drop(file);
    drop(root);
    drop(fs);

    let fs = PlainFileSystem::open(disk).unwrap();
    let root = PlainFileSystem::root_inode(&fs);
    assert_eq!(root.ls().unwrap(), ["after"]);
  }

  #[test]
  fn rename_onto_existing_name_replaces_it() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let src = root.create("src", 0o644).unwrap();
    let dst = root.create("dst", 0o644).unwrap();
    dst.write_at(0, b"old").unwrap();
    root.rename("src", "dst").unwrap();
    assert_eq!(root.lookup_ino("dst").unwrap(), Some(src.ino()));
    assert_eq!(dst.stat().nlinks, 0);
    assert_eq!(root.statfs().bfree, 80);
    assert_eq!(root.ls().unwrap(), ["dst"]);
    assert!(matches!(root.rename("nope", "x"), Err(FsError::NotFound)));
  }

  #[test]
  fn concurrent_creates_never_share_slots_or_blocks() {
    let (_, fs) = mounted(100);
    let workers: Vec<_> = (0..8u8)
      .map(|worker| {
        let fs = fs.clone();
        std::thread::spawn(move || {
          let root = PlainFileSystem::root_inode(&fs);
          (0..8u8)
            .map(|i| {
              let tag = worker * 8 + i;
              let file = root.create(&format!("w{}f{}", worker, i), 0o644).unwrap();
              assert_eq!(file.write_at(0, &[tag]).unwrap(), 1);
              (tag, file)
            })
            .collect::<Vec<_>>()
        })
      })
      .collect();
    let files: Vec<_> = workers
      .into_iter()
      .flat_map(|worker| worker.join().unwrap())
      .collect();
    assert_eq!(files.len(), 64);

    let mut inos: Vec<_> = files.iter().map(|(_, file)| file.ino()).collect();
    inos.sort();
    inos.dedup();
    assert_eq!(inos.len(), 64);

    let mut blocks = vec![];
    for (tag, file) in &files {
      match file.get_block(0, false).unwrap() {
        crate::BlockMapping::Mapped(block_id) => blocks.push(block_id),
        other => panic!("expected a mapped block, got {:?}", other),
      }
      let mut buf = [0u8; 4];
      assert_eq!(file.read_at(0, &mut buf).unwrap(), 1);
      assert_eq!(buf[0], *tag);
    }
    blocks.sort();
    blocks.dedup();
    assert_eq!(blocks.len(), 64);

    let root = PlainFileSystem::root_inode(&fs);
    assert_eq!(root.statfs().bfree, 16);
    assert_eq!(root.enumerate().unwrap().len(), 66);
  }

  #[test]
  fn root_stat_is_synthesized() {
    let (_, fs) = mounted(100);
    let root = PlainFileSystem::root_inode(&fs);
    let stat = root.stat();
    assert_eq!(stat.ino, FS_ROOT_INO);
    assert_eq!(stat.mode, S_IFDIR | 0o644);
    assert_eq!(stat.size, 80);
  }
}
