use clap::{App, Arg};
use plain_fs::{format, BlockDevice, FsError, Geometry, BLOCK_SZ, DISK_INODE_SZ, INODES_PER_BLOCK};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// A disk image or block device file seen as 512-byte blocks
struct BlockFile(Mutex<File>);

impl BlockFile {
  fn seek_to(file: &mut File, block_id: usize) -> plain_fs::Result<()> {
    file
      .seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
      .map(|_| ())
      .map_err(|err| {
        log::error!("seek to block {} failed: {}", block_id, err);
        FsError::Io { block_id }
      })
  }

  fn lock(&self, block_id: usize) -> plain_fs::Result<std::sync::MutexGuard<'_, File>> {
    self.0.lock().map_err(|_| FsError::Io { block_id })
  }
}

impl BlockDevice for BlockFile {
  fn read_block(&self, block_id: usize, buf: &mut [u8]) -> plain_fs::Result<()> {
    let mut file = self.lock(block_id)?;
    Self::seek_to(&mut file, block_id)?;
    let mut done = 0;
    while done < buf.len() {
      match file.read(&mut buf[done..]) {
        Ok(0) => break,
        Ok(n) => done += n,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => {
          log::error!("read of block {} failed: {}", block_id, err);
          return Err(FsError::Io { block_id });
        }
      }
    }
    if done != buf.len() {
      return Err(FsError::ShortTransfer { block_id, expected: buf.len(), done });
    }
    Ok(())
  }

  fn write_block(&self, block_id: usize, buf: &[u8]) -> plain_fs::Result<()> {
    let mut file = self.lock(block_id)?;
    Self::seek_to(&mut file, block_id)?;
    let mut done = 0;
    while done < buf.len() {
      match file.write(&buf[done..]) {
        Ok(0) => break,
        Ok(n) => done += n,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => {
          log::error!("write of block {} failed: {}", block_id, err);
          return Err(FsError::Io { block_id });
        }
      }
    }
    if done != buf.len() {
      return Err(FsError::ShortTransfer { block_id, expected: buf.len(), done });
    }
    Ok(())
  }
}

#[derive(Error, Debug)]
enum MkfsError {
  #[error("{path}: {source}")]
  Open { path: String, source: io::Error },
  #[error("{0}")]
  Io(#[from] io::Error),
  #[error("{0}")]
  Fs(#[from] FsError),
}

pub fn main() {
  let matches = App::new("mkfs.plainfs")
    .version(env!("CARGO_PKG_VERSION"))
    .about("Create a PlainFS filesystem on a device or image file")
    .arg(
      Arg::with_name("device")
        .required(true)
        .index(1)
        .help("Block device or image file to format")
    )
    .arg(
      Arg::with_name("verbose")
        .short("v")
        .long("verbose")
        .help("Log formatter progress")
    )
    .get_matches();

  let level = if matches.is_present("verbose") { "info" } else { "warn" };
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

  let device = matches.value_of("device").unwrap_or_default();
  if let Err(err) = run(Path::new(device)) {
    eprintln!("mkfs.plainfs: {}", err);
    process::exit(1);
  }
}

fn run(path: &Path) -> Result<(), MkfsError> {
  let (block_file, device_bytes) = open_device(path)?;
  mkfs(&block_file, device_bytes, &mut io::stdout().lock())?;
  Ok(())
}

/// Open the device at `path` and measure it
fn open_device(path: &Path) -> Result<(Arc<BlockFile>, u64), MkfsError> {
  let mut file = OpenOptions::new()
    .read(true)
    .write(true)
    .open(path)
    .map_err(|source| MkfsError::Open { path: path.display().to_string(), source })?;
  // block devices report a zero length in their metadata
  let device_bytes = file.seek(SeekFrom::End(0))?;
  log::info!("{}: {} bytes", path.display(), device_bytes);
  Ok((Arc::new(BlockFile(Mutex::new(file))), device_bytes))
}

/// Lay out a device of `device_bytes` bytes, report the geometry to `out`,
/// then format it
fn mkfs(block_file: &BlockFile, device_bytes: u64, out: &mut dyn Write) -> Result<Geometry, MkfsError> {
  let geometry = Geometry::from_device_size(device_bytes)?;
  print_geometry(out, &geometry)?;
  format(block_file, &geometry)?;
  block_file.lock(0)?.sync_all()?;
  Ok(geometry)
}

fn print_geometry(out: &mut dyn Write, geometry: &Geometry) -> io::Result<()> {
  writeln!(out, "block size:         {}", BLOCK_SZ)?;
  writeln!(
    out,
    "device size:        {} bytes ({:.2} MiB)",
    geometry.device_bytes,
    geometry.device_bytes as f64 / (1024.0 * 1024.0)
  )?;
  writeln!(out, "total blocks:       {}", geometry.total_blocks)?;
  writeln!(out, "lost bytes:         {}", geometry.lost_bytes)?;
  writeln!(out, "inode size:         {}", DISK_INODE_SZ)?;
  writeln!(out, "inodes per block:   {}", INODES_PER_BLOCK)?;
  writeln!(out, "inodes:             {}", geometry.inode_count)?;
  writeln!(out, "inode table blocks: {}", geometry.inode_table_blocks)?;
  writeln!(out, "data zone blocks:   {}", geometry.data_zone_blocks)?;
  writeln!(out, "lost blocks:        {}", geometry.lost_blocks)?;
  out.flush()
}
