use alloc::{string::String, vec, vec::Vec};

/// In-memory allocation bitmap, one bit per inode slot.
///
/// Bit `i` stands for the data block `data_zone_start + i`. The bitmap is never
/// stored on disk; it lives for one mount.
pub struct Bitmap {
  bytes: Vec<u8>,
  bits: usize,
}

fn decompose(bit: usize) -> (usize, u8) {
  (bit / 8, 1u8 << (bit % 8))
}

impl Bitmap {
  /// A zeroed bitmap of `bits` bits, `ceil(bits / 8)` bytes long
  pub fn new(bits: usize) -> Self {
    Self {
      bytes: vec![0u8; (bits + 7) / 8],
      bits,
    }
  }

  /// Set and return the first clear bit, scanning from bit 0
  pub fn alloc(&mut self) -> Option<usize> {
    let (byte_pos, inner_pos) = self
      .bytes
      .iter()
      .enumerate()
      .find(|(_, byte)| **byte != u8::MAX)
      .map(|(idx, byte)| (idx, byte.trailing_ones() as usize))?;
    let bit = byte_pos * 8 + inner_pos;
    if bit >= self.bits {
      return None;
    }
    self.bytes[byte_pos] |= 1u8 << inner_pos;
    Some(bit)
  }

  pub fn set(&mut self, bit: usize) {
    assert!(bit < self.bits);
    let (byte_pos, mask) = decompose(bit);
    self.bytes[byte_pos] |= mask;
  }

  /// Clear `bit`, returning whether it was set
  pub fn clear(&mut self, bit: usize) -> bool {
    assert!(bit < self.bits);
    let (byte_pos, mask) = decompose(bit);
    let was_set = self.bytes[byte_pos] & mask != 0;
    self.bytes[byte_pos] &= !mask;
    was_set
  }

  pub fn test(&self, bit: usize) -> bool {
    let (byte_pos, mask) = decompose(bit);
    bit < self.bits && self.bytes[byte_pos] & mask != 0
  }

  pub fn count_set(&self) -> usize {
    self.bytes.iter().map(|byte| byte.count_ones() as usize).sum()
  }

  /// Number of bits
  pub fn maximum(&self) -> usize {
    self.bits
  }

  /// Bits rendered as '0'/'1', in rows of `width`
  pub fn rows(&self, width: usize) -> Vec<String> {
    let mut rows = Vec::new();
    let mut row = String::new();
    for bit in 0..self.maximum() {
      row.push(if self.test(bit) { '1' } else { '0' });
      if row.len() == width {
        rows.push(core::mem::take(&mut row));
      }
    }
    if !row.is_empty() {
      rows.push(row);
    }
    rows
  }
}
