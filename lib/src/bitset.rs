/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Fixed-size bitsets over virtual register indices, and a 2D bitmap used to
//! record which registers are live inside which loops.

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

const BLOCK_SIZE: usize = 64;

#[derive(Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct BitSet {
  bits: Vec<u64>,
  size: usize,
}

impl BitSet {
  pub fn new(size: usize) -> Self {
    Self { bits: vec![0; (size + BLOCK_SIZE - 1) / BLOCK_SIZE], size }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  #[inline]
  fn split(index: usize) -> (usize, u64) {
    (index / BLOCK_SIZE, 1u64 << (index % BLOCK_SIZE))
  }

  pub fn insert(&mut self, index: usize) {
    debug_assert!(index < self.size, "bit index out of bounds");
    let (word, mask) = Self::split(index);
    self.bits[word] |= mask;
  }

  pub fn remove(&mut self, index: usize) {
    debug_assert!(index < self.size, "bit index out of bounds");
    let (word, mask) = Self::split(index);
    self.bits[word] &= !mask;
  }

  pub fn contains(&self, index: usize) -> bool {
    if index >= self.size {
      return false;
    }
    let (word, mask) = Self::split(index);
    self.bits[word] & mask != 0
  }

  pub fn is_empty(&self) -> bool {
    self.bits.iter().all(|&bits| bits == 0)
  }

  pub fn card(&self) -> usize {
    self.bits.iter().map(|bits| bits.count_ones() as usize).sum()
  }

  pub fn clear(&mut self) {
    for bits in self.bits.iter_mut() {
      *bits = 0;
    }
  }

  /// Adds all elements of `other`; returns whether `self` changed.
  pub fn union_with(&mut self, other: &BitSet) -> bool {
    debug_assert!(self.size == other.size);
    let mut changed = false;
    for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
      let merged = *dst | *src;
      changed |= merged != *dst;
      *dst = merged;
    }
    changed
  }

  /// Removes all elements of `other`.
  pub fn remove_all(&mut self, other: &BitSet) {
    debug_assert!(self.size == other.size);
    for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
      *dst &= !*src;
    }
  }

  pub fn iter(&self) -> BitSetIter {
    let cur = self.bits.first().copied().unwrap_or(0);
    BitSetIter { set: self, word: 0, cur }
  }
}

impl fmt::Debug for BitSet {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fmt.debug_set().entries(self.iter()).finish()
  }
}

pub struct BitSetIter<'a> {
  set: &'a BitSet,
  word: usize,
  cur: u64,
}

impl<'a> Iterator for BitSetIter<'a> {
  type Item = usize;
  fn next(&mut self) -> Option<usize> {
    loop {
      if self.cur != 0 {
        let bit = self.cur.trailing_zeros() as usize;
        self.cur &= self.cur - 1;
        return Some(self.word * BLOCK_SIZE + bit);
      }
      self.word += 1;
      if self.word >= self.set.bits.len() {
        return None;
      }
      self.cur = self.set.bits[self.word];
    }
  }
}

/// A `rows x cols` bitmap, stored row-major.
#[derive(Clone, Debug)]
pub struct BitMap2D {
  bits: BitSet,
  rows: usize,
  cols: usize,
}

impl BitMap2D {
  pub fn new(rows: usize, cols: usize) -> Self {
    Self { bits: BitSet::new(rows * cols), rows, cols }
  }

  pub fn at(&self, row: usize, col: usize) -> bool {
    if row >= self.rows || col >= self.cols {
      return false;
    }
    self.bits.contains(row * self.cols + col)
  }

  pub fn set(&mut self, row: usize, col: usize) {
    debug_assert!(row < self.rows && col < self.cols);
    self.bits.insert(row * self.cols + col);
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn insert_and_iterate_across_words() {
    let mut set = BitSet::new(200);
    assert!(set.is_empty());
    set.insert(0);
    set.insert(63);
    set.insert(64);
    set.insert(199);
    assert_eq!(set.card(), 4);
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 199]);
    set.remove(63);
    assert!(!set.contains(63));
    assert!(!set.contains(1000));
  }

  #[test]
  fn union_reports_changes() {
    let mut a = BitSet::new(70);
    let mut b = BitSet::new(70);
    b.insert(3);
    b.insert(69);
    assert!(a.union_with(&b));
    assert!(!a.union_with(&b));
    assert_eq!(a, b);
    a.insert(10);
    a.remove_all(&b);
    assert_eq!(a.iter().collect::<Vec<_>>(), vec![10]);
  }

  #[test]
  fn bitmap_rows_and_columns_are_independent() {
    let mut map = BitMap2D::new(5, 3);
    map.set(4, 2);
    map.set(0, 0);
    assert!(map.at(4, 2));
    assert!(!map.at(2, 4));
    assert!(!map.at(4, 1));
    assert!(map.at(0, 0));
    assert!(!map.at(9, 0));
  }
}
