/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Orders a set of parallel interval-to-interval moves so that no move
//! overwrites a register another pending move still reads.
//!
//! A register is blocked while it is the source of a pending move. A move is
//! emitted once its destination registers are unblocked, or only blocked by
//! its own source. When every pending move is blocked, the moves form a
//! cycle: one source is copied to its canonical spill slot through a
//! temporary stack interval and the mapping is redirected to read from there.

use log::{debug, trace};

use crate::data_structures::*;
use crate::inst_stream::InsertionBuffer;
use crate::interface::RegAllocError;
use crate::interval::{IntId, IntervalLocation};
use crate::linear_scan::{bailout, LinearScan};
use crate::lir::LirOp;

/// Op list receiving the moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InsertTarget {
  Block(BlockIx),
  /// A list that is not part of any block, see `MoveResolver::take_detached`.
  Detached,
}

pub(crate) struct MoveResolver {
  insert_target: Option<InsertTarget>,
  insert_idx: i32,
  buffer: InsertionBuffer,

  /// `None` means the source is the constant at the same index of
  /// `mapping_from_opr`.
  mapping_from: Vec<Option<IntId>>,
  mapping_from_opr: Vec<Operand>,
  mapping_to: Vec<IntId>,
  multiple_reads_allowed: bool,
  register_blocked: Vec<u32>,

  detached: Vec<LirOp>,
}

impl MoveResolver {
  pub(crate) fn new(num_regs: usize) -> Self {
    Self {
      insert_target: None,
      insert_idx: -1,
      buffer: InsertionBuffer::new(),
      mapping_from: Vec::new(),
      mapping_from_opr: Vec::new(),
      mapping_to: Vec::new(),
      multiple_reads_allowed: false,
      register_blocked: vec![0; num_regs],
      detached: Vec::new(),
    }
  }

  pub(crate) fn has_mappings(&self) -> bool {
    !self.mapping_from.is_empty()
  }

  /// Allows one interval to be the source of several mappings. Reset after
  /// the next resolution.
  pub(crate) fn set_multiple_reads_allowed(&mut self) {
    self.multiple_reads_allowed = true;
  }

  /// Ops resolved into the detached list.
  pub(crate) fn take_detached(&mut self) -> Vec<LirOp> {
    std::mem::take(&mut self.detached)
  }

  //===========================================================================
  // Register blocking

  fn regs_of(location: IntervalLocation) -> impl Iterator<Item = usize> {
    location.reg().into_iter().chain(location.hi()).map(|r| r.get_index())
  }

  fn block_registers(&mut self, ls: &LinearScan, id: IntId) {
    for reg in Self::regs_of(ls.intervals.get(id).location) {
      debug_assert!(
        self.multiple_reads_allowed || self.register_blocked[reg] == 0,
        "register already marked as used"
      );
      self.register_blocked[reg] += 1;
    }
  }

  fn unblock_registers(&mut self, ls: &LinearScan, id: IntId) {
    for reg in Self::regs_of(ls.intervals.get(id).location) {
      debug_assert!(
        self.register_blocked[reg] > 0,
        "register already marked as unused"
      );
      self.register_blocked[reg] -= 1;
    }
  }

  /// Whether writing `to` cannot destroy the source of another pending move.
  fn save_to_process_move(
    &self, ls: &LinearScan, from: Option<IntId>, to: IntId,
  ) -> bool {
    let (from_reg, from_hi) = match from {
      Some(from) => {
        let location = ls.intervals.get(from).location;
        (location.reg(), location.hi())
      }
      None => (None, None),
    };
    let location = ls.intervals.get(to).location;
    for reg in location.reg().into_iter().chain(location.hi()) {
      let blocked = self.register_blocked[reg.get_index()];
      if blocked > 1
        || (blocked == 1 && Some(reg) != from_reg && Some(reg) != from_hi)
      {
        return false;
      }
    }
    true
  }

  //===========================================================================
  // Emission

  fn insert_move(&mut self, ls: &mut LinearScan, from: IntId, to: IntId) {
    debug_assert!(from != to, "move between the same interval");
    let src = ls.intervals.operand(from);
    let dst = ls.intervals.operand(to);
    debug!(
      "insert move {:?} ({}) -> {:?} ({}) at {}",
      src,
      ls.intervals.get(from).location,
      dst,
      ls.intervals.get(to).location,
      self.insert_idx
    );
    self.buffer.append(self.insert_idx, LirOp::mov(src, dst));
    ls.num_inserted_moves += 1;
  }

  fn insert_constant_move(
    &mut self, ls: &mut LinearScan, from: Operand, to: IntId,
  ) {
    let dst = ls.intervals.operand(to);
    debug!("insert move {:?} -> {:?} at {}", from, dst, self.insert_idx);
    self.buffer.append(self.insert_idx, LirOp::mov(from, dst));
    ls.num_inserted_moves += 1;
  }

  fn remove_mapping(&mut self, i: usize) {
    self.mapping_from.remove(i);
    self.mapping_from_opr.remove(i);
    self.mapping_to.remove(i);
  }

  fn resolve_mappings(
    &mut self, ls: &mut LinearScan,
  ) -> Result<(), RegAllocError> {
    let show_debug = ls.trace_moves;
    if show_debug {
      trace!(
        "resolving {} mappings at {:?}:{}",
        self.mapping_to.len(),
        self.insert_target,
        self.insert_idx
      );
    }

    for i in (0..self.mapping_from.len()).rev() {
      if let Some(from) = self.mapping_from[i] {
        self.block_registers(ls, from);
      }
    }

    while !self.mapping_from.is_empty() {
      let mut processed = false;
      let mut spill_candidate = None;

      for i in (0..self.mapping_from.len()).rev() {
        let from = self.mapping_from[i];
        let to = self.mapping_to[i];
        if self.save_to_process_move(ls, from, to) {
          match from {
            Some(from) => {
              self.insert_move(ls, from, to);
              self.unblock_registers(ls, from);
            }
            None => {
              let opr = self.mapping_from_opr[i];
              self.insert_constant_move(ls, opr, to);
            }
          }
          self.remove_mapping(i);
          processed = true;
        } else if let Some(from) = from {
          if ls.intervals.get(from).location.reg().is_some() {
            spill_candidate = Some(i);
          }
        } else if show_debug {
          trace!("  blocked: {:?} -> {:?}", self.mapping_from_opr[i], to);
        }
      }

      if !processed {
        // Only a register source can block a pending move.
        let candidate = spill_candidate.map(|i| (i, self.mapping_from[i]));
        let (i, from) = match candidate {
          Some((i, Some(from))) => (i, from),
          _ => {
            return Err(bailout(
              "LinearScan: no spill candidate in move resolver",
            ))
          }
        };
        if show_debug {
          trace!("  breaking cycle at {:?}", from);
        }

        // The temporary reuses the canonical slot of the source, so that
        // no stack-to-stack move is needed later.
        let kind = ls.intervals.get(from).kind;
        let slot = match ls.intervals.canonical_spill_slot(from) {
          Some(slot) => slot,
          None => {
            let slot = ls.allocate_spill_slot(kind)?;
            ls.intervals.set_canonical_spill_slot(from, slot);
            slot
          }
        };
        let spill = ls.intervals.create_derived(kind);
        {
          let interval = ls.intervals.get_mut(spill);
          interval.add_range(1, 2);
          interval.location = IntervalLocation::Stack(slot);
        }

        self.insert_move(ls, from, spill);
        self.mapping_from[i] = Some(spill);
        self.unblock_registers(ls, from);
      }
    }

    self.mapping_from.clear();
    self.mapping_from_opr.clear();
    self.mapping_to.clear();
    self.multiple_reads_allowed = false;
    debug_assert!(
      self.register_blocked.iter().all(|&n| n == 0),
      "register still blocked after resolution"
    );
    Ok(())
  }

  //===========================================================================
  // Insert positions

  fn append_insertion_buffer(&mut self, ls: &mut LinearScan) {
    match self.insert_target {
      Some(InsertTarget::Block(bix)) => {
        self.buffer.apply(&mut ls.lir.blocks[bix].ops);
      }
      Some(InsertTarget::Detached) => self.buffer.apply(&mut self.detached),
      None => debug_assert!(self.buffer.is_empty()),
    }
    self.insert_target = None;
    self.insert_idx = -1;
  }

  /// Starts collecting mappings that are inserted after the op at `idx`.
  pub(crate) fn set_insert_position(&mut self, target: InsertTarget, idx: i32) {
    debug_assert!(self.insert_target.is_none(), "insert position already set");
    self.insert_target = Some(target);
    self.insert_idx = idx;
  }

  /// Like `set_insert_position`, but resolves the mappings collected so far
  /// when the position changes.
  pub(crate) fn move_insert_position(
    &mut self, ls: &mut LinearScan, target: InsertTarget, idx: i32,
  ) -> Result<(), RegAllocError> {
    if let Some(current) = self.insert_target {
      if current != target || self.insert_idx != idx {
        self.resolve_mappings(ls)?;
      }
      if current != target {
        self.append_insertion_buffer(ls);
      }
    }
    self.insert_target = Some(target);
    self.insert_idx = idx;
    Ok(())
  }

  pub(crate) fn add_mapping(
    &mut self, ls: &LinearScan, from: IntId, to: IntId,
  ) {
    debug_assert!(
      ls.intervals.get(from).reg_num != ls.intervals.get(to).reg_num,
      "from and to interval equal"
    );
    trace!("add mapping {:?} -> {:?}", from, to);
    self.mapping_from.push(Some(from));
    self.mapping_from_opr.push(Operand::Illegal);
    self.mapping_to.push(to);
  }

  pub(crate) fn add_constant_mapping(&mut self, from: Operand, to: IntId) {
    debug_assert!(from.is_constant());
    trace!("add mapping {:?} -> {:?}", from, to);
    self.mapping_from.push(None);
    self.mapping_from_opr.push(from);
    self.mapping_to.push(to);
  }

  pub(crate) fn resolve_and_append_moves(
    &mut self, ls: &mut LinearScan,
  ) -> Result<(), RegAllocError> {
    if self.has_mappings() {
      self.resolve_mappings(ls)?;
    }
    self.append_insertion_buffer(ls);
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::lir::LirOpKind;
  use crate::test_util::*;

  fn reg_interval(ls: &mut LinearScan, reg: u8) -> IntId {
    let id = ls.intervals.create_derived(ValueKind::Int);
    let interval = ls.intervals.get_mut(id);
    interval.add_range(10, 20);
    interval.location = IntervalLocation::Reg(RealReg(reg), None);
    id
  }

  fn moves(ops: &[LirOp]) -> Vec<(Operand, Operand)> {
    ops.iter().filter_map(|op| op.as_move()).collect()
  }

  #[test]
  fn chain_is_ordered_and_cycle_is_broken() {
    let mut lir = make_lir(vec![make_block(vec![ret(cint(0))], &[])], 0);
    let regs = make_regs(4, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);

    // r0 -> r1 -> r2 is a chain: r2 must be written first.
    let a0 = reg_interval(&mut ls, 0);
    let a1 = reg_interval(&mut ls, 1);
    let b1 = reg_interval(&mut ls, 1);
    let b2 = reg_interval(&mut ls, 2);
    let mut resolver = MoveResolver::new(4);
    resolver.set_insert_position(InsertTarget::Detached, -1);
    resolver.add_mapping(&ls, a0, a1);
    resolver.add_mapping(&ls, b1, b2);
    resolver.resolve_and_append_moves(&mut ls).unwrap();
    let ops = resolver.take_detached();
    let emitted = moves(&ops);
    assert_eq!(
      emitted,
      vec![
        (ls.intervals.operand(b1), ls.intervals.operand(b2)),
        (ls.intervals.operand(a0), ls.intervals.operand(a1)),
      ]
    );

    // r0 <-> r3 is a cycle: one side goes through the stack.
    let c0 = reg_interval(&mut ls, 0);
    let c3 = reg_interval(&mut ls, 3);
    let d3 = reg_interval(&mut ls, 3);
    let d0 = reg_interval(&mut ls, 0);
    resolver.set_insert_position(InsertTarget::Detached, -1);
    resolver.add_mapping(&ls, c0, c3);
    resolver.add_mapping(&ls, d3, d0);
    resolver.resolve_and_append_moves(&mut ls).unwrap();
    let ops = resolver.take_detached();
    assert_eq!(ops.len(), 3);
    assert_eq!(ls.max_spills, 1);
    let spill = IntId(ls.intervals.len() - 1);
    assert_eq!(
      ls.intervals.get(spill).location,
      IntervalLocation::Stack(StackSlot(0))
    );
    assert_eq!(ls.intervals.get(spill).ranges[0].from, 1);
    // The last move reads from the temporary.
    match ops[2].kind {
      LirOpKind::Move { src, .. } => {
        assert_eq!(src, ls.intervals.operand(spill))
      }
      _ => panic!("expected a move"),
    }
    assert_eq!(ls.num_inserted_moves, 5);
  }

  #[test]
  fn traced_cycle_is_broken_the_same_way() {
    let mut lir = make_lir(vec![make_block(vec![ret(cint(0))], &[])], 0);
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    ls.trace_moves = true;

    let c0 = reg_interval(&mut ls, 0);
    let c1 = reg_interval(&mut ls, 1);
    let d1 = reg_interval(&mut ls, 1);
    let d0 = reg_interval(&mut ls, 0);
    let mut resolver = MoveResolver::new(2);
    resolver.set_insert_position(InsertTarget::Detached, -1);
    resolver.add_mapping(&ls, c0, c1);
    resolver.add_mapping(&ls, d1, d0);
    resolver.resolve_and_append_moves(&mut ls).unwrap();
    assert_eq!(resolver.take_detached().len(), 3);
    assert_eq!(ls.max_spills, 1);
    assert_eq!(ls.num_inserted_moves, 3);
  }

  #[test]
  fn constants_never_block() {
    let mut lir = make_lir(vec![make_block(vec![ret(cint(0))], &[])], 0);
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    let a = reg_interval(&mut ls, 0);
    let b = reg_interval(&mut ls, 1);
    let mut resolver = MoveResolver::new(2);
    resolver.set_insert_position(InsertTarget::Block(BlockIx::new(0)), 0);
    resolver.add_constant_mapping(cint(5), a);
    resolver.add_mapping(&ls, a, b);
    assert!(resolver.has_mappings());
    resolver.resolve_and_append_moves(&mut ls).unwrap();

    // Both moves are inserted after the label, r0 is read before it is
    // overwritten by the constant.
    let block = &ls.lir.blocks[BlockIx::new(0)];
    assert_eq!(block.ops.len(), 4);
    assert_eq!(
      moves(&block.ops),
      vec![
        (ls.intervals.operand(a), ls.intervals.operand(b)),
        (cint(5), ls.intervals.operand(a)),
      ]
    );
  }

  #[test]
  fn blocked_move_without_register_source_bails_out() {
    let mut lir = make_lir(vec![make_block(vec![ret(cint(0))], &[])], 0);
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    let a = reg_interval(&mut ls, 0);
    let mut resolver = MoveResolver::new(2);
    resolver.set_insert_position(InsertTarget::Detached, -1);
    // r0 stays blocked by a reader that is not part of this set, so the
    // constant can never be written and no source can be spilled.
    resolver.register_blocked[0] = 1;
    resolver.add_constant_mapping(cint(3), a);
    match resolver.resolve_and_append_moves(&mut ls) {
      Err(RegAllocError::Bailout(msg)) => {
        assert_eq!(msg, "LinearScan: no spill candidate in move resolver")
      }
      other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(ls.num_inserted_moves, 0);
  }
}
