/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implementation of the linear scan allocator algorithm.
//!
//! This follows the design of the HotSpot client compiler's allocator: live
//! intervals are built from global liveness, split and spilled by an interval
//! walker, and the splits are then resolved on control-flow edges and exception
//! edges before the LIR is rewritten with physical locations.
//!
//! The state shared by all phases is `LinearScan`; each phase lives in its own
//! module as an `impl LinearScan` block.

use log::{debug, info, log_enabled, Level};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::env;

use crate::bitset::{BitMap2D, BitSet};
use crate::data_structures::*;
use crate::interface::{FrameMap, Options, RegAllocError, RegAllocResult};
use crate::interval::{IntId, IntervalLocation, Intervals, SpillState};
use crate::lir::{Lir, ScopeDebugInfo};
use crate::walker::Walker;

/// Spill slot indices above this are rejected.
const MAX_SPILL_SLOT: u32 = 2000;

pub(crate) struct LinearScan<'a> {
  pub(crate) lir: &'a mut Lir,
  pub(crate) regs: &'a RegisterFile,
  pub(crate) frame_map: &'a mut dyn FrameMap,

  pub(crate) num_regs: usize,
  pub(crate) num_virtual_regs: usize,
  pub(crate) intervals: Intervals,

  /// Block of each op, indexed by `op_id >> 1`.
  pub(crate) op_block: Vec<BlockIx>,
  pub(crate) max_op_id: i32,
  pub(crate) has_call: BitSet,
  pub(crate) has_info: BitSet,
  /// Operand number x loop index: the operand is used inside the loop.
  pub(crate) interval_in_loop: BitMap2D,
  pub(crate) has_fpu_registers: bool,

  pub(crate) max_spills: u32,
  pub(crate) unused_spill_slot: Option<u32>,

  /// All intervals ordered by start position.
  pub(crate) sorted_intervals: Vec<IntId>,
  /// Intervals with an index at or above this were created during allocation.
  pub(crate) first_derived: usize,
  pub(crate) num_inserted_moves: usize,
  /// Control-flow edges whose moves have been inserted.
  pub(crate) resolved_edges: HashSet<(BlockIx, BlockIx)>,
  /// Traces the ordering of parallel moves; set by the `MOVES` variable.
  pub(crate) trace_moves: bool,

  /// Debug info computed per op id and scope.
  pub(crate) scope_debug_info: HashMap<(i32, u32), ScopeDebugInfo>,
}

/// Reports a bailout.
pub(crate) fn bailout(msg: &str) -> RegAllocError {
  info!("bailout: {}", msg);
  RegAllocError::bailout(msg)
}

impl<'a> LinearScan<'a> {
  pub(crate) fn new(
    lir: &'a mut Lir, regs: &'a RegisterFile, frame_map: &'a mut dyn FrameMap,
  ) -> Self {
    let num_regs = regs.num_regs();
    let num_virtual_regs = lir.num_virtual_regs as usize;
    let num_loops = lir.num_loops as usize;
    Self {
      lir,
      regs,
      frame_map,
      num_regs,
      num_virtual_regs,
      intervals: Intervals::new(num_regs, num_regs + num_virtual_regs),
      op_block: Vec::new(),
      max_op_id: -1,
      has_call: BitSet::default(),
      has_info: BitSet::default(),
      interval_in_loop: BitMap2D::new(num_regs + num_virtual_regs, num_loops),
      has_fpu_registers: false,
      max_spills: 0,
      unused_spill_slot: None,
      sorted_intervals: Vec::new(),
      first_derived: 0,
      num_inserted_moves: 0,
      resolved_edges: HashSet::default(),
      trace_moves: env::var_os("MOVES").is_some(),
      scope_debug_info: HashMap::default(),
    }
  }

  //===========================================================================
  // Op and operand helpers.

  pub(crate) fn block_of_op_with_id(&self, op_id: i32) -> BlockIx {
    debug_assert!(op_id >= 0 && op_id <= self.max_op_id + 1, "invalid op id");
    self.op_block[(op_id >> 1) as usize]
  }

  /// Whether `op_id` is the first id of a block, or past the last op.
  pub(crate) fn is_block_begin(&self, op_id: i32) -> bool {
    op_id > self.max_op_id
      || self.lir.blocks[self.block_of_op_with_id(op_id)].first_op_id == op_id
  }

  pub(crate) fn has_call(&self, op_id: i32) -> bool {
    debug_assert!(op_id % 2 == 0, "must be even");
    self.has_call.contains((op_id >> 1) as usize)
  }

  pub(crate) fn has_info(&self, op_id: i32) -> bool {
    debug_assert!(op_id % 2 == 0, "must be even");
    self.has_info.contains((op_id >> 1) as usize)
  }

  /// Operand number of a register operand: physical registers map to their
  /// index, virtual registers follow them. A pair maps to its low half.
  pub(crate) fn reg_num(&self, opr: &Operand) -> Option<usize> {
    match *opr {
      Operand::Virtual { vreg, .. } => Some(self.num_regs + vreg.get_index()),
      Operand::Register { reg, .. } => Some(reg.get_index()),
      Operand::RegisterPair { lo, .. } => Some(lo.get_index()),
      _ => None,
    }
  }

  pub(crate) fn must_start_in_memory(&self, opr: &Operand) -> bool {
    match opr.vreg() {
      Some(vreg) => self.lir.must_start_in_memory.contains(&vreg),
      None => false,
    }
  }

  //===========================================================================
  // Spill slots.

  /// Returns the next unused spill slot for a value of `kind`. Double-word
  /// values are aligned to an even spill index; the hole left behind is
  /// reused by the next single-word request.
  pub(crate) fn allocate_spill_slot(
    &mut self, kind: ValueKind,
  ) -> Result<StackSlot, RegAllocError> {
    let index = if self.regs.num_spill_slots(kind) == 2 {
      if self.max_spills & 1 == 1 {
        debug_assert!(self.unused_spill_slot.is_none(), "wasting a spill slot");
        self.unused_spill_slot = Some(self.max_spills);
        self.max_spills += 1;
      }
      let index = self.max_spills;
      self.max_spills += 2;
      index
    } else if let Some(index) = self.unused_spill_slot.take() {
      index
    } else {
      let index = self.max_spills;
      self.max_spills += 1;
      index
    };

    let slot = self.frame_map.argument_slots() + index;
    if slot > MAX_SPILL_SLOT {
      return Err(bailout("too many stack slots used"));
    }
    Ok(StackSlot(slot))
  }

  /// Moves `id` to the canonical spill slot of its split parent, allocating
  /// the slot on first use.
  pub(crate) fn assign_spill_slot(
    &mut self, id: IntId,
  ) -> Result<(), RegAllocError> {
    let slot = match self.intervals.canonical_spill_slot(id) {
      Some(slot) => slot,
      None => {
        let kind = self.intervals.get(id).kind;
        let slot = self.allocate_spill_slot(kind)?;
        self.intervals.set_canonical_spill_slot(id, slot);
        slot
      }
    };
    debug!("assign {:?} to spill slot {:?}", id, slot);
    self.intervals.get_mut(id).location = IntervalLocation::Stack(slot);
    Ok(())
  }

  /// Called by the walker when a part of `id` is spilled at `spill_pos`.
  pub(crate) fn change_spill_state(&mut self, id: IntId, spill_pos: i32) {
    match self.intervals.spill_state(id) {
      SpillState::OneDefinitionFound => {
        let def_pos = self.intervals.spill_definition_pos(id);
        let def_depth =
          self.lir.blocks[self.block_of_op_with_id(def_pos)].loop_depth;
        let spill_depth =
          self.lir.blocks[self.block_of_op_with_id(spill_pos)].loop_depth;
        if def_depth < spill_depth {
          // The store at the definition is executed less often than the
          // store at the spill position.
          self.intervals.set_spill_state(id, SpillState::StoreAtDefinition);
        } else {
          // The first spill move is inserted; a second one would make the
          // store at the definition worthwhile.
          self.intervals.set_spill_state(id, SpillState::OneMoveInserted);
        }
      }
      SpillState::OneMoveInserted => {
        self.intervals.set_spill_state(id, SpillState::StoreAtDefinition);
      }
      _ => {}
    }
  }

  #[inline(never)]
  fn propagate_spill_slots(&mut self) -> Result<(), RegAllocError> {
    if !self.frame_map.finalize_frame(self.max_spills) {
      return Err(bailout("frame too large"));
    }
    Ok(())
  }

  //===========================================================================
  // Interval ordering.

  #[inline(never)]
  pub(crate) fn sort_intervals_before_allocation(&mut self) {
    let intervals = &self.intervals;
    let mut sorted: Vec<IntId> =
      intervals.ids().filter(|&id| !intervals.get(id).is_empty()).collect();
    sorted.sort_by_key(|&id| intervals.get(id).from());
    self.sorted_intervals = sorted;
    self.first_derived = self.intervals.len();
  }

  /// Merges the intervals created during allocation into the sorted list.
  /// On equal start positions the older interval comes first.
  #[inline(never)]
  fn sort_intervals_after_allocation(&mut self) {
    let intervals = &self.intervals;
    let mut new_list: Vec<IntId> = (self.first_derived..intervals.len())
      .map(IntId)
      .filter(|&id| !intervals.get(id).is_empty())
      .collect();
    if new_list.is_empty() {
      return;
    }
    new_list.sort_by_key(|&id| intervals.get(id).from());

    let old_list = std::mem::take(&mut self.sorted_intervals);
    let mut combined = Vec::with_capacity(old_list.len() + new_list.len());
    let (mut old_ix, mut new_ix) = (0, 0);
    while old_ix < old_list.len() || new_ix < new_list.len() {
      let take_old = new_ix >= new_list.len()
        || (old_ix < old_list.len()
          && intervals.get(old_list[old_ix]).from()
            <= intervals.get(new_list[new_ix]).from());
      if take_old {
        combined.push(old_list[old_ix]);
        old_ix += 1;
      } else {
        combined.push(new_list[new_ix]);
        new_ix += 1;
      }
    }
    self.sorted_intervals = combined;
  }

  //===========================================================================
  // Register allocation proper.

  /// Partitions the sorted intervals of one register class into fixed and
  /// virtual unhandled lists, both ordered by start position.
  fn create_unhandled_lists(&self, rc: RegClass) -> (Vec<IntId>, Vec<IntId>) {
    let mut fixed = Vec::new();
    let mut any = Vec::new();
    for &id in &self.sorted_intervals {
      let interval = self.intervals.get(id);
      if self.intervals.is_fixed(id) {
        if self.regs.class_of(RealReg(interval.reg_num as u8)) == rc {
          fixed.push(id);
        }
      } else if interval.kind.reg_class() == rc {
        any.push(id);
      }
    }
    (fixed, any)
  }

  #[inline(never)]
  pub(crate) fn allocate_registers(&mut self) -> Result<(), RegAllocError> {
    info!("allocate_registers");
    let mut classes = vec![RegClass::Cpu];
    if self.has_fpu_registers {
      classes.push(RegClass::Fpu);
    }
    for rc in classes {
      let (fixed, any) = self.create_unhandled_lists(rc);
      debug!(
        "{:?}: {} fixed and {} virtual intervals",
        rc,
        fixed.len(),
        any.len()
      );
      let mut walker = Walker::new(self, rc, fixed, any);
      walker.walk()?;
      walker.finish_allocation()?;
    }
    Ok(())
  }

  fn dump_intervals(&self, label: &str) {
    if !log_enabled!(Level::Debug) {
      return;
    }
    debug!("intervals {}:", label);
    for &id in &self.sorted_intervals {
      debug!("  {}", self.intervals.display(id));
    }
  }

  fn result(&self) -> RegAllocResult {
    let intervals = &self.intervals;
    RegAllocResult {
      num_spill_slots: self.max_spills,
      num_intervals: intervals.len(),
      num_split_children: intervals
        .ids()
        .filter(|&id| intervals.is_split_child(id))
        .count(),
      num_inserted_moves: self.num_inserted_moves,
    }
  }
}

/// Runs all phases of the allocator on `lir`.
#[inline(never)]
pub(crate) fn run(
  lir: &mut Lir, regs: &RegisterFile, frame_map: &mut dyn FrameMap,
  options: Options,
) -> Result<RegAllocResult, RegAllocError> {
  info!(
    "linear_scan: '{}' with {} blocks and {} virtual registers",
    lir.name,
    lir.blocks.len(),
    lir.num_virtual_regs
  );

  let mut ls = LinearScan::new(lir, regs, frame_map);
  ls.validate()?;

  ls.number_instructions();
  ls.compute_local_live_sets();
  ls.compute_global_live_sets()?;
  ls.build_intervals();
  ls.sort_intervals_before_allocation();
  ls.dump_intervals("before allocation");

  ls.allocate_registers()?;
  ls.resolve_data_flow()?;
  ls.resolve_exception_handlers()?;
  ls.propagate_spill_slots()?;
  ls.sort_intervals_after_allocation();
  ls.dump_intervals("after allocation");

  if options.run_verifier {
    ls.verify()?;
  }

  ls.eliminate_spill_moves();

  if options.run_checker {
    ls.check()?;
  }

  ls.assign_reg_num()?;

  let result = ls.result();
  info!(
    "linear_scan: done, {} intervals, {} split children, {} moves, \
     {} spill slots",
    result.num_intervals,
    result.num_split_children,
    result.num_inserted_moves,
    result.num_spill_slots
  );
  Ok(result)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::lir::*;
  use crate::test_util::*;

  fn regs(is_64bit: bool) -> RegisterFile {
    let regs = (0..4)
      .map(|i| RegInfo {
        name: format!("r{}", i),
        class: RegClass::Cpu,
        caller_saved: true,
      })
      .collect();
    RegisterFile::new(regs, TargetConfig { is_64bit, double_needs_pair: false })
  }

  #[test]
  fn spill_slots_align_double_words() {
    let regs = regs(false);
    let mut lir = Lir::new("slots");
    let mut frame_map = SimpleFrameMap::new(3, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);

    let mut slot = |kind| ls.allocate_spill_slot(kind).unwrap();
    assert_eq!(slot(ValueKind::Int), StackSlot(3));
    // Index 1 is skipped to align the double word, and reused afterwards.
    assert_eq!(slot(ValueKind::Double), StackSlot(5));
    assert_eq!(slot(ValueKind::Object), StackSlot(4));
    assert_eq!(slot(ValueKind::Int), StackSlot(7));
    assert_eq!(slot(ValueKind::Long), StackSlot(9));
    assert_eq!(ls.max_spills, 8);
    assert_eq!(ls.unused_spill_slot, Some(5));
  }

  #[test]
  fn too_many_spill_slots_bail_out() {
    let regs = regs(true);
    let mut lir = Lir::new("slots");
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    ls.max_spills = MAX_SPILL_SLOT;
    assert!(ls.allocate_spill_slot(ValueKind::Int).is_ok());
    match ls.allocate_spill_slot(ValueKind::Int) {
      Err(RegAllocError::Bailout(msg)) => {
        assert_eq!(msg, "too many stack slots used")
      }
      other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
  }

  fn checked() -> Options {
    Options { run_verifier: true, run_checker: true }
  }

  fn count_inserted_moves(lir: &Lir) -> usize {
    lir
      .blocks
      .iter()
      .flat_map(|b| b.ops.iter())
      .filter(|op| op.id == INSERTED_OP_ID && op.as_move().is_some())
      .count()
  }

  /// b0 defines v0; b1 needs the only register for v1 before reading v0;
  /// b2 reads v0.
  fn one_register_split() -> Lir {
    make_lir(
      vec![
        make_block(
          vec![
            mov(cint(7), v(0)),
            cmp(v(0), cint(0)),
            branch(Condition::Equal, 2),
          ],
          &[1, 2],
        ),
        make_block(
          vec![mov(cint(5), v(1)), print(v(1)), print(v(0)), jump(3)],
          &[3],
        ),
        make_block(vec![print(v(0)), jump(3)], &[3]),
        make_block(vec![ret(cint(0))], &[]),
      ],
      2,
    )
  }

  #[test]
  fn one_register_forces_split_and_reload() {
    let mut lir = one_register_split();
    let regs = make_regs(1, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let result = run(&mut lir, &regs, &mut frame_map, checked()).unwrap();
    // v0 lives on the stack across b1's entry and is back in r0 for the
    // print; v1 never splits.
    assert_eq!(result.num_split_children, 2);
    assert_eq!(result.num_spill_slots, 1);
    assert_eq!(result.num_inserted_moves, 2);
    assert_eq!(count_inserted_moves(&lir), 2);

    // The rewritten LIR only names the one register and the spill slot.
    for block in lir.blocks.iter() {
      for op in &block.ops {
        op.for_each_operand(|opr, _| assert!(!opr.is_virtual(), "{:?}", op));
      }
    }

    let is_store = |op: &LirOp| match op.as_move() {
      Some((Operand::Register { .. }, Operand::Stack { .. })) => true,
      _ => false,
    };
    let is_reload = |op: &LirOp| match op.as_move() {
      Some((Operand::Stack { .. }, Operand::Register { .. })) => true,
      _ => false,
    };

    // The store sits on the edge into b1, right after its label; the
    // reload sits right before print(v0).
    let b1 = &lir.blocks[BlockIx::new(1)];
    assert_eq!(b1.ops.len(), 7);
    assert_eq!(b1.ops.iter().filter(|&op| is_store(op)).count(), 1);
    assert_eq!(b1.ops.iter().filter(|&op| is_reload(op)).count(), 1);
    assert!(is_store(&b1.ops[1]) && b1.ops[1].id == INSERTED_OP_ID);
    let reload = b1.ops.iter().position(|op| is_reload(op)).unwrap();
    assert_eq!(b1.ops[reload].id, INSERTED_OP_ID);
    assert_eq!(b1.ops[reload + 1].id, 14);

    // Only b1 gets moves; b2 reads v0 straight from r0.
    for bix in [0, 2, 3].iter() {
      let block = &lir.blocks[BlockIx::new(*bix)];
      assert!(block.ops.iter().all(|op| op.id != INSERTED_OP_ID));
    }
  }

  #[test]
  fn frame_limit_bails_out() {
    let mut lir = one_register_split();
    let regs = make_regs(1, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0).with_max_frame_size(0);
    match run(&mut lir, &regs, &mut frame_map, checked()) {
      Err(RegAllocError::Bailout(msg)) => assert_eq!(msg, "frame too large"),
      other => panic!("unexpected result {:?}", other),
    }
  }

  #[test]
  fn loop_carried_value_survives_calls() {
    // b0: v0 = 0; v1 = 10; jump b1
    // b1: cmp v0, 100; branch b3
    // b2: v0 = v0 + v1; call; jump b1
    // b3: return v0
    let call = LirOp::new(LirOpKind::Call {
      target: CallTarget::Sum,
      args: vec![],
      result: Operand::Illegal,
    });
    let mut lir = make_lir(
      vec![
        make_block(
          vec![mov(cint(0), v(0)), mov(cint(10), v(1)), jump(1)],
          &[1],
        ),
        make_block(
          vec![cmp(v(0), cint(100)), branch(Condition::GreaterEqual, 3)],
          &[2, 3],
        ),
        make_block(vec![add(v(0), v(1), v(0)), call, jump(1)], &[1]),
        make_block(vec![ret(v(0))], &[]),
      ],
      2,
    );
    for b in 1..3 {
      lir.blocks[BlockIx::new(b)].loop_index = Some(0);
      lir.blocks[BlockIx::new(b)].loop_depth = 1;
    }
    lir.blocks[BlockIx::new(2)].flags.loop_end = true;
    lir.num_loops = 1;
    let regs = make_regs(3, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let result = run(&mut lir, &regs, &mut frame_map, checked()).unwrap();
    // Every register is caller-saved, so both values live in the frame
    // across the call.
    assert!(result.num_spill_slots >= 2);
  }
}
