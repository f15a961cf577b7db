/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Construction of live intervals from the global live sets.
//!
//! Blocks and ops are visited in reverse order. A value live at the end of a
//! block gets a range covering the whole block; its range is then shortened
//! to start at its definition when one is found. Uses of virtual registers
//! record how strongly they need a register, which later drives splitting.

use log::{info, trace, warn};
use smallvec::SmallVec;

use crate::data_structures::*;
use crate::interval::{IntId, IntervalLocation, SpillState, UseKind};
use crate::linear_scan::LinearScan;
use crate::lir::{ArithOp, LirOp, LirOpKind, OperandMode};

impl<'a> LinearScan<'a> {
  /// Operand number of the high half of a register pair.
  pub(crate) fn reg_num_hi(&self, opr: &Operand) -> Option<usize> {
    match *opr {
      Operand::RegisterPair { hi, .. } => Some(hi.get_index()),
      _ => None,
    }
  }

  fn reg_nums(&self, opr: &Operand) -> SmallVec<[usize; 2]> {
    self.reg_num(opr).into_iter().chain(self.reg_num_hi(opr)).collect()
  }

  fn interval_or_create(&mut self, reg_num: usize, kind: ValueKind) -> IntId {
    let id = match self.intervals.interval_for(reg_num) {
      Some(id) => id,
      None => self.intervals.create(reg_num, kind),
    };
    if kind != ValueKind::Illegal {
      self.intervals.get_mut(id).kind = kind;
    }
    id
  }

  //===========================================================================
  // Definitions, uses and temps.

  fn add_def(&mut self, opr: &Operand, def_pos: i32, use_kind: UseKind) {
    for reg_num in self.reg_nums(opr) {
      self.add_def_num(reg_num, def_pos, use_kind, opr.kind());
    }
  }

  fn add_def_num(
    &mut self, reg_num: usize, def_pos: i32, use_kind: UseKind, kind: ValueKind,
  ) {
    let is_virtual = reg_num >= self.num_regs;
    let id = self.interval_or_create(reg_num, kind);
    let interval = self.intervals.get_mut(id);
    match interval.ranges.first_mut() {
      Some(first) if first.from <= def_pos => {
        // The range was created by a use and started at the block begin.
        first.from = def_pos;
      }
      _ => {
        interval.add_range(def_pos, def_pos + 1);
        if is_virtual {
          warn!(
            "def of v{} at {} occurs without use",
            reg_num - self.num_regs,
            def_pos
          );
        }
      }
    }
    interval.add_use_pos(def_pos, use_kind, is_virtual);

    if is_virtual {
      self.change_spill_definition_pos(id, def_pos);
      if use_kind == UseKind::NoUse
        && self.intervals.spill_state(id) <= SpillState::StartInMemory
      {
        // Method arguments and values defined in memory.
        self.intervals.set_spill_state(id, SpillState::StartInMemory);
      }
    }
  }

  fn add_use(&mut self, opr: &Operand, from: i32, to: i32, use_kind: UseKind) {
    for reg_num in self.reg_nums(opr) {
      self.add_use_num(reg_num, from, to, use_kind, opr.kind());
    }
  }

  fn add_use_num(
    &mut self, reg_num: usize, from: i32, to: i32, use_kind: UseKind,
    kind: ValueKind,
  ) {
    let is_virtual = reg_num >= self.num_regs;
    let id = self.interval_or_create(reg_num, kind);
    let interval = self.intervals.get_mut(id);
    interval.add_range(from, to);
    interval.add_use_pos(to, use_kind, is_virtual);
  }

  fn add_temp(&mut self, opr: &Operand, temp_pos: i32, use_kind: UseKind) {
    for reg_num in self.reg_nums(opr) {
      self.add_temp_num(reg_num, temp_pos, use_kind, opr.kind());
    }
  }

  fn add_temp_num(
    &mut self, reg_num: usize, temp_pos: i32, use_kind: UseKind,
    kind: ValueKind,
  ) {
    let is_virtual = reg_num >= self.num_regs;
    let id = self.interval_or_create(reg_num, kind);
    let interval = self.intervals.get_mut(id);
    interval.add_range(temp_pos, temp_pos + 1);
    interval.add_use_pos(temp_pos, use_kind, is_virtual);
  }

  /// Tracks the definitions of a split parent, which are seen in reverse.
  fn change_spill_definition_pos(&mut self, id: IntId, def_pos: i32) {
    debug_assert!(self.intervals.is_split_parent(id));
    match self.intervals.spill_state(id) {
      SpillState::NoDefinitionFound => {
        self.intervals.set_spill_definition_pos(id, def_pos);
        self.intervals.set_spill_state(id, SpillState::OneDefinitionFound);
      }
      SpillState::OneDefinitionFound | SpillState::StartInMemory => {
        let spill_def_pos = self.intervals.spill_definition_pos(id);
        debug_assert!(
          def_pos <= spill_def_pos,
          "definitions must be seen in reverse"
        );
        if def_pos < spill_def_pos - 2 {
          // A second definition: the value cannot be stored once.
          self.intervals.set_spill_state(id, SpillState::NoOptimization);
        } else {
          debug_assert!(
            self.block_of_op_with_id(def_pos)
              == self.block_of_op_with_id(spill_def_pos),
            "consecutive definitions must be in one block"
          );
        }
      }
      _ => {}
    }
  }

  //===========================================================================
  // Use kinds.

  fn use_kind_of_output(
    &self, bix: BlockIx, op: &LirOp, opr: &Operand,
  ) -> UseKind {
    if let Some((src, dst)) = op.as_move() {
      if self.must_start_in_memory(&dst) {
        // The interval gets a stack slot first.
        return UseKind::NoUse;
      } else if src.is_stack() {
        // Method argument.
        return UseKind::NoUse;
      } else if src.is_register()
        && dst.is_register()
        && self.lir.blocks[bix].flags.osr_entry
      {
        // The input of an OSR-entry move gets the register instead.
        return UseKind::ShouldHaveRegister;
      }
    }
    if self.must_start_in_memory(opr) {
      return UseKind::NoUse;
    }
    UseKind::MustHaveRegister
  }

  fn use_kind_of_input(
    &self, bix: BlockIx, op: &LirOp, opr: &Operand,
  ) -> UseKind {
    match op.kind {
      LirOpKind::Move { src, dst } => {
        if self.must_start_in_memory(&dst) {
          // Avoids a move from stack to stack.
          return UseKind::MustHaveRegister;
        } else if src.is_register() && dst.is_register() {
          if self.lir.blocks[bix].flags.osr_entry {
            return UseKind::MustHaveRegister;
          }
          return UseKind::ShouldHaveRegister;
        }
      }
      LirOpKind::Op2 { op: code, left, right, .. }
        if *opr == right && right != left =>
      {
        let kind = right.kind();
        if kind.is_float() {
          match code {
            ArithOp::Cmp
            | ArithOp::Add
            | ArithOp::Sub
            | ArithOp::Mul
            | ArithOp::Div => {
              return UseKind::ShouldHaveRegister;
            }
            _ => {}
          }
        } else if kind != ValueKind::Long {
          if code == ArithOp::Cmp
            || code == ArithOp::Add
            || code == ArithOp::Sub
            || code.is_logic()
          {
            return UseKind::ShouldHaveRegister;
          }
        }
      }
      LirOpKind::Cmove { .. } => return UseKind::ShouldHaveRegister,
      _ => {}
    }
    UseKind::MustHaveRegister
  }

  //===========================================================================
  // Special ops.

  /// A move from an incoming stack slot gives the destination that slot as
  /// its canonical spill slot.
  fn handle_method_arguments(&mut self, op: &LirOp) {
    if let Some((Operand::Stack { slot, .. }, dst)) = op.as_move() {
      let reg_num = self.reg_num(&dst);
      let id = match reg_num.and_then(|n| self.intervals.interval_for(n)) {
        Some(id) if !self.intervals.is_fixed(id) => id,
        _ => return,
      };
      if self.intervals.canonical_spill_slot(id).is_none() {
        trace!("method argument {:?} lives in {:?}", id, slot);
        self.intervals.set_canonical_spill_slot(id, slot);
        self.intervals.get_mut(id).location = IntervalLocation::Stack(slot);
      }
    }
  }

  /// On 32-bit targets, the address registers of a long load must survive
  /// the write of the low half.
  fn handle_doubleword_loads(&mut self, op: &LirOp) {
    if self.regs.target.is_64bit {
      return;
    }
    if let LirOpKind::Load { addr, dst, .. } = op.kind {
      if dst.kind() == ValueKind::Long {
        for opr in [addr.base, addr.index].iter() {
          if opr.is_register() {
            self.add_temp(opr, op.id, UseKind::NoUse);
          }
        }
      }
    }
  }

  fn add_register_hints(&mut self, op: &LirOp) {
    let (from, to) = match op.kind {
      LirOpKind::Move { src, dst } | LirOpKind::Convert { src, dst, .. } => {
        (src, dst)
      }
      LirOpKind::Cmove { left, result, .. } => (left, result),
      _ => return,
    };
    if !from.is_register() || !to.is_register() {
      return;
    }
    let lookup = |opr: &Operand| {
      self.reg_num(opr).and_then(|n| self.intervals.interval_for(n))
    };
    if let (Some(from_id), Some(to_id)) = (lookup(&from), lookup(&to)) {
      trace!("op {}: hint from {:?} to {:?}", op.id, from_id, to_id);
      self.intervals.get_mut(to_id).register_hint = Some(from_id);
    }
  }

  //===========================================================================
  // The driver.

  #[inline(never)]
  pub(crate) fn build_intervals(&mut self) {
    info!("build_intervals");
    let caller_saved: Vec<usize> =
      self.regs.caller_saved().map(|reg| reg.get_index()).collect();

    for i in (0..self.lir.blocks.len()).rev() {
      let bix = BlockIx::new(i);
      let (block_from, block_to) = {
        let block = &self.lir.blocks[bix];
        (block.first_op_id, block.last_op_id)
      };

      // Values live at the end of the block.
      let live_out: Vec<usize> = self.lir.blocks[bix].live_out.iter().collect();
      let loop_end_index = {
        let block = &self.lir.blocks[bix];
        if block.flags.loop_end {
          block.loop_index.map(|l| l as usize)
        } else {
          None
        }
      };
      for vreg in live_out {
        let reg_num = self.num_regs + vreg;
        self.add_use_num(
          reg_num,
          block_from,
          block_to + 2,
          UseKind::NoUse,
          ValueKind::Illegal,
        );
        if let Some(loop_index) = loop_end_index {
          if self.interval_in_loop.at(reg_num, loop_index) {
            if let Some(id) = self.intervals.interval_for(reg_num) {
              self.intervals.get_mut(id).add_use_pos(
                block_to + 1,
                UseKind::LoopEndMarker,
                true,
              );
            }
          }
        }
      }

      let ops = std::mem::take(&mut self.lir.blocks[bix].ops);
      for op in ops.iter().skip(1).rev() {
        self.build_op(bix, block_from, op, &caller_saved);
      }
      self.lir.blocks[bix].ops = ops;
    }

    // Fixed intervals start at 0, so the walker never sees them unhandled.
    for reg_num in 0..self.num_regs {
      if let Some(id) = self.intervals.interval_for(reg_num) {
        self.intervals.get_mut(id).add_range(0, 1);
      }
    }
  }

  fn build_op(
    &mut self, bix: BlockIx, block_from: i32, op: &LirOp,
    caller_saved: &[usize],
  ) {
    let op_id = op.id;

    if op.is_call() {
      for &reg_num in caller_saved {
        self.add_temp_num(reg_num, op_id, UseKind::NoUse, ValueKind::Illegal);
      }
    }

    let mut inputs: SmallVec<[Operand; 4]> = SmallVec::new();
    let mut temps: SmallVec<[Operand; 2]> = SmallVec::new();
    let mut outputs: SmallVec<[Operand; 2]> = SmallVec::new();
    op.for_each_operand(|opr, mode| {
      if opr.is_register() {
        match mode {
          OperandMode::Input => inputs.push(*opr),
          OperandMode::Temp => temps.push(*opr),
          OperandMode::Output => outputs.push(*opr),
        }
      }
    });

    for opr in &outputs {
      let use_kind = self.use_kind_of_output(bix, op, opr);
      self.add_def(opr, op_id, use_kind);
    }
    for opr in &temps {
      self.add_temp(opr, op_id, UseKind::MustHaveRegister);
    }
    for opr in &inputs {
      let use_kind = self.use_kind_of_input(bix, op, opr);
      self.add_use(opr, block_from, op_id, use_kind);
    }

    // Values needed by the debug info, including the phi inputs of the
    // handlers, stay alive across the op.
    let mut state_values: SmallVec<[Operand; 8]> = SmallVec::new();
    op.for_each_state_value(|opr| {
      if opr.is_virtual() {
        state_values.push(*opr);
      }
    });
    for info in &op.infos {
      for handler in &info.exception_handlers {
        for phi in &self.lir.blocks[handler.handler_block].phis {
          let input = phi.inputs[handler.phi_operand];
          if input.is_virtual() {
            state_values.push(input);
          }
        }
      }
    }
    for opr in &state_values {
      self.add_use(opr, block_from, op_id + 1, UseKind::NoUse);
    }

    self.handle_method_arguments(op);
    self.handle_doubleword_loads(op);
    self.add_register_hints(op);
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::interval::Range;
  use crate::lir::Condition;
  use crate::test_util::*;

  fn build(
    lir: &mut crate::lir::Lir, regs: &RegisterFile,
    f: impl FnOnce(&LinearScan),
  ) {
    let mut frame_map = SimpleFrameMap::new(1, 0);
    let mut ls = LinearScan::new(lir, regs, &mut frame_map);
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    f(&ls);
  }

  #[test]
  fn ranges_and_use_kinds() {
    // 2: v0 = 1
    // 4: v1 = v0 + v0
    // 6: v2 = v1 + v0
    // 8: return v2
    let mut lir = make_lir(
      vec![make_block(
        vec![
          mov(cint(1), v(0)),
          add(v(0), v(0), v(1)),
          add(v(1), v(0), v(2)),
          ret(v(2)),
        ],
        &[],
      )],
      3,
    );
    let regs = make_regs(2, 0);
    build(&mut lir, &regs, |ls| {
      let int = |n| {
        ls.intervals.get(ls.intervals.interval_for(ls.num_regs + n).unwrap())
      };
      assert_eq!(int(0).ranges, vec![Range { from: 2, to: 6 }]);
      assert_eq!(int(1).ranges, vec![Range { from: 4, to: 6 }]);
      assert_eq!(int(2).ranges, vec![Range { from: 6, to: 8 }]);
      // The second operand of an integer add only should have a register.
      assert_eq!(int(0).uses.last(), Some(&(2, UseKind::MustHaveRegister)));
      assert_eq!(int(0).uses.first(), Some(&(6, UseKind::ShouldHaveRegister)));
      assert_eq!(int(0).spill_state, SpillState::OneDefinitionFound);
      assert_eq!(int(0).spill_definition_pos, 2);
    });
  }

  #[test]
  fn loop_end_marker_and_hints() {
    // b0: v0 = 0
    // b1 (loop): v1 = v0; v0 = v1 + 1; cmp; branch b1
    // b2: return v0
    let mut blocks = vec![
      make_block(vec![mov(cint(0), v(0))], &[1]),
      make_block(
        vec![
          mov(v(0), v(1)),
          add(v(1), cint(1), v(0)),
          cmp(v(0), cint(10)),
          branch(Condition::Less, 1),
        ],
        &[1, 2],
      ),
      make_block(vec![ret(v(0))], &[]),
    ];
    blocks[1].loop_index = Some(0);
    blocks[1].loop_depth = 1;
    blocks[1].flags.loop_end = true;
    let mut lir = make_lir(blocks, 2);
    lir.num_loops = 1;
    let regs = make_regs(2, 0);
    build(&mut lir, &regs, |ls| {
      let v0 = ls.intervals.interval_for(ls.num_regs).unwrap();
      let v1 = ls.intervals.interval_for(ls.num_regs + 1).unwrap();
      let b1_last = ls.lir.blocks[BlockIx::new(1)].last_op_id;
      assert_eq!(
        ls.intervals.get(v0).next_usage_exact(UseKind::LoopEndMarker, 0),
        b1_last + 1
      );
      assert_eq!(ls.intervals.get(v1).register_hint, Some(v0));
      // Two definitions of v0.
      assert_eq!(ls.intervals.get(v0).spill_state, SpillState::NoOptimization);
    });
  }

  #[test]
  fn method_argument_starts_in_memory() {
    let mut lir = make_lir(
      vec![make_block(
        vec![mov(Operand::stack(0, ValueKind::Int), v(0)), ret(v(0))],
        &[],
      )],
      1,
    );
    let regs = make_regs(2, 0);
    build(&mut lir, &regs, |ls| {
      let id = ls.intervals.interval_for(ls.num_regs).unwrap();
      let int = ls.intervals.get(id);
      assert_eq!(int.spill_state, SpillState::StartInMemory);
      assert_eq!(int.canonical_spill_slot, Some(StackSlot(0)));
      assert_eq!(int.location, IntervalLocation::Stack(StackSlot(0)));
      assert!(ls.intervals.always_in_memory(id));
    });
  }
}
