/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Resolution of the data flow across control-flow and exception edges.
//!
//! The walker only inserts moves where it splits an interval inside a block.
//! When the split children of a value live at both ends of an edge ended up
//! in different locations, a move has to be inserted on the edge. For
//! exception edges the moves are collected into the entry code of the
//! handler, which the code emitter runs between the throwing op and the
//! handler block.

use log::{debug, info};

use crate::bitset::BitSet;
use crate::data_structures::*;
use crate::interface::RegAllocError;
use crate::interval::IntId;
use crate::linear_scan::{bailout, LinearScan};
use crate::lir::{LirOp, OperandMode, INSERTED_OP_ID};
use crate::move_resolver::{InsertTarget, MoveResolver};

impl<'a> LinearScan<'a> {
  pub(crate) fn split_child_at(
    &self, id: IntId, op_id: i32, mode: OperandMode,
  ) -> Result<IntId, RegAllocError> {
    self
      .intervals
      .split_child_at_op_id(id, op_id, mode)
      .ok_or_else(|| bailout("LinearScan: interval is null"))
  }

  /// The interval of an operand number that must exist at this point.
  pub(crate) fn interval_at(
    &self, reg_num: usize,
  ) -> Result<IntId, RegAllocError> {
    self
      .intervals
      .interval_for(reg_num)
      .ok_or_else(|| bailout("LinearScan: interval is null"))
  }

  //===========================================================================
  // Control-flow edges.

  fn resolve_collect_mappings(
    &self, from: BlockIx, to: BlockIx, resolver: &mut MoveResolver,
  ) -> Result<(), RegAllocError> {
    let from_block = &self.lir.blocks[from];
    let to_block = &self.lir.blocks[to];
    for vreg in to_block.live_in.iter() {
      let parent = self.interval_at(self.num_regs + vreg)?;
      let from_interval = self.split_child_at(
        parent,
        from_block.last_op_id + 1,
        OperandMode::Output,
      )?;
      let to_interval =
        self.split_child_at(parent, to_block.first_op_id, OperandMode::Output)?;
      if from_interval != to_interval
        && self.intervals.get(from_interval).location
          != self.intervals.get(to_interval).location
      {
        resolver.add_mapping(self, from_interval, to_interval);
      }
    }
    Ok(())
  }

  /// Moves go to the end of `from` when it has a single successor, and to
  /// the start of `to` otherwise.
  fn resolve_find_insert_pos(
    &self, from: BlockIx, to: BlockIx, resolver: &mut MoveResolver,
  ) {
    let from_block = &self.lir.blocks[from];
    if from_block.succs.len() <= 1 {
      let len = from_block.ops.len() as i32;
      match from_block.ops.last() {
        Some(op) if op.is_branch() => {
          resolver.set_insert_position(InsertTarget::Block(from), len - 2)
        }
        _ => resolver.set_insert_position(InsertTarget::Block(from), len - 1),
      }
    } else {
      debug_assert!(
        self.lir.blocks[to].preds.len() == 1,
        "critical edge not split"
      );
      resolver.set_insert_position(InsertTarget::Block(to), 0);
    }
  }

  /// A block holding only its label and an unconditional jump, with one
  /// predecessor and one successor.
  fn is_empty_jump_block(&self, bix: BlockIx) -> bool {
    let block = &self.lir.blocks[bix];
    block.preds.len() == 1
      && block.succs.len() == 1
      && block.exception_handlers.is_empty()
      && block.ops.len() == 2
      && block.ops[1].is_branch()
  }

  #[inline(never)]
  pub(crate) fn resolve_data_flow(&mut self) -> Result<(), RegAllocError> {
    info!("resolve_data_flow");
    let num_blocks = self.lir.blocks.len() as usize;
    let mut resolver = MoveResolver::new(self.num_regs);
    let mut block_completed = BitSet::new(num_blocks);

    for bix in BlockIx::new(0).dotdot(BlockIx::new(num_blocks as u32)) {
      if !self.is_empty_jump_block(bix) {
        continue;
      }
      let pred = self.lir.blocks[bix].preds[0];
      let succ = self.lir.blocks[bix].succs[0];
      // Two consecutive empty blocks are not merged.
      if block_completed.contains(pred.get_usize())
        || block_completed.contains(succ.get_usize())
      {
        continue;
      }
      block_completed.insert(bix.get_usize());
      // Moves placed in `bix` make it non-empty on a later run, so the two
      // edges through it count as resolved too.
      self.resolved_edges.insert((pred, bix));
      self.resolved_edges.insert((bix, succ));
      if !self.resolved_edges.insert((pred, succ)) {
        continue;
      }
      debug!(
        "resolving {:?} -> {:?} through empty block {:?}",
        pred, succ, bix
      );

      self.resolve_collect_mappings(pred, succ, &mut resolver)?;
      if resolver.has_mappings() {
        resolver.set_insert_position(InsertTarget::Block(bix), 0);
        resolver.resolve_and_append_moves(self)?;
      }
    }

    for from in BlockIx::new(0).dotdot(BlockIx::new(num_blocks as u32)) {
      if block_completed.contains(from.get_usize()) {
        continue;
      }
      let mut already_resolved = block_completed.clone();
      let succs = self.lir.blocks[from].succs.clone();
      for to in succs {
        // Several edges to the same block are resolved once.
        if already_resolved.contains(to.get_usize()) {
          continue;
        }
        already_resolved.insert(to.get_usize());
        if !self.resolved_edges.insert((from, to)) {
          continue;
        }

        self.resolve_collect_mappings(from, to, &mut resolver)?;
        if resolver.has_mappings() {
          self.resolve_find_insert_pos(from, to, &mut resolver);
          resolver.resolve_and_append_moves(self)?;
        }
      }
    }
    Ok(())
  }

  //===========================================================================
  // Exception edges.

  /// Handles a value that is in a register at the start of an exception
  /// handler but always has a valid copy in its stack slot: the handler is
  /// entered with the stack slot, and a reload is inserted after the label.
  fn resolve_exception_entry_value(
    &mut self, bix: BlockIx, reg_num: usize, resolver: &mut MoveResolver,
  ) -> Result<(), RegAllocError> {
    let parent = match self.intervals.interval_for(reg_num) {
      Some(parent) => parent,
      None => return Ok(()),
    };
    let from_op_id = self.lir.blocks[bix].first_op_id;
    let to_op_id = from_op_id + 1;
    let mut interval =
      self.split_child_at(parent, from_op_id, OperandMode::Output)?;
    let location = self.intervals.get(interval).location;
    if location.reg().is_none() || !self.intervals.always_in_memory(interval) {
      return Ok(());
    }

    if self.intervals.get(interval).from() != from_op_id {
      // The part before the handler keeps its register.
      interval = self.intervals.split(interval, from_op_id);
      self.intervals.get_mut(interval).location = location;
    }
    let mut spilled = interval;
    if self.intervals.get(interval).to() != to_op_id {
      spilled = self.intervals.split_from_start(interval, to_op_id);
      resolver.add_mapping(self, spilled, interval);
    }
    self.assign_spill_slot(spilled)
  }

  fn resolve_exception_entry(
    &mut self, bix: BlockIx, resolver: &mut MoveResolver,
  ) -> Result<(), RegAllocError> {
    debug!("resolving exception entry {:?}", bix);
    let mut reg_nums: Vec<usize> = self.lir.blocks[bix]
      .live_in
      .iter()
      .map(|vreg| self.num_regs + vreg)
      .collect();
    for phi in &self.lir.blocks[bix].phis {
      reg_nums.extend(self.reg_num(&phi.operand));
    }
    for reg_num in reg_nums {
      self.resolve_exception_entry_value(bix, reg_num, resolver)?;
    }

    if resolver.has_mappings() {
      resolver.set_insert_position(InsertTarget::Block(bix), 0);
      resolver.resolve_and_append_moves(self)?;
    }
    Ok(())
  }

  /// Maps a value of the handler block from its location at the throwing op.
  /// `phi_input` is the value flowing into a phi of the handler.
  fn resolve_exception_edge_value(
    &self, handler_block: BlockIx, throwing_op_id: i32, reg_num: usize,
    phi_input: Option<Operand>, resolver: &mut MoveResolver,
  ) -> Result<(), RegAllocError> {
    let parent = match self.intervals.interval_for(reg_num) {
      Some(parent) => parent,
      None => return Ok(()),
    };
    let to_op_id = self.lir.blocks[handler_block].first_op_id;
    let to_interval =
      self.split_child_at(parent, to_op_id, OperandMode::Output)?;

    match phi_input {
      Some(input) => {
        // One input may flow into several phis.
        resolver.set_multiple_reads_allowed();
        if input.is_constant() {
          resolver.add_constant_mapping(input, to_interval);
        } else if let Some(input_reg_num) = self.reg_num(&input) {
          let input_parent = self.interval_at(input_reg_num)?;
          let from_interval = self.split_child_at(
            input_parent,
            throwing_op_id,
            OperandMode::Input,
          )?;
          resolver.add_mapping(self, from_interval, to_interval);
        }
      }
      None => {
        let from_interval =
          self.split_child_at(parent, throwing_op_id, OperandMode::Input)?;
        if from_interval == to_interval {
          return Ok(());
        }
        // A value that is always in memory is already in the handler's
        // stack slot.
        let in_canonical_slot = self.intervals.always_in_memory(from_interval)
          && self.intervals.get(to_interval).location.spill()
            == self.intervals.canonical_spill_slot(from_interval);
        if !in_canonical_slot {
          resolver.add_mapping(self, from_interval, to_interval);
        }
      }
    }
    Ok(())
  }

  /// Computes the entry code of one handler of the op with `throwing_op_id`.
  fn resolve_exception_edge(
    &mut self, handler_block: BlockIx, phi_operand: usize, throwing_op_id: i32,
    resolver: &mut MoveResolver,
  ) -> Result<Option<Vec<LirOp>>, RegAllocError> {
    let live_in: Vec<usize> =
      self.lir.blocks[handler_block].live_in.iter().collect();
    for vreg in live_in {
      self.resolve_exception_edge_value(
        handler_block,
        throwing_op_id,
        self.num_regs + vreg,
        None,
        resolver,
      )?;
    }
    let phis: Vec<(Operand, Operand)> = self.lir.blocks[handler_block]
      .phis
      .iter()
      .map(|phi| (phi.operand, phi.inputs[phi_operand]))
      .collect();
    for (operand, input) in phis {
      if let Some(reg_num) = self.reg_num(&operand) {
        self.resolve_exception_edge_value(
          handler_block,
          throwing_op_id,
          reg_num,
          Some(input),
          resolver,
        )?;
      }
    }

    if !resolver.has_mappings() {
      return Ok(None);
    }
    resolver.set_insert_position(InsertTarget::Detached, -1);
    resolver.resolve_and_append_moves(self)?;
    let mut entry_code = resolver.take_detached();
    entry_code.push(LirOp::jump(handler_block));
    Ok(Some(entry_code))
  }

  #[inline(never)]
  pub(crate) fn resolve_exception_handlers(
    &mut self,
  ) -> Result<(), RegAllocError> {
    info!("resolve_exception_handlers");
    let num_blocks = self.lir.blocks.len();
    let mut resolver = MoveResolver::new(self.num_regs);

    for bix in BlockIx::new(0).dotdot(BlockIx::new(num_blocks)) {
      if self.lir.blocks[bix].flags.exception_entry {
        self.resolve_exception_entry(bix, &mut resolver)?;
      }
    }

    for bix in BlockIx::new(0).dotdot(BlockIx::new(num_blocks)) {
      for op_index in 1..self.lir.blocks[bix].ops.len() {
        let op = &self.lir.blocks[bix].ops[op_index];
        let op_id = op.id;
        if op_id == INSERTED_OP_ID || !self.has_info(op_id) {
          continue;
        }
        let handlers: Vec<(usize, usize, BlockIx, usize)> = op
          .infos
          .iter()
          .enumerate()
          .flat_map(|(info_index, info)| {
            info.exception_handlers.iter().enumerate().map(move |(h, handler)| {
              (info_index, h, handler.handler_block, handler.phi_operand)
            })
          })
          .collect();

        for (info_index, h, handler_block, phi_operand) in handlers {
          let entry_code = self.resolve_exception_edge(
            handler_block,
            phi_operand,
            op_id,
            &mut resolver,
          )?;
          let info = &mut self.lir.blocks[bix].ops[op_index].infos[info_index];
          let handler = &mut info.exception_handlers[h];
          debug_assert!(
            handler.lir_op_id.is_none(),
            "handler already resolved"
          );
          handler.lir_op_id = Some(op_id);
          handler.entry_code = entry_code;
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::interval::{IntervalLocation, SpillState};
  use crate::lir::*;
  use crate::test_util::*;

  fn allocate(ls: &mut LinearScan) {
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    ls.sort_intervals_before_allocation();
    ls.allocate_registers().unwrap();
  }

  #[test]
  fn unsplit_values_need_no_moves() {
    // b0: v0 = 1; cmp; branch b2
    // b1: print v0; jump b3
    // b2: print v0; jump b3
    // b3: return
    let mut lir = make_lir(
      vec![
        make_block(
          vec![
            mov(cint(1), v(0)),
            cmp(v(0), cint(0)),
            branch(Condition::Equal, 2),
          ],
          &[1, 2],
        ),
        make_block(vec![print(v(0)), jump(3)], &[3]),
        make_block(vec![print(v(0)), jump(3)], &[3]),
        make_block(vec![ret(cint(0))], &[]),
      ],
      1,
    );
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    allocate(&mut ls);
    ls.resolve_data_flow().unwrap();
    assert_eq!(ls.num_inserted_moves, 0);
    // Nothing changes when resolving again.
    ls.resolve_data_flow().unwrap();
    assert_eq!(ls.num_inserted_moves, 0);
    assert_eq!(ls.lir.blocks[BlockIx::new(1)].ops.len(), 3);
  }

  #[test]
  fn resolving_twice_inserts_nothing_new() {
    // b0: v0 = 7; cmp; branch b2
    // b1: v1 = 5; print v1; print v0; jump b3
    // b2: print v0; jump b3
    // b3: return
    let mut lir = make_lir(
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
    );
    let regs = make_regs(1, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    allocate(&mut ls);
    let walker_moves = ls.num_inserted_moves;

    // v0 is spilled on entry to b1: the edge b0 -> b1 gets a store.
    ls.resolve_data_flow().unwrap();
    assert_eq!(ls.num_inserted_moves, walker_moves + 1);
    let after_first: Vec<usize> =
      ls.lir.blocks.iter().map(|b| b.ops.len()).collect();

    ls.resolve_data_flow().unwrap();
    assert_eq!(ls.num_inserted_moves, walker_moves + 1);
    let after_second: Vec<usize> =
      ls.lir.blocks.iter().map(|b| b.ops.len()).collect();
    assert_eq!(after_second, after_first);
  }

  #[test]
  fn moves_go_before_the_jump_of_a_single_successor() {
    // b0: v0 = 1; jump b1
    // b1: print v0; return
    let mut lir = make_lir(
      vec![
        make_block(vec![mov(cint(1), v(0)), jump(1)], &[1]),
        make_block(vec![print(v(0)), ret(cint(0))], &[]),
      ],
      1,
    );
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    allocate(&mut ls);

    // Move the part of v0 in b1 to the stack by hand.
    let parent = ls.intervals.interval_for(ls.num_regs).unwrap();
    let b1_first = ls.lir.blocks[BlockIx::new(1)].first_op_id;
    let child = ls.intervals.split(parent, b1_first);
    ls.assign_spill_slot(child).unwrap();
    ls.resolve_data_flow().unwrap();

    let b0 = &ls.lir.blocks[BlockIx::new(0)];
    assert_eq!(b0.ops.len(), 4);
    assert_eq!(b0.ops[2].id, INSERTED_OP_ID);
    assert_eq!(
      b0.ops[2].as_move(),
      Some((ls.intervals.operand(parent), ls.intervals.operand(child)))
    );
    assert!(b0.ops[3].is_branch());
  }

  #[test]
  fn exception_edge_gets_entry_code() {
    // b0: v0 = 1; v1 = 2; safepoint that may throw to b1; return v1
    // b1 (handler, phi v2 = [v0]): print v2; return 0
    let mut handler_block = make_block(vec![print(v(2)), ret(cint(0))], &[]);
    handler_block.flags.exception_entry = true;
    handler_block.phis.push(Phi { operand: v(2), inputs: vec![v(0)] });
    let mut throwing = safepoint(vec![]);
    let handler = ExceptionHandler::new(BlockIx::new(1), 0);
    throwing.infos[0].exception_handlers.push(handler);
    let mut entry = make_block(
      vec![mov(cint(1), v(0)), mov(cint(2), v(1)), throwing, ret(v(1))],
      &[],
    );
    entry.exception_handlers.push(BlockIx::new(1));
    let mut lir = make_lir(vec![entry, handler_block], 3);

    let regs = make_regs(3, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    allocate(&mut ls);
    ls.resolve_data_flow().unwrap();
    ls.resolve_exception_handlers().unwrap();

    let v0 = ls.intervals.interval_for(ls.num_regs).unwrap();
    let v2 = ls.intervals.interval_for(ls.num_regs + 2).unwrap();
    let ops = &ls.lir.blocks[BlockIx::new(0)].ops;
    let handler = &ops[3].infos[0].exception_handlers[0];
    assert_eq!(handler.lir_op_id, Some(6));
    let code = handler.entry_code.as_ref().unwrap();
    // The phi input is copied even when both share a register; the copy is
    // dropped when operands are rewritten.
    assert_eq!(code.len(), 2);
    assert_eq!(
      code[0].as_move(),
      Some((ls.intervals.operand(v0), ls.intervals.operand(v2)))
    );
    assert_eq!(code.last().map(|op| op.is_branch()), Some(true));
  }

  #[test]
  fn always_in_memory_value_enters_handler_on_the_stack() {
    // b0: v0 = stack argument; safepoint throwing to b1; print v0; return
    // b1 (handler): print v0; return
    let mut handler_block = make_block(vec![print(v(0)), ret(cint(0))], &[]);
    handler_block.flags.exception_entry = true;
    let mut throwing = safepoint(vec![]);
    let handler = ExceptionHandler::new(BlockIx::new(1), 0);
    throwing.infos[0].exception_handlers.push(handler);
    let mut entry = make_block(
      vec![
        mov(Operand::stack(0, ValueKind::Int), v(0)),
        throwing,
        print(v(0)),
        ret(cint(0)),
      ],
      &[],
    );
    entry.exception_handlers.push(BlockIx::new(1));
    let mut lir = make_lir(vec![entry, handler_block], 1);

    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(1, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    allocate(&mut ls);
    let v0 = ls.intervals.interval_for(ls.num_regs).unwrap();
    assert_eq!(ls.intervals.spill_state(v0), SpillState::StartInMemory);

    ls.resolve_data_flow().unwrap();
    ls.resolve_exception_handlers().unwrap();

    let handler_first = ls.lir.blocks[BlockIx::new(1)].first_op_id;
    let at_entry = ls
      .intervals
      .split_child_at_op_id(v0, handler_first, OperandMode::Output)
      .unwrap();
    assert_eq!(
      ls.intervals.get(at_entry).location,
      IntervalLocation::Stack(StackSlot(0))
    );
    // The handler reloads the value after its label; the throwing op needs
    // no entry code.
    let ops = &ls.lir.blocks[BlockIx::new(0)].ops;
    let handler = &ops[2].infos[0].exception_handlers[0];
    assert_eq!(handler.entry_code, None);
    let handler_ops = &ls.lir.blocks[BlockIx::new(1)].ops;
    assert_eq!(handler_ops.len(), 4);
    assert_eq!(handler_ops[1].id, INSERTED_OP_ID);
    assert_eq!(
      handler_ops[1].as_move().map(|m| m.0),
      Some(ls.intervals.operand(at_entry))
    );
  }
}
