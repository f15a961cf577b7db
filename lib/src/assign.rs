/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Rewrites the LIR with the allocation result.
//!
//! Every virtual operand is replaced by the location of the split child that
//! is valid at its op. Ops with debug info get an oop map, built by walking
//! the reference intervals alongside the ops, and the debug info of all of
//! their scopes. Moves whose source and destination ended up in the same
//! location are removed.

use log::{debug, info, trace};
use std::collections::BTreeSet;

use crate::data_structures::*;
use crate::interface::RegAllocError;
use crate::interval::{IntId, IntervalLocation, IntervalWalker};
use crate::linear_scan::{bailout, LinearScan};
use crate::lir::*;

/// Set when the debug info of a value is taken at the start of the successor
/// instead of at the branch that ends the block.
#[derive(Clone, Copy)]
struct BlockEndBranch {
  block: BlockIx,
  succ_first_op_id: i32,
}

fn location_kind(kind: ValueKind) -> LocationKind {
  match kind {
    ValueKind::Object => LocationKind::Oop,
    ValueKind::Long => LocationKind::Long,
    ValueKind::Double => LocationKind::Double,
    _ => LocationKind::Normal,
  }
}

fn same_location(a: &Operand, b: &Operand) -> bool {
  match (*a, *b) {
    (Operand::Register { reg: r1, .. }, Operand::Register { reg: r2, .. }) => {
      r1 == r2
    }
    (
      Operand::RegisterPair { lo: lo1, hi: hi1, .. },
      Operand::RegisterPair { lo: lo2, hi: hi2, .. },
    ) => lo1 == lo2 && hi1 == hi2,
    (Operand::Stack { slot: s1, .. }, Operand::Stack { slot: s2, .. }) => {
      s1 == s2
    }
    _ => a == b,
  }
}

fn is_useless_move(op: &LirOp) -> bool {
  match op.as_move() {
    Some((src, dst)) => same_location(&src, &dst),
    None => false,
  }
}

impl<'a> LinearScan<'a> {
  //===========================================================================
  // Operands.

  fn operand_for_interval(
    &mut self, id: IntId,
  ) -> Result<Operand, RegAllocError> {
    let interval = self.intervals.get(id);
    if let Some(opr) = interval.cached_operand {
      return Ok(opr);
    }
    let kind = interval.kind;
    let opr = match interval.location {
      IntervalLocation::Reg(reg, None) => Operand::Register { reg, kind },
      IntervalLocation::Reg(lo, Some(hi)) => {
        Operand::RegisterPair { lo, hi, kind }
      }
      IntervalLocation::Stack(slot) => Operand::Stack { slot, kind },
      IntervalLocation::None => {
        debug_assert!(false, "interval {:?} has no location", id);
        return Err(bailout("LinearScan: interval has no location"));
      }
    };
    self.intervals.get_mut(id).cached_operand = Some(opr);
    Ok(opr)
  }

  /// The physical location of a virtual operand at `op_id`. Ops inserted by
  /// the allocator name their interval directly.
  fn color_operand(
    &mut self, opr: &Operand, op_id: i32, mode: OperandMode,
  ) -> Result<Operand, RegAllocError> {
    let reg_num = match self.reg_num(opr) {
      Some(reg_num) if opr.is_virtual() => reg_num,
      _ => return Ok(*opr),
    };
    let mut id = self.interval_at(reg_num)?;
    if op_id != INSERTED_OP_ID {
      id = self.split_child_at(id, op_id, mode)?;
    }
    self.operand_for_interval(id)
  }

  fn color_op(&mut self, op: &mut LirOp) -> Result<(), RegAllocError> {
    let op_id = op.id;
    let mut result = Ok(());
    op.for_each_operand_mut(|opr, mode| {
      if result.is_ok() && opr.is_virtual() {
        match self.color_operand(opr, op_id, mode) {
          Ok(colored) => *opr = colored,
          Err(err) => result = Err(err),
        }
      }
    });
    result
  }

  //===========================================================================
  // Oop maps.

  fn compute_oop_map(
    &self, walker: &IntervalWalker, op: &LirOp, info: &CodeEmitInfo,
  ) -> OopMap {
    let op_id = op.id;
    let mut map = OopMap {
      frame_size: self.frame_map.frame_size(),
      locations: BTreeSet::new(),
    };

    // Intervals ending at a patching op are included: the op may reach a
    // safepoint before it has read its inputs.
    let is_patch = op.is_patch();

    for &id in walker.active() {
      let interval = self.intervals.get(id);
      debug_assert!(
        interval.current_from() <= op_id && op_id <= interval.current_to(),
        "interval should not be active"
      );
      if !is_patch && op_id >= interval.current_to() {
        continue;
      }
      if let Some(loc) = interval.location.to_location() {
        map.set_oop(loc);
      }

      // A value that is always in memory is also valid in its stack slot
      // while it is in a register.
      let canonical = self.intervals.canonical_spill_slot(id);
      if self.intervals.always_in_memory(id)
        && op_id > self.intervals.spill_definition_pos(id)
        && interval.location.spill() != canonical
      {
        if let Some(slot) = canonical {
          map.set_oop(Location::Stack(slot));
        }
      }
    }

    for index in 0..info.state.total_locks() {
      map.set_oop(Location::Stack(self.frame_map.monitor_object_slot(index)));
    }
    map
  }

  //===========================================================================
  // Debug info.

  fn append_scope_value(
    &mut self, op_id: i32, end_branch: Option<BlockEndBranch>, value: &Operand,
    values: &mut Vec<ScopeValue>,
  ) -> Result<usize, RegAllocError> {
    match *value {
      Operand::Illegal => {
        values.push(ScopeValue::Illegal);
        Ok(1)
      }
      Operand::Constant(Constant::Long(n)) => {
        values.push(ScopeValue::Constant(Constant::Int((n >> 32) as i32)));
        values.push(ScopeValue::Constant(Constant::Int(n as i32)));
        Ok(2)
      }
      Operand::Constant(Constant::Double(bits)) => {
        values.push(ScopeValue::Constant(Constant::Int((bits >> 32) as i32)));
        values.push(ScopeValue::Constant(Constant::Int(bits as i32)));
        Ok(2)
      }
      Operand::Constant(c) => {
        values.push(ScopeValue::Constant(c));
        Ok(1)
      }
      Operand::Virtual { vreg, kind } => {
        // Moves resolving the outgoing edge are inserted before the final
        // branch, so a value live across it is described at the start of
        // the successor.
        let (op_id, mode) = match end_branch {
          Some(branch)
            if self.lir.blocks[branch.block]
              .live_out
              .contains(vreg.get_index()) =>
          {
            (branch.succ_first_op_id, OperandMode::Output)
          }
          _ => (op_id, OperandMode::Input),
        };
        let colored = self.color_operand(value, op_id, mode)?;
        Ok(Self::append_scope_value_for_operand(&colored, kind, values))
      }
      // Already physical: described as is.
      Operand::Register { .. }
      | Operand::RegisterPair { .. }
      | Operand::Stack { .. } => {
        Ok(Self::append_scope_value_for_operand(value, value.kind(), values))
      }
    }
  }

  fn append_scope_value_for_operand(
    opr: &Operand, kind: ValueKind, values: &mut Vec<ScopeValue>,
  ) -> usize {
    let lk = location_kind(kind);
    let loc = match *opr {
      Operand::Register { reg, .. } => Location::Reg(reg),
      Operand::RegisterPair { lo, hi, .. } => {
        values.push(ScopeValue::Location { loc: Location::Reg(lo), kind: lk });
        values.push(ScopeValue::Location { loc: Location::Reg(hi), kind: lk });
        return 2;
      }
      Operand::Stack { slot, .. } => Location::Stack(slot),
      _ => {
        values.push(ScopeValue::Illegal);
        return 1;
      }
    };
    values.push(ScopeValue::Location { loc, kind: lk });
    if kind.is_double_word() {
      // The whole value is in one location; the second half is a filler.
      values.push(ScopeValue::Constant(Constant::Int(0)));
      2
    } else {
      1
    }
  }

  fn append_scope_values(
    &mut self, op_id: i32, end_branch: Option<BlockEndBranch>, oprs: &[Operand],
  ) -> Result<Vec<ScopeValue>, RegAllocError> {
    let mut values = Vec::with_capacity(oprs.len());
    let mut pos = 0;
    while pos < oprs.len() {
      pos +=
        self.append_scope_value(op_id, end_branch, &oprs[pos], &mut values)?;
    }
    Ok(values)
  }

  fn compute_scope_debug_info(
    &mut self, op_id: i32, end_branch: Option<BlockEndBranch>,
    state: &FrameState, lock_offset: usize,
  ) -> Result<ScopeDebugInfo, RegAllocError> {
    let locals = self.append_scope_values(op_id, end_branch, &state.locals)?;
    let expressions =
      self.append_scope_values(op_id, end_branch, &state.stack)?;
    let monitors = (0..state.locks.len())
      .map(|i| MonitorValue {
        owner: ScopeValue::Location {
          loc: Location::Stack(
            self.frame_map.monitor_object_slot(lock_offset + i),
          ),
          kind: LocationKind::Oop,
        },
        basic_lock: self.frame_map.monitor_lock_slot(lock_offset + i),
      })
      .collect();
    Ok(ScopeDebugInfo {
      scope: state.scope,
      bci: state.bci,
      locals,
      expressions,
      monitors,
    })
  }

  /// Appends the debug info of `state` and its callers, outermost first.
  fn compute_debug_info_for_scope(
    &mut self, op_id: i32, end_branch: Option<BlockEndBranch>,
    state: &FrameState, scopes: &mut Vec<ScopeDebugInfo>,
  ) -> Result<(), RegAllocError> {
    let lock_offset = match &state.caller {
      Some(caller) => {
        self.compute_debug_info_for_scope(op_id, end_branch, caller, scopes)?;
        caller.total_locks()
      }
      None => 0,
    };

    let key = (op_id, state.scope);
    if let Some(cached) = self.scope_debug_info.get(&key) {
      let cached = cached.clone();
      if cfg!(debug_assertions) {
        let fresh = self.compute_scope_debug_info(
          op_id,
          end_branch,
          state,
          lock_offset,
        )?;
        debug_assert_eq!(cached, fresh, "debug info of op {} changed", op_id);
      }
      scopes.push(cached);
      return Ok(());
    }
    let scope_info =
      self.compute_scope_debug_info(op_id, end_branch, state, lock_offset)?;
    self.scope_debug_info.insert(key, scope_info.clone());
    scopes.push(scope_info);
    Ok(())
  }

  fn block_end_branch(&self, op: &LirOp) -> Option<BlockEndBranch> {
    if !op.is_branch() || op.id == INSERTED_OP_ID {
      return None;
    }
    let block = self.block_of_op_with_id(op.id);
    let b = &self.lir.blocks[block];
    if b.succs.len() == 1 && op.id == b.last_op_id {
      Some(BlockEndBranch {
        block,
        succ_first_op_id: self.lir.blocks[b.succs[0]].first_op_id,
      })
    } else {
      None
    }
  }

  //===========================================================================
  // The driver.

  fn assign_reg_num_ops(
    &mut self, ops: &mut Vec<LirOp>, mut walker: Option<&mut IntervalWalker>,
  ) -> Result<(), RegAllocError> {
    for op in ops.iter_mut() {
      self.color_op(op)?;
      if !op.has_info() {
        continue;
      }

      for info in op.infos.iter_mut() {
        for handler in info.exception_handlers.iter_mut() {
          if let Some(code) = handler.entry_code.as_mut() {
            self.assign_reg_num_ops(code, None)?;
          }
        }
      }

      let walker = match walker.as_deref_mut() {
        Some(walker) => walker,
        None => {
          debug_assert!(false, "op with info outside of a block");
          continue;
        }
      };
      // Intervals starting at the op are its outputs, which are not live
      // during the op.
      walker.walk_before(&mut self.intervals, op.id);
      let end_branch = self.block_end_branch(op);
      for i in 0..op.infos.len() {
        let oop_map = self.compute_oop_map(walker, op, &op.infos[i]);
        let mut scopes = Vec::new();
        self.compute_debug_info_for_scope(
          op.id,
          end_branch,
          &op.infos[i].state,
          &mut scopes,
        )?;
        trace!("op {}: oop map {:?}", op.id, oop_map.locations);
        let info = &mut op.infos[i];
        info.oop_map = Some(oop_map);
        info.debug_info = Some(DebugInfo { scopes });
      }
    }

    let len = ops.len();
    ops.retain(|op| !is_useless_move(op));
    if ops.len() != len {
      debug!("removed {} useless moves", len - ops.len());
    }
    Ok(())
  }

  #[inline(never)]
  pub(crate) fn assign_reg_num(&mut self) -> Result<(), RegAllocError> {
    info!("assign_reg_num");
    let intervals = &self.intervals;
    let oop_intervals: Vec<IntId> = self
      .sorted_intervals
      .iter()
      .copied()
      .filter(|&id| {
        !intervals.is_fixed(id)
          && !intervals.is_resolver_temp(id)
          && intervals.get(id).kind == ValueKind::Object
      })
      .collect();
    let mut walker = IntervalWalker::new(oop_intervals);

    for bix in BlockIx::new(0).dotdot(BlockIx::new(self.lir.blocks.len())) {
      let mut ops = std::mem::take(&mut self.lir.blocks[bix].ops);
      let result = self.assign_reg_num_ops(&mut ops, Some(&mut walker));
      self.lir.blocks[bix].ops = ops;
      result?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::{allocate_registers, FrameMap, Options, SimpleFrameMap};
  use crate::test_util::*;

  fn new_object(index: u32) -> LirOp {
    mov(Operand::Constant(Constant::Object(Some(1))), obj(index))
  }

  fn run(lir: &mut Lir, num_regs: usize, frame_map: &mut SimpleFrameMap) {
    let regs = make_regs(num_regs, 0);
    let options = Options { run_verifier: true, run_checker: false };
    allocate_registers(lir, &regs, frame_map, options).unwrap();
  }

  fn info_of(lir: &Lir, block: u32, index: usize) -> &CodeEmitInfo {
    &lir.blocks[BlockIx::new(block)].ops[index].infos[0]
  }

  #[test]
  fn oop_map_names_live_reference() {
    // 2: v0 = new; 4: safepoint; 6: print v0
    let mut lir = make_lir(
      vec![make_block(
        vec![new_object(0), safepoint(vec![]), print(obj(0)), ret(cint(0))],
        &[],
      )],
      1,
    );
    let mut frame_map = SimpleFrameMap::new(0, 0);
    run(&mut lir, 2, &mut frame_map);

    let ops = &lir.blocks[BlockIx::new(0)].ops;
    let reg = match ops[1].as_move() {
      Some((_, Operand::Register { reg, .. })) => reg,
      other => panic!("unexpected op {:?}", other),
    };
    let oop_map = info_of(&lir, 0, 2).oop_map.as_ref().unwrap();
    assert_eq!(
      oop_map.locations.iter().collect::<Vec<_>>(),
      vec![&Location::Reg(reg)]
    );
    assert_eq!(oop_map.frame_size, 0);
  }

  #[test]
  fn dead_reference_is_not_in_oop_map() {
    // 2: v0 = new; 4: print v0; 6: safepoint
    let mut lir = make_lir(
      vec![make_block(
        vec![new_object(0), print(obj(0)), safepoint(vec![]), ret(cint(0))],
        &[],
      )],
      1,
    );
    let mut frame_map = SimpleFrameMap::new(0, 0);
    run(&mut lir, 2, &mut frame_map);
    let oop_map = info_of(&lir, 0, 3).oop_map.as_ref().unwrap();
    assert!(oop_map.locations.is_empty());
  }

  #[test]
  fn debug_info_describes_locals_and_monitors() {
    let mut state = FrameState::new(3, 17);
    state.locals = vec![
      v(0),
      cint(3),
      Operand::Constant(Constant::Long(5)),
      Operand::Illegal,
      obj(1),
    ];
    state.locks = vec![obj(1)];
    let sp = LirOp::with_info(LirOpKind::Safepoint, CodeEmitInfo::new(state));
    let mut lir = make_lir(
      vec![make_block(
        vec![
          mov(cint(1), v(0)),
          new_object(1),
          sp,
          print(v(0)),
          print(obj(1)),
          ret(cint(0)),
        ],
        &[],
      )],
      2,
    );
    let mut frame_map = SimpleFrameMap::new(0, 1);
    run(&mut lir, 4, &mut frame_map);

    let ops = &lir.blocks[BlockIx::new(0)].ops;
    let loc_of = |index: usize| match ops[index].as_move() {
      Some((_, Operand::Register { reg, .. })) => Location::Reg(reg),
      other => panic!("unexpected op {:?}", other),
    };
    let (l0, l1) = (loc_of(1), loc_of(2));
    let info = info_of(&lir, 0, 3);
    let debug_info = info.debug_info.as_ref().unwrap();
    assert_eq!(debug_info.scopes.len(), 1);
    let scope = &debug_info.scopes[0];
    assert_eq!((scope.scope, scope.bci), (3, 17));
    assert_eq!(
      scope.locals,
      vec![
        ScopeValue::Location { loc: l0, kind: LocationKind::Normal },
        ScopeValue::Constant(Constant::Int(3)),
        ScopeValue::Constant(Constant::Int(0)),
        ScopeValue::Constant(Constant::Int(5)),
        ScopeValue::Location { loc: l1, kind: LocationKind::Oop },
      ]
    );
    let object_slot = frame_map.monitor_object_slot(0);
    assert_eq!(
      scope.monitors,
      vec![MonitorValue {
        owner: ScopeValue::Location {
          loc: Location::Stack(object_slot),
          kind: LocationKind::Oop,
        },
        basic_lock: frame_map.monitor_lock_slot(0),
      }]
    );
    let oop_map = info.oop_map.as_ref().unwrap();
    assert!(oop_map.locations.contains(&l1));
    assert!(oop_map.locations.contains(&Location::Stack(object_slot)));
    assert!(!oop_map.locations.contains(&l0));
  }

  #[test]
  fn self_moves_are_removed() {
    // v1 = v0 gets the hint of v0 and ends up in the same register.
    let mut lir = make_lir(
      vec![make_block(
        vec![mov(cint(1), v(0)), mov(v(0), v(1)), print(v(1)), ret(cint(0))],
        &[],
      )],
      2,
    );
    let mut frame_map = SimpleFrameMap::new(0, 0);
    run(&mut lir, 2, &mut frame_map);
    let ops = &lir.blocks[BlockIx::new(0)].ops;
    assert_eq!(ops.len(), 4);
    assert!(ops.iter().all(|op| {
      let mut virtual_seen = false;
      op.for_each_operand(|opr, _| virtual_seen |= opr.is_virtual());
      !virtual_seen
    }));
  }
}
