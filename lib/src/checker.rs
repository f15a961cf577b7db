/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies that the moves inserted by the allocator retain the
//! dataflow of the original, vreg-based LIR.
//!
//! The basic idea is that we track symbolic values as they flow through
//! registers and stack slots. Any op of the original LIR (i.e., not added by
//! the allocator) conceptually generates the symbolic value of the operand
//! it defines: `Vn` for virtual register n, `Rn` for physical register n.
//! Split children of a virtual register all carry its value.
//!
//! The dataflow analysis state at each program point is a map of
//! location -> lattice value, where a location is a physical register or a
//! stack slot. The transfer functions are:
//!
//!   - move inserted by the allocator: `L[dst] := L[src]`, or the value of
//!     the destination's register when the source is a constant;
//!
//!   - original op `V_i := op V_j, V_k` with allocated form
//!     `L_i := op L_j, L_k`: `L[L_i] := V_i`;
//!
//!   - call: every caller-saved register becomes `Unknown`.
//!
//! Exception edges apply the handler's entry code to the state at the
//! throwing op. A move of the entry code that feeds a phi of the handler
//! must read the phi's input, and then generates the phi's value.
//!
//! At entry, every physical register holds its own value. At control-flow
//! joins, two different values meet to `Conflicted`. Once the fixpoint is
//! found, every input of an original op, and every value of its debug
//! info, is checked to be present in its location.

use log::{debug, info};
use rustc_hash::FxHashMap as HashMap;
use smallvec::SmallVec;
use std::fmt;

use crate::data_structures::*;
use crate::interface::RegAllocError;
use crate::interval::IntervalLocation;
use crate::linear_scan::LinearScan;
use crate::lir::*;

/// Abstract content of a location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckerValue {
  /// Nothing was written to this location.
  Unknown,
  /// Different values reach this location.
  Conflicted,
  /// The value of the register with this operand number: physical registers
  /// first, then virtual registers.
  Value(usize),
}

impl CheckerValue {
  /// Meet function of the abstract-interpretation value lattice.
  pub fn meet(&self, other: &CheckerValue) -> CheckerValue {
    if self == other {
      *self
    } else {
      CheckerValue::Conflicted
    }
  }
}

impl fmt::Display for CheckerValue {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      CheckerValue::Unknown => write!(f, "unknown"),
      CheckerValue::Conflicted => write!(f, "conflicted"),
      CheckerValue::Value(n) => write!(f, "value of operand {}", n),
    }
  }
}

#[derive(Clone, Debug)]
pub enum CheckerError {
  /// A location does not hold the value an op reads from it.
  MissingValue {
    op_id: i32,
    block: BlockIx,
    operand: Operand,
    location: Location,
    found: CheckerValue,
  },
  /// An operand has no location at the op.
  MissingLocation { op_id: i32, block: BlockIx, operand: Operand },
  /// A move of an exception handler's entry code does not read the input of
  /// the phi it feeds.
  WrongPhiInput { op_id: i32, handler: BlockIx, input: Operand, src: Operand },
}

impl fmt::Display for CheckerError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      CheckerError::MissingValue { op_id, block, operand, location, found } => {
        write!(
          f,
          "op {} in {:?}: {:?} expected in {:?}, found {}",
          op_id, block, operand, location, found
        )
      }
      CheckerError::MissingLocation { op_id, block, operand } => {
        write!(f, "op {} in {:?}: {:?} has no location", op_id, block, operand)
      }
      CheckerError::WrongPhiInput { op_id, handler, input, src } => write!(
        f,
        "handler {:?} of op {}: phi input {:?} is read from {:?}",
        handler, op_id, input, src
      ),
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

/// State that steps through program points as we scan over the op stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct CheckerState {
  values: HashMap<Location, CheckerValue>,
}

impl CheckerState {
  fn get(&self, loc: Location) -> CheckerValue {
    self.values.get(&loc).copied().unwrap_or(CheckerValue::Unknown)
  }

  fn set(&mut self, loc: Location, value: CheckerValue) {
    self.values.insert(loc, value);
  }

  /// Merges `other` into this state at a join point. Returns true if this
  /// state changed.
  fn meet_with(&mut self, other: &CheckerState) -> bool {
    let mut locations: Vec<Location> =
      self.values.keys().chain(other.values.keys()).copied().collect();
    locations.sort();
    locations.dedup();
    let mut changed = false;
    for loc in locations {
      let mine = self.get(loc);
      let merged = mine.meet(&other.get(loc));
      if merged != mine {
        self.set(loc, merged);
        changed = true;
      }
    }
    changed
  }
}

/// Locations of an operand, with the value each must hold. Stack operands
/// of the original LIR carry no tracked value.
type Slots = SmallVec<[(Location, CheckerValue); 2]>;

impl<'a> LinearScan<'a> {
  fn checker_slots(
    &self, opr: &Operand, op_id: i32, mode: OperandMode,
  ) -> Option<Slots> {
    let mut slots = Slots::new();
    match *opr {
      Operand::Illegal | Operand::Constant(_) => {}
      Operand::Register { reg, .. } => {
        slots.push((Location::Reg(reg), CheckerValue::Value(reg.get_index())));
      }
      Operand::RegisterPair { lo, hi, .. } => {
        slots.push((Location::Reg(lo), CheckerValue::Value(lo.get_index())));
        slots.push((Location::Reg(hi), CheckerValue::Value(hi.get_index())));
      }
      Operand::Stack { slot, .. } => {
        slots.push((Location::Stack(slot), CheckerValue::Unknown));
      }
      Operand::Virtual { .. } => {
        let mut id = self.intervals.interval_for(self.reg_num(opr)?)?;
        if op_id != INSERTED_OP_ID {
          id = self.intervals.split_child_at_op_id(id, op_id, mode)?;
        }
        let value = CheckerValue::Value(self.intervals.parent(id).reg_num);
        match self.intervals.get(id).location {
          IntervalLocation::None => return None,
          IntervalLocation::Reg(lo, hi) => {
            slots.push((Location::Reg(lo), value));
            if let Some(hi) = hi {
              slots.push((Location::Reg(hi), value));
            }
          }
          IntervalLocation::Stack(slot) => {
            slots.push((Location::Stack(slot), value))
          }
        }
      }
    }
    Some(slots)
  }

  fn check_read(
    &self, block: BlockIx, op_id: i32, opr: &Operand, state: &CheckerState,
    errors: &mut Vec<CheckerError>,
  ) {
    match self.checker_slots(opr, op_id, OperandMode::Input) {
      None => errors.push(CheckerError::MissingLocation {
        op_id,
        block,
        operand: *opr,
      }),
      Some(slots) => {
        for (location, expected) in slots {
          if expected == CheckerValue::Unknown {
            continue;
          }
          let found = state.get(location);
          if found != expected {
            errors.push(CheckerError::MissingValue {
              op_id,
              block,
              operand: *opr,
              location,
              found,
            });
          }
        }
      }
    }
  }

  /// Copies the source of an inserted move into its destination. Returns
  /// false if an operand has no location.
  fn apply_inserted_move(
    &self, src: &Operand, dst: &Operand, state: &mut CheckerState,
  ) -> bool {
    let dst_slots =
      self.checker_slots(dst, INSERTED_OP_ID, OperandMode::Output);
    let dst_slots = match dst_slots {
      Some(slots) => slots,
      None => return false,
    };
    if src.is_constant() {
      for (loc, value) in dst_slots {
        state.set(loc, value);
      }
      return true;
    }
    let src_slots = self.checker_slots(src, INSERTED_OP_ID, OperandMode::Input);
    let src_slots = match src_slots {
      Some(slots) if !slots.is_empty() => slots,
      _ => return false,
    };
    let values: SmallVec<[CheckerValue; 2]> =
      src_slots.iter().map(|&(loc, _)| state.get(loc)).collect();
    for (i, (loc, _)) in dst_slots.into_iter().enumerate() {
      state.set(loc, values[i.min(values.len() - 1)]);
    }
    true
  }

  /// Applies the entry code of `handler` to the state at the throwing op.
  fn apply_entry_code(
    &self, block: BlockIx, op_id: i32, handler: &ExceptionHandler,
    state: &mut CheckerState, errors: &mut Vec<CheckerError>,
  ) {
    let code = match &handler.entry_code {
      Some(code) => code,
      None => return,
    };
    let phis = &self.lir.blocks[handler.handler_block].phis;
    for op in code {
      let (src, dst) = match op.as_move() {
        Some(mov) => mov,
        None => continue,
      };
      let dst_parent = self
        .reg_num(&dst)
        .and_then(|n| self.intervals.interval_for(n))
        .map(|id| self.intervals.parent(id).reg_num);
      let phi = phis
        .iter()
        .find(|phi| {
          dst_parent.is_some() && self.reg_num(&phi.operand) == dst_parent
        });

      if let Some(phi) = phi {
        let input = phi.inputs[handler.phi_operand];
        let reads_input = if input.is_constant() {
          src == input
        } else {
          let expected = self.reg_num(&input).map(CheckerValue::Value);
          match self.checker_slots(&src, INSERTED_OP_ID, OperandMode::Input) {
            Some(slots) => {
              !slots.is_empty()
                && slots
                  .iter()
                  .all(|&(loc, _)| Some(state.get(loc)) == expected)
            }
            None => false,
          }
        };
        if !reads_input {
          errors.push(CheckerError::WrongPhiInput {
            op_id,
            handler: handler.handler_block,
            input,
            src,
          });
        }
        match self.checker_slots(&dst, INSERTED_OP_ID, OperandMode::Output) {
          Some(slots) => {
            for (loc, value) in slots {
              state.set(loc, value);
            }
          }
          None => errors.push(CheckerError::MissingLocation {
            op_id,
            block,
            operand: dst,
          }),
        }
      } else if !self.apply_inserted_move(&src, &dst, state) {
        errors.push(CheckerError::MissingLocation {
          op_id,
          block,
          operand: dst,
        });
      }
    }
  }

  /// Runs the transfer function over a block. Returns the state at its end
  /// and the states flowing into its exception handlers.
  fn check_block(
    &self, block: BlockIx, mut state: CheckerState, caller_saved: &[RealReg],
    errors: &mut Vec<CheckerError>,
  ) -> (CheckerState, Vec<(BlockIx, CheckerState)>) {
    let mut handler_states = Vec::new();
    let last_op_id = self.lir.blocks[block].last_op_id;

    for op in self.lir.blocks[block].ops.iter().skip(1) {
      if op.id == INSERTED_OP_ID {
        if let Some((src, dst)) = op.as_move() {
          if !self.apply_inserted_move(&src, &dst, &mut state) {
            errors.push(CheckerError::MissingLocation {
              op_id: op.id,
              block,
              operand: dst,
            });
          }
        }
        continue;
      }
      let op_id = op.id;

      op.for_each_operand(|opr, mode| {
        if mode == OperandMode::Input {
          self.check_read(block, op_id, opr, &state, errors);
        }
      });
      // The debug info of a block-ending branch is taken at the successor.
      if !(op.is_branch() && op_id == last_op_id) {
        op.for_each_state_value(|opr| {
          if opr.is_virtual() {
            self.check_read(block, op_id, opr, &state, errors);
          }
        });
      }

      if op.is_call() {
        for &reg in caller_saved {
          state.set(Location::Reg(reg), CheckerValue::Unknown);
        }
      }

      for info in &op.infos {
        for handler in &info.exception_handlers {
          let mut handler_state = state.clone();
          self.apply_entry_code(
            block,
            op_id,
            handler,
            &mut handler_state,
            errors,
          );
          handler_states.push((handler.handler_block, handler_state));
        }
      }

      op.for_each_operand(|opr, mode| {
        if mode == OperandMode::Input {
          return;
        }
        match self.checker_slots(opr, op_id, OperandMode::Output) {
          Some(slots) => {
            for (loc, value) in slots {
              let value = if mode == OperandMode::Temp {
                CheckerValue::Unknown
              } else {
                value
              };
              state.set(loc, value);
            }
          }
          None => errors.push(CheckerError::MissingLocation {
            op_id,
            block,
            operand: *opr,
          }),
        }
      });
    }
    (state, handler_states)
  }

  #[inline(never)]
  pub(crate) fn check(&self) -> Result<(), RegAllocError> {
    info!("check");
    let num_blocks = self.lir.blocks.len() as usize;
    let caller_saved: Vec<RealReg> = self.regs.caller_saved().collect();

    let mut entry = CheckerState::default();
    for reg in 0..self.num_regs {
      entry.set(Location::Reg(RealReg(reg as u8)), CheckerValue::Value(reg));
    }
    let mut in_states: Vec<Option<CheckerState>> = vec![None; num_blocks];
    in_states[0] = Some(entry);

    fn merge(slot: &mut Option<CheckerState>, state: &CheckerState) -> bool {
      match slot {
        Some(existing) => existing.meet_with(state),
        None => {
          *slot = Some(state.clone());
          true
        }
      }
    }

    let mut worklist = vec![BlockIx::new(0)];
    let mut iterations = 0;
    while let Some(block) = worklist.pop() {
      iterations += 1;
      let state = match &in_states[block.get_usize()] {
        Some(state) => state.clone(),
        None => continue,
      };
      let mut scratch = Vec::new();
      let (out, handler_states) =
        self.check_block(block, state, &caller_saved, &mut scratch);
      for &succ in &self.lir.blocks[block].succs {
        if merge(&mut in_states[succ.get_usize()], &out)
          && !worklist.contains(&succ)
        {
          worklist.push(succ);
        }
      }
      for (handler, state) in handler_states {
        if merge(&mut in_states[handler.get_usize()], &state)
          && !worklist.contains(&handler)
        {
          worklist.push(handler);
        }
      }
    }
    debug!("checker fixpoint after {} block visits", iterations);

    let mut errors = Vec::new();
    for (i, state) in in_states.into_iter().enumerate() {
      if let Some(state) = state {
        let bix = BlockIx::new(i as u32);
        self.check_block(bix, state, &caller_saved, &mut errors);
      }
    }
    if errors.is_empty() {
      Ok(())
    } else {
      info!("checker found {} errors", errors.len());
      Err(RegAllocError::RegChecker(CheckerErrors { errors }))
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::test_util::*;

  fn prepare(ls: &mut LinearScan) {
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    ls.sort_intervals_before_allocation();
    ls.allocate_registers().unwrap();
    ls.resolve_data_flow().unwrap();
    ls.resolve_exception_handlers().unwrap();
    ls.eliminate_spill_moves();
  }

  fn pressure() -> Lir {
    // b0: v0 = 1; v1 = 2; v2 = v0 + v1; cmp; branch b2
    // b1: print v0; jump b3
    // b2: print v1; jump b3
    // b3: print v2; return v0
    make_lir(
      vec![
        make_block(
          vec![
            mov(cint(1), v(0)),
            mov(cint(2), v(1)),
            add(v(0), v(1), v(2)),
            cmp(v(2), cint(3)),
            branch(Condition::Equal, 2),
          ],
          &[1, 2],
        ),
        make_block(vec![print(v(0)), jump(3)], &[3]),
        make_block(vec![print(v(1)), jump(3)], &[3]),
        make_block(vec![print(v(2)), ret(v(0))], &[]),
      ],
      3,
    )
  }

  #[test]
  fn meet_is_conflicted_for_different_values() {
    let a = CheckerValue::Value(3);
    assert_eq!(a.meet(&a), a);
    assert_eq!(a.meet(&CheckerValue::Value(4)), CheckerValue::Conflicted);
    assert_eq!(a.meet(&CheckerValue::Unknown), CheckerValue::Conflicted);
  }

  #[test]
  fn spilled_allocation_checks() {
    let mut lir = pressure();
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    prepare(&mut ls);
    assert!(ls.max_spills > 0);
    ls.check().unwrap();
  }

  #[test]
  fn clobbered_value_is_reported() {
    let mut lir = pressure();
    let regs = make_regs(3, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    prepare(&mut ls);
    ls.check().unwrap();

    // Overwrite the register of v0 right after its definition.
    let v0 = ls.intervals.interval_for(ls.num_regs).unwrap();
    let reg = ls.intervals.get(v0).location.reg().unwrap();
    let clobber = mov(cint(9), Operand::reg(reg, ValueKind::Int));
    ls.lir.blocks[BlockIx::new(0)].ops.insert(2, clobber);
    match ls.check() {
      Err(RegAllocError::RegChecker(errors)) => {
        assert!(errors.errors.iter().any(|e| match e {
          CheckerError::MissingValue { operand, .. } => *operand == v(0),
          _ => false,
        }));
      }
      other => panic!("unexpected result {:?}", other),
    }
  }
}
