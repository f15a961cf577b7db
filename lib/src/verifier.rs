/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Consistency checks of the allocated intervals, run before the LIR is
//! rewritten. A failure here is a bug in the allocator, not in its input.

use log::{info, trace};
use smallvec::SmallVec;

use crate::data_structures::*;
use crate::interface::RegAllocError;
use crate::interval::{IntId, IntervalLocation, IntervalWalker};
use crate::linear_scan::LinearScan;
use crate::lir::{Location, OperandMode};

fn verifier_error(msg: String) -> RegAllocError {
  info!("verifier: {}", msg);
  RegAllocError::Verifier(msg)
}

/// The storage units occupied by a location.
fn units(location: IntervalLocation) -> SmallVec<[Location; 2]> {
  let mut units = SmallVec::new();
  match location {
    IntervalLocation::None => {}
    IntervalLocation::Reg(lo, hi) => {
      units.push(Location::Reg(lo));
      units.extend(hi.map(Location::Reg));
    }
    IntervalLocation::Stack(slot) => units.push(Location::Stack(slot)),
  }
  units
}

impl<'a> LinearScan<'a> {
  #[inline(never)]
  pub(crate) fn verify(&mut self) -> Result<(), RegAllocError> {
    info!("verify");
    self.verify_intervals()?;
    self.verify_no_oops_in_fixed_intervals()?;
    self.verify_constants()
  }

  fn verify_intervals(&self) -> Result<(), RegAllocError> {
    let intervals = &self.intervals;
    let ids: Vec<IntId> = intervals.ids().collect();

    for (i, &id) in ids.iter().enumerate() {
      let interval = intervals.get(id);
      if !intervals.is_fixed(id) && interval.kind == ValueKind::Illegal {
        return Err(verifier_error(format!(
          "interval {:?} has no type assigned",
          id
        )));
      }
      match interval.location {
        IntervalLocation::None => {
          return Err(verifier_error(format!(
            "interval {:?} has no register assigned",
            id
          )));
        }
        IntervalLocation::Reg(lo, Some(hi)) if lo == hi => {
          return Err(verifier_error(format!(
            "interval {:?}: low and high register equal",
            id
          )));
        }
        _ => {}
      }

      // The ranges of move resolver temporaries carry no information.
      if intervals.is_resolver_temp(id) {
        continue;
      }
      if interval.ranges.is_empty() {
        return Err(verifier_error(format!("interval {:?} has no range", id)));
      }
      if interval.ranges.iter().any(|r| r.from >= r.to) {
        return Err(verifier_error(format!(
          "interval {:?} has a zero length range",
          id
        )));
      }

      let my_units = units(interval.location);
      for &other_id in &ids[i + 1..] {
        if intervals.is_resolver_temp(other_id) {
          continue;
        }
        let other = intervals.get(other_id);
        let shared =
          units(other.location).iter().any(|u| my_units.contains(u));
        if shared && interval.intersects_at(other).is_some() {
          return Err(verifier_error(format!(
            "intervals {:?} and {:?} overlap and have the same location \
             assigned:\n  {}\n  {}",
            id,
            other_id,
            intervals.display(id),
            intervals.display(other_id)
          )));
        }
      }
    }
    Ok(())
  }

  /// A fixed register must not be live across an op with debug info unless
  /// the op names it, and a fixed register holding a reference must not be
  /// live after the op that uses it.
  fn verify_no_oops_in_fixed_intervals(&mut self) -> Result<(), RegAllocError> {
    let fixed: Vec<IntId> = self
      .sorted_intervals
      .iter()
      .copied()
      .filter(|&id| self.intervals.is_fixed(id))
      .collect();
    let mut walker = IntervalWalker::new(fixed);

    for bix in BlockIx::new(0).dotdot(BlockIx::new(self.lir.blocks.len())) {
      for index in 0..self.lir.blocks[bix].ops.len() {
        let op = &self.lir.blocks[bix].ops[index];
        let op_id = op.id;
        let mut fixed_operands: SmallVec<[(usize, Operand, OperandMode); 4]> =
          SmallVec::new();
        op.for_each_operand(|opr, mode| {
          let (lo, hi) = opr.real_regs();
          for reg in lo.iter().chain(hi.iter()) {
            fixed_operands.push((reg.get_index(), *opr, mode));
          }
        });
        let has_info = op.has_info();
        let is_call = op.is_call();
        let check_live = !op.is_patch();

        if has_info && check_live {
          walker.walk_before(&mut self.intervals, op_id);
          for &id in walker.active() {
            if self.intervals.get(id).current_to() <= op_id + 1 {
              continue;
            }
            let reg_num = self.intervals.get(id).reg_num;
            if !fixed_operands.iter().any(|&(r, _, _)| r == reg_num) {
              return Err(verifier_error(format!(
                "fixed interval {:?} is live across op {} with debug info",
                id, op_id
              )));
            }
          }
        }

        // Oop maps of calls never contain registers.
        if is_call {
          continue;
        }
        for &(reg_num, opr, mode) in &fixed_operands {
          if opr.kind() != ValueKind::Object {
            continue;
          }
          let interval = match self.intervals.interval_for(reg_num) {
            Some(id) => self.intervals.get(id),
            None => {
              return Err(verifier_error(format!(
                "no interval for fixed register {}",
                reg_num
              )))
            }
          };
          trace!("checking fixed operand {:?} of op {}", opr, op_id);
          let live_after = match mode {
            OperandMode::Input => {
              interval.to() >= op_id + 2
                && !interval.has_hole_between(op_id, op_id + 2)
            }
            OperandMode::Output => {
              interval.from() <= op_id - 1
                && !interval.has_hole_between(op_id - 1, op_id)
            }
            OperandMode::Temp => false,
          };
          if live_after {
            return Err(verifier_error(format!(
              "reference in fixed operand {:?} is live across op {}",
              opr, op_id
            )));
          }
        }
      }
    }
    Ok(())
  }

  /// Every value live into a block has an interval.
  fn verify_constants(&self) -> Result<(), RegAllocError> {
    for (i, block) in self.lir.blocks.iter().enumerate() {
      for vreg in block.live_in.iter() {
        if self.intervals.interval_for(self.num_regs + vreg).is_none() {
          return Err(verifier_error(format!(
            "v{} is live into {:?} but has no interval",
            vreg,
            BlockIx::new(i as u32)
          )));
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
  use crate::test_util::*;

  fn allocated(
    lir: &mut crate::lir::Lir, regs: &RegisterFile,
    f: impl FnOnce(&mut LinearScan),
  ) {
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(lir, regs, &mut frame_map);
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    ls.sort_intervals_before_allocation();
    ls.allocate_registers().unwrap();
    f(&mut ls);
  }

  fn two_values() -> crate::lir::Lir {
    make_lir(
      vec![make_block(
        vec![
          mov(cint(1), v(0)),
          mov(cint(2), v(1)),
          add(v(0), v(1), v(0)),
          ret(v(0)),
        ],
        &[],
      )],
      2,
    )
  }

  #[test]
  fn allocation_passes() {
    let mut lir = two_values();
    let regs = make_regs(2, 0);
    allocated(&mut lir, &regs, |ls| assert!(ls.verify().is_ok()));
  }

  #[test]
  fn shared_register_is_reported() {
    let mut lir = two_values();
    let regs = make_regs(2, 0);
    allocated(&mut lir, &regs, |ls| {
      let v0 = ls.intervals.interval_for(ls.num_regs).unwrap();
      let v1 = ls.intervals.interval_for(ls.num_regs + 1).unwrap();
      let location = ls.intervals.get(v0).location;
      ls.intervals.get_mut(v1).location = location;
      match ls.verify() {
        Err(RegAllocError::Verifier(msg)) => assert!(msg.contains("overlap")),
        other => panic!("unexpected result {:?}", other),
      }
    });
  }

  #[test]
  fn missing_location_is_reported() {
    let mut lir = two_values();
    let regs = make_regs(2, 0);
    allocated(&mut lir, &regs, |ls| {
      let v1 = ls.intervals.interval_for(ls.num_regs + 1).unwrap();
      ls.intervals.get_mut(v1).location = IntervalLocation::None;
      match ls.verify() {
        Err(RegAllocError::Verifier(msg)) => {
          assert!(msg.contains("no register"))
        }
        other => panic!("unexpected result {:?}", other),
      }
    });
  }
}
