/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Moves spill stores of values with a single definition to that definition.
//!
//! An interval in the `StoreAtDefinition` state is stored to its canonical
//! stack slot right after it is defined. Every move the allocator inserted
//! into such a slot afterwards is then redundant and is removed.

use log::{debug, info};

use crate::data_structures::*;
use crate::interval::{IntId, SpillState};
use crate::linear_scan::LinearScan;
use crate::lir::{LirOp, INSERTED_OP_ID};

impl<'a> LinearScan<'a> {
  /// Whether `op` is an allocator move into a stack slot that already holds
  /// the value.
  fn is_redundant_spill_move(&self, op: &LirOp) -> bool {
    let (src, dst) = match op.as_move() {
      Some(mov) => mov,
      None => return false,
    };
    if src.is_constant() {
      return false;
    }
    let reg_num = self.reg_num(&dst);
    let id = match reg_num.and_then(|n| self.intervals.interval_for(n)) {
      Some(id) => id,
      None => return false,
    };
    self.intervals.get(id).location.spill().is_some()
      && self.intervals.always_in_memory(id)
  }

  #[inline(never)]
  pub(crate) fn eliminate_spill_moves(&mut self) {
    info!("eliminate_spill_moves");
    let intervals = &self.intervals;
    let mut stores: Vec<IntId> = self
      .sorted_intervals
      .iter()
      .copied()
      .filter(|&id| {
        !intervals.is_fixed(id)
          && intervals.is_split_parent(id)
          && intervals.spill_state(id) == SpillState::StoreAtDefinition
      })
      .collect();
    stores.sort_by_key(|&id| intervals.spill_definition_pos(id));
    let mut next_store = 0;
    let mut num_removed = 0;

    for bix in BlockIx::new(0).dotdot(BlockIx::new(self.lir.blocks.len())) {
      let ops = std::mem::take(&mut self.lir.blocks[bix].ops);
      let mut new_ops = Vec::with_capacity(ops.len());
      for (index, op) in ops.into_iter().enumerate() {
        // The label is never touched.
        if index == 0 {
          new_ops.push(op);
          continue;
        }
        if op.id == INSERTED_OP_ID {
          if self.is_redundant_spill_move(&op) {
            debug!("removing spill move {:?}", op);
            num_removed += 1;
          } else {
            new_ops.push(op);
          }
          continue;
        }

        let op_id = op.id;
        new_ops.push(op);
        while let Some(&id) = stores.get(next_store) {
          let def_pos = self.intervals.spill_definition_pos(id);
          debug_assert!(def_pos >= op_id, "definitions out of order");
          if def_pos != op_id {
            break;
          }
          let interval = self.intervals.get(id);
          if let Some(slot) = interval.canonical_spill_slot {
            let store = LirOp::mov(
              self.intervals.operand(id),
              Operand::Stack { slot, kind: interval.kind },
            );
            debug!("store at definition {}: {:?}", op_id, store);
            new_ops.push(store);
          }
          next_store += 1;
        }
      }
      self.lir.blocks[bix].ops = new_ops;
    }

    debug_assert!(next_store == stores.len(), "missed an interval");
    debug!(
      "{} spill moves removed, {} stores at definitions",
      num_removed,
      stores.len()
    );
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::interval::IntervalLocation;
  use crate::test_util::*;

  #[test]
  fn store_moves_to_definition() {
    // b0: v0 = 1; v1 = 2; print v0; print v1
    let mut lir = make_lir(
      vec![make_block(
        vec![
          mov(cint(1), v(0)),
          mov(cint(2), v(1)),
          print(v(0)),
          print(v(1)),
          ret(cint(0)),
        ],
        &[],
      )],
      2,
    );
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    ls.sort_intervals_before_allocation();

    // Pretend that v0 was spilled after its use at 6: one allocator move
    // into its slot at 7 and a stack child.
    let v0 = ls.intervals.interval_for(ls.num_regs).unwrap();
    ls.intervals.get_mut(v0).location = IntervalLocation::Reg(RealReg(0), None);
    ls.intervals.get_mut(v0).add_range(2, 9);
    let child = ls.intervals.split(v0, 7);
    ls.assign_spill_slot(child).unwrap();
    ls.intervals.set_spill_state(v0, SpillState::StoreAtDefinition);
    let spill =
      LirOp::mov(ls.intervals.operand(v0), ls.intervals.operand(child));
    ls.lir.blocks[BlockIx::new(0)].ops.insert(4, spill);

    ls.eliminate_spill_moves();

    let ops = &ls.lir.blocks[BlockIx::new(0)].ops;
    let ids: Vec<i32> = ops.iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![0, 2, -1, 4, 6, 8, 10]);
    assert_eq!(
      ops[2].as_move(),
      Some((ls.intervals.operand(v0), Operand::stack(0, ValueKind::Int)))
    );
  }
}
