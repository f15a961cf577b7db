/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Validation of the input, op numbering and block-level liveness.

use log::{debug, info, trace};
use std::fmt;

use crate::bitset::BitSet;
use crate::data_structures::*;
use crate::interface::RegAllocError;
use crate::linear_scan::{bailout, LinearScan};
use crate::lir::{LirOp, OperandMode};

/// Maximum number of iterations of the global liveness fixpoint.
const MAX_LIVENESS_ITERATIONS: u32 = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisError {
  /// The function has no blocks.
  NoBlocks,

  /// A block does not start with a label, or has a label in the middle.
  BlockWithoutLabel(BlockIx),

  /// A non-existing real register has been seen in the code.
  NonExistingRealReg(RealReg),

  /// A successor, branch target or exception handler refers to a block that
  /// doesn't exist.
  InvalidSuccessor { from: BlockIx, to: BlockIx },

  /// A virtual register operand has no usable value kind.
  IllegalVirtualKind(VirtualReg),

  /// A virtual register index is not below `Lir::num_virtual_regs`.
  VirtualRegOutOfRange(VirtualReg),

  /// An exception handler selects a phi input that doesn't exist.
  InvalidPhiOperand { block: BlockIx, phi_operand: usize },

  /// A block's loop index is not below `Lir::num_loops`.
  InvalidLoopIndex(BlockIx),

  /// An edge from a block with several successors to a block with several
  /// predecessors. Such edges must be split before allocation.
  CriticalEdge { from: BlockIx, to: BlockIx },
}

impl fmt::Display for AnalysisError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AnalysisError::NoBlocks => write!(f, "the function has no blocks"),
      AnalysisError::BlockWithoutLabel(bix) => {
        write!(f, "block {:?} must start with its only label", bix)
      }
      AnalysisError::NonExistingRealReg(reg) => write!(
        f,
        "instructions mention real register {:?}, which isn't defined in \
         the register file",
        reg
      ),
      AnalysisError::InvalidSuccessor { from, to } => {
        write!(f, "block {:?} refers to non-existing block {:?}", from, to)
      }
      AnalysisError::IllegalVirtualKind(vreg) => {
        write!(f, "virtual register {:?} has an illegal kind", vreg)
      }
      AnalysisError::VirtualRegOutOfRange(vreg) => {
        write!(f, "virtual register {:?} is out of range", vreg)
      }
      AnalysisError::InvalidPhiOperand { block, phi_operand } => write!(
        f,
        "exception handler {:?} has no phi input {}",
        block, phi_operand
      ),
      AnalysisError::InvalidLoopIndex(bix) => {
        write!(f, "block {:?} has an out of range loop index", bix)
      }
      AnalysisError::CriticalEdge { from, to } => {
        write!(f, "critical edge from {:?} to {:?}", from, to)
      }
    }
  }
}

impl From<AnalysisError> for RegAllocError {
  fn from(err: AnalysisError) -> Self {
    RegAllocError::Analysis(err)
  }
}

//=============================================================================
// Validation

impl<'a> LinearScan<'a> {
  fn check_operand(&self, opr: &Operand) -> Result<(), AnalysisError> {
    match *opr {
      Operand::Virtual { vreg, kind } => {
        if vreg.get_index() >= self.num_virtual_regs {
          return Err(AnalysisError::VirtualRegOutOfRange(vreg));
        }
        if kind == ValueKind::Illegal {
          return Err(AnalysisError::IllegalVirtualKind(vreg));
        }
      }
      Operand::Register { .. } | Operand::RegisterPair { .. } => {
        let (lo, hi) = opr.real_regs();
        for reg in lo.iter().chain(hi.iter()) {
          if reg.get_index() >= self.num_regs {
            return Err(AnalysisError::NonExistingRealReg(*reg));
          }
        }
      }
      _ => {}
    }
    Ok(())
  }

  fn check_op(&self, bix: BlockIx, op: &LirOp) -> Result<(), AnalysisError> {
    let num_blocks = self.lir.blocks.len();
    let mut result = Ok(());
    op.for_each_operand(|opr, _| {
      if result.is_ok() {
        result = self.check_operand(opr);
      }
    });
    op.for_each_state_value(|opr| {
      if result.is_ok() {
        result = self.check_operand(opr);
      }
    });
    result?;

    if let Some(target) = branch_target(op) {
      if target.get() >= num_blocks {
        return Err(AnalysisError::InvalidSuccessor { from: bix, to: target });
      }
    }
    for info in &op.infos {
      for handler in &info.exception_handlers {
        let hbix = handler.handler_block;
        if hbix.get() >= num_blocks {
          return Err(AnalysisError::InvalidSuccessor { from: bix, to: hbix });
        }
        for phi in &self.lir.blocks[hbix].phis {
          if handler.phi_operand >= phi.inputs.len() {
            return Err(AnalysisError::InvalidPhiOperand {
              block: hbix,
              phi_operand: handler.phi_operand,
            });
          }
        }
      }
    }
    Ok(())
  }

  /// Rejects LIR the allocator cannot handle.
  #[inline(never)]
  pub(crate) fn validate(&self) -> Result<(), AnalysisError> {
    let num_blocks = self.lir.blocks.len();
    if num_blocks == 0 {
      return Err(AnalysisError::NoBlocks);
    }
    for (i, block) in self.lir.blocks.iter().enumerate() {
      let bix = BlockIx::new(i as u32);
      match block.ops.first() {
        Some(op) if op.is_label() => {}
        _ => return Err(AnalysisError::BlockWithoutLabel(bix)),
      }
      if block.ops.iter().skip(1).any(|op| op.is_label()) {
        return Err(AnalysisError::BlockWithoutLabel(bix));
      }
      if block.loop_index.map_or(false, |l| l >= self.lir.num_loops) {
        return Err(AnalysisError::InvalidLoopIndex(bix));
      }
      for &to in block.succs.iter().chain(block.exception_handlers.iter()) {
        if to.get() >= num_blocks {
          return Err(AnalysisError::InvalidSuccessor { from: bix, to });
        }
      }
      if block.succs.len() > 1 {
        for &to in &block.succs {
          if self.lir.blocks[to].preds.len() > 1 {
            return Err(AnalysisError::CriticalEdge { from: bix, to });
          }
        }
      }
      for phi in &block.phis {
        self.check_operand(&phi.operand)?;
        for input in &phi.inputs {
          self.check_operand(input)?;
        }
      }
      for op in &block.ops {
        self.check_op(bix, op)?;
      }
    }
    Ok(())
  }
}

fn branch_target(op: &LirOp) -> Option<BlockIx> {
  match op.kind {
    crate::lir::LirOpKind::Branch { target, .. } => Some(target),
    _ => None,
  }
}

//=============================================================================
// Numbering and liveness

impl<'a> LinearScan<'a> {
  /// Assigns even ids to all ops in linear order.
  #[inline(never)]
  pub(crate) fn number_instructions(&mut self) {
    let mut op_id = 0;
    let mut op_block = Vec::new();
    for (i, block) in self.lir.blocks.iter_mut().enumerate() {
      block.first_op_id = op_id;
      for op in block.ops.iter_mut() {
        op.id = op_id;
        op_block.push(BlockIx::new(i as u32));
        op_id += 2;
      }
      block.last_op_id = op_id - 2;
    }
    self.max_op_id = op_id - 2;
    self.has_call = BitSet::new(op_block.len());
    self.has_info = BitSet::new(op_block.len());
    self.op_block = op_block;
    debug!(
      "numbered {} ops, max op id {}",
      self.op_block.len(),
      self.max_op_id
    );
  }

  /// Computes the gen and kill sets of every block.
  #[inline(never)]
  pub(crate) fn compute_local_live_sets(&mut self) {
    info!("compute_local_live_sets");
    let live_size = self.num_virtual_regs;
    let num_regs = self.num_regs;
    let mut has_fpu = false;

    for bix in BlockIx::new(0).dotdot(BlockIx::new(self.lir.blocks.len())) {
      let mut live_gen = BitSet::new(live_size);
      let mut live_kill = BitSet::new(live_size);
      let block = &self.lir.blocks[bix];
      let loop_index = block.loop_index.map(|l| l as usize);

      if block.flags.exception_entry {
        // Phis of an exception handler are defined at the start of the block.
        for phi in &block.phis {
          if let Some(vreg) = phi.operand.vreg() {
            live_kill.insert(vreg.get_index());
          }
        }
      }

      for op in block.ops.iter().skip(1) {
        let index = (op.id >> 1) as usize;
        if op.is_call() {
          self.has_call.insert(index);
        }
        if op.has_info() {
          self.has_info.insert(index);
        }

        let interval_in_loop = &mut self.interval_in_loop;
        op.for_each_operand(|opr, mode| {
          let vreg = match opr.vreg() {
            Some(vreg) => vreg.get_index(),
            None => return,
          };
          match mode {
            OperandMode::Input => {
              if !live_kill.contains(vreg) {
                live_gen.insert(vreg);
              }
            }
            OperandMode::Temp | OperandMode::Output => live_kill.insert(vreg),
          }
          if let Some(loop_index) = loop_index {
            interval_in_loop.set(num_regs + vreg, loop_index);
          }
          has_fpu |= opr.kind().is_float();
        });

        // Values of the frame states must stay alive for the debug info,
        // and so must the phi inputs of the handlers this op can throw to.
        let mut state_use = |opr: &Operand| {
          if let Some(vreg) = opr.vreg() {
            if !live_kill.contains(vreg.get_index()) {
              live_gen.insert(vreg.get_index());
            }
          }
        };
        op.for_each_state_value(&mut state_use);
        for info in &op.infos {
          for handler in &info.exception_handlers {
            for phi in &self.lir.blocks[handler.handler_block].phis {
              state_use(&phi.inputs[handler.phi_operand]);
            }
          }
        }
      }

      trace!("{:?} gen {:?} kill {:?}", bix, live_gen, live_kill);
      let block = &mut self.lir.blocks[bix];
      block.live_gen = live_gen;
      block.live_kill = live_kill;
      block.live_in = BitSet::new(live_size);
      block.live_out = BitSet::new(live_size);
    }

    self.has_fpu_registers = has_fpu;
  }

  /// Iterates `live_out = U live_in(succ)` and
  /// `live_in = (live_out - kill) U gen` to a fixpoint, visiting blocks in
  /// reverse order.
  #[inline(never)]
  pub(crate) fn compute_global_live_sets(
    &mut self,
  ) -> Result<(), RegAllocError> {
    info!("compute_global_live_sets");
    let num_blocks = self.lir.blocks.len();
    let mut iteration = 0;
    loop {
      let mut change_occurred = false;

      for i in (0..num_blocks).rev() {
        let bix = BlockIx::new(i);
        let blocks = &self.lir.blocks;
        let block = &blocks[bix];

        let mut live_out = BitSet::new(self.num_virtual_regs);
        for &succ in block.succs.iter().chain(block.exception_handlers.iter()) {
          live_out.union_with(&blocks[succ].live_in);
        }
        let out_changed = live_out != block.live_out;

        let block = &mut self.lir.blocks[bix];
        if out_changed {
          block.live_out = live_out;
          change_occurred = true;
        }
        if iteration == 0 || out_changed {
          let mut live_in = block.live_out.clone();
          live_in.remove_all(&block.live_kill);
          live_in.union_with(&block.live_gen);
          block.live_in = live_in;
        }
      }
      iteration += 1;

      if !change_occurred {
        break;
      }
      if iteration > MAX_LIVENESS_ITERATIONS {
        return Err(bailout("too many iterations in computeGlobalLiveSets"));
      }
    }
    debug!("liveness converged after {} iterations", iteration);

    let entry = &self.lir.blocks[BlockIx::new(0)];
    if !entry.live_in.is_empty() {
      debug!("live-in of the entry block: {:?}", entry.live_in);
      return Err(bailout("liveIn set of first block not empty"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::{allocate_registers, Options, SimpleFrameMap};
  use crate::lir::*;
  use crate::test_util::*;

  #[test]
  fn diamond_liveness() {
    // b0: v0 = 1; branch b2 if eq
    // b1: v1 = v0 + 1; jump b3
    // b2: v1 = v0 + 2
    // b3: return v1
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
        make_block(vec![add(v(0), cint(1), v(1)), jump(3)], &[3]),
        make_block(vec![add(v(0), cint(2), v(1))], &[3]),
        make_block(vec![ret(v(1))], &[]),
      ],
      2,
    );
    let regs = make_regs(4, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();

    let live_in = |ls: &LinearScan, b: u32| {
      ls.lir.blocks[BlockIx::new(b)].live_in.iter().collect::<Vec<_>>()
    };
    assert_eq!(live_in(&ls, 0), Vec::<usize>::new());
    assert_eq!(live_in(&ls, 1), vec![0]);
    assert_eq!(live_in(&ls, 2), vec![0]);
    assert_eq!(live_in(&ls, 3), vec![1]);
    let live_out: Vec<usize> =
      ls.lir.blocks[BlockIx::new(0)].live_out.iter().collect();
    assert_eq!(live_out, vec![0]);
    assert_eq!(ls.lir.blocks[BlockIx::new(2)].first_op_id, 14);
    assert_eq!(ls.lir.blocks[BlockIx::new(3)].first_op_id, 18);
    assert!(ls.is_block_begin(14));
    assert!(!ls.is_block_begin(16));
  }

  #[test]
  fn live_in_of_entry_bails_out() {
    let mut lir = make_lir(vec![make_block(vec![ret(v(0))], &[])], 1);
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let options = Options::default();
    match allocate_registers(&mut lir, &regs, &mut frame_map, options) {
      Err(RegAllocError::Bailout(msg)) => {
        assert_eq!(msg, "liveIn set of first block not empty")
      }
      other => panic!("unexpected result {:?}", other),
    }
  }

  #[test]
  fn malformed_input_is_rejected() {
    let mut lir = make_lir(vec![make_block(vec![ret(v(3))], &[])], 1);
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let options = Options::default();
    match allocate_registers(&mut lir, &regs, &mut frame_map, options) {
      Err(RegAllocError::Analysis(AnalysisError::VirtualRegOutOfRange(
        vreg,
      ))) => {
        assert_eq!(vreg, VirtualReg(3))
      }
      other => panic!("unexpected result {:?}", other),
    }

    let mut lir = make_lir(vec![make_block(vec![ret(cint(0))], &[])], 0);
    lir.blocks[BlockIx::new(0)].ops.remove(0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let options = Options::default();
    let err = allocate_registers(&mut lir, &regs, &mut frame_map, options);
    assert!(matches!(
      err,
      Err(RegAllocError::Analysis(AnalysisError::BlockWithoutLabel(_)))
    ));
  }

  #[test]
  fn critical_edges_are_rejected() {
    // b0 branches to b1 or b2, and b1 also falls into b2.
    let mut lir = make_lir(
      vec![
        make_block(
          vec![cmp(cint(0), cint(1)), branch(Condition::Equal, 2)],
          &[1, 2],
        ),
        make_block(vec![jump(2)], &[2]),
        make_block(vec![ret(cint(0))], &[]),
      ],
      0,
    );
    let regs = make_regs(2, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let options = Options::default();
    let err = allocate_registers(&mut lir, &regs, &mut frame_map, options);
    match err {
      Err(RegAllocError::Analysis(AnalysisError::CriticalEdge {
        from,
        to,
      })) => {
        assert_eq!((from, to), (BlockIx::new(0), BlockIx::new(2)))
      }
      other => panic!("unexpected result {:?}", other),
    }
  }
}
