/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Small LIR construction helpers for the unit tests.

use crate::data_structures::*;
use crate::lir::*;

/// `num_cpu` caller-saved CPU registers followed by `num_fpu` FPU registers.
pub fn make_regs(num_cpu: usize, num_fpu: usize) -> RegisterFile {
  let mut regs = Vec::new();
  for i in 0..num_cpu {
    regs.push(RegInfo {
      name: format!("r{}", i),
      class: RegClass::Cpu,
      caller_saved: true,
    });
  }
  for i in 0..num_fpu {
    regs.push(RegInfo {
      name: format!("f{}", i),
      class: RegClass::Fpu,
      caller_saved: true,
    });
  }
  let target = TargetConfig { is_64bit: true, double_needs_pair: false };
  RegisterFile::new(regs, target)
}

pub fn v(index: u32) -> Operand {
  Operand::virt(index, ValueKind::Int)
}

pub fn obj(index: u32) -> Operand {
  Operand::virt(index, ValueKind::Object)
}

pub fn cint(n: i32) -> Operand {
  Operand::Constant(Constant::Int(n))
}

pub fn mov(src: Operand, dst: Operand) -> LirOp {
  LirOp::mov(src, dst)
}

pub fn add(left: Operand, right: Operand, result: Operand) -> LirOp {
  LirOp::new(LirOpKind::Op2 { op: ArithOp::Add, left, right, result })
}

pub fn cmp(left: Operand, right: Operand) -> LirOp {
  LirOp::new(LirOpKind::Op2 {
    op: ArithOp::Cmp,
    left,
    right,
    result: Operand::Illegal,
  })
}

pub fn branch(cond: Condition, target: u32) -> LirOp {
  LirOp::new(LirOpKind::Branch { cond, target: BlockIx::new(target) })
}

pub fn jump(target: u32) -> LirOp {
  LirOp::jump(BlockIx::new(target))
}

pub fn ret(value: Operand) -> LirOp {
  LirOp::new(LirOpKind::Return { value })
}

pub fn print(value: Operand) -> LirOp {
  LirOp::new(LirOpKind::Print { value })
}

/// A safepoint whose frame state holds `locals`.
pub fn safepoint(locals: Vec<Operand>) -> LirOp {
  let mut state = FrameState::new(0, 0);
  state.locals = locals;
  LirOp::with_info(LirOpKind::Safepoint, CodeEmitInfo::new(state))
}

/// A block with a leading label.
pub fn make_block(ops: Vec<LirOp>, succs: &[u32]) -> Block {
  let mut block = Block::new(String::new());
  block.ops.push(LirOp::label());
  block.ops.extend(ops);
  block.succs = succs.iter().map(|&s| BlockIx::new(s)).collect();
  block
}

/// Names the blocks and fills in predecessors.
pub fn make_lir(blocks: Vec<Block>, num_virtual_regs: u32) -> Lir {
  let mut lir = Lir::new("test");
  lir.num_virtual_regs = num_virtual_regs;
  let mut preds = vec![Vec::new(); blocks.len()];
  for (i, block) in blocks.iter().enumerate() {
    for succ in &block.succs {
      preds[succ.get_usize()].push(BlockIx::new(i as u32));
    }
  }
  for ((i, mut block), preds) in blocks.into_iter().enumerate().zip(preds) {
    block.name = format!("b{}", i);
    block.preds = preds;
    lir.blocks.push(block);
  }
  lir
}
