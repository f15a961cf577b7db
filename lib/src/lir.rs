/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The low-level IR consumed and rewritten by the allocator: blocks in
//! linear-scan order, each holding a list of ops whose operands are
//! classified as inputs, temps and outputs.

use rustc_hash::FxHashSet as HashSet;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::bitset::BitSet;
use crate::data_structures::*;

/// Id of an op inserted by the allocator. Real ids are even and start at 0.
pub const INSERTED_OP_ID: i32 = -1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandMode {
  Input,
  Temp,
  Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Condition {
  Always,
  Equal,
  NotEqual,
  Less,
  LessEqual,
  Greater,
  GreaterEqual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ArithOp {
  Add,
  Sub,
  Mul,
  Div,
  Rem,
  And,
  Or,
  Xor,
  Shl,
  Shr,
  /// Compares both operands and sets the condition flags. No result.
  Cmp,
}

impl ArithOp {
  pub fn is_logic(self) -> bool {
    match self {
      ArithOp::And | ArithOp::Or | ArithOp::Xor => true,
      _ => false,
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ConvertOp {
  I2L,
  L2I,
  I2F,
  F2I,
  I2D,
  D2I,
  F2D,
  D2F,
}

/// Runtime entry points callable from LIR.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CallTarget {
  /// Returns the sum of its integer arguments.
  Sum,
  /// Returns a fresh object reference.
  NewObject,
  /// Returns its first argument.
  Identity,
}

#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum LirOpKind {
  Label,
  Move { src: Operand, dst: Operand },
  Load { addr: Address, dst: Operand, patch: bool },
  Store { src: Operand, addr: Address, patch: bool },
  Convert { op: ConvertOp, src: Operand, dst: Operand },
  Op2 { op: ArithOp, left: Operand, right: Operand, result: Operand },
  Cmove { cond: Condition, left: Operand, right: Operand, result: Operand },
  Branch { cond: Condition, target: BlockIx },
  /// Destroys every caller-saved register.
  Call { target: CallTarget, args: Vec<Operand>, result: Operand },
  Safepoint,
  Print { value: Operand },
  Return { value: Operand },
}

//=============================================================================
// Debug information and the results attached to it.

/// One inlining level of the interpreter state at a safepoint.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FrameState {
  /// Unique per inlined method.
  pub scope: u32,
  pub bci: i32,
  /// A double-word local occupies two entries; the second one is `Illegal`.
  pub locals: Vec<Operand>,
  pub stack: Vec<Operand>,
  /// Lock objects held by this scope.
  pub locks: Vec<Operand>,
  pub caller: Option<Box<FrameState>>,
}

impl FrameState {
  pub fn new(scope: u32, bci: i32) -> Self {
    Self {
      scope,
      bci,
      locals: Vec::new(),
      stack: Vec::new(),
      locks: Vec::new(),
      caller: None,
    }
  }

  /// Number of locks held by this scope and all of its callers.
  pub fn total_locks(&self) -> usize {
    self.locks.len() + self.caller.as_ref().map_or(0, |c| c.total_locks())
  }

  /// Visits every value of the whole scope chain.
  pub fn for_each_value<F: FnMut(&Operand)>(&self, f: &mut F) {
    if let Some(caller) = &self.caller {
      caller.for_each_value(f);
    }
    let values =
      self.locals.iter().chain(self.stack.iter()).chain(self.locks.iter());
    for opr in values {
      f(opr);
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ExceptionHandler {
  pub handler_block: BlockIx,
  /// Index into the inputs of the handler block's phis.
  pub phi_operand: usize,
  /// Id of the throwing op, once resolved.
  pub lir_op_id: Option<i32>,
  /// Moves executed before control reaches the handler block. Ends with a
  /// jump to it.
  pub entry_code: Option<Vec<LirOp>>,
}

impl ExceptionHandler {
  pub fn new(handler_block: BlockIx, phi_operand: usize) -> Self {
    Self { handler_block, phi_operand, lir_op_id: None, entry_code: None }
  }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Location {
  Reg(RealReg),
  Stack(StackSlot),
}

/// Locations holding live references at a safepoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct OopMap {
  pub frame_size: u32,
  pub locations: BTreeSet<Location>,
}

impl OopMap {
  pub fn set_oop(&mut self, loc: Location) {
    self.locations.insert(loc);
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum LocationKind {
  Normal,
  Oop,
  Long,
  Double,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ScopeValue {
  Location { loc: Location, kind: LocationKind },
  Constant(Constant),
  Illegal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MonitorValue {
  pub owner: ScopeValue,
  pub basic_lock: StackSlot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ScopeDebugInfo {
  pub scope: u32,
  pub bci: i32,
  pub locals: Vec<ScopeValue>,
  pub expressions: Vec<ScopeValue>,
  pub monitors: Vec<MonitorValue>,
}

/// Debug info of one safepoint; the outermost scope comes first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DebugInfo {
  pub scopes: Vec<ScopeDebugInfo>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeEmitInfo {
  pub state: FrameState,
  pub exception_handlers: Vec<ExceptionHandler>,
  pub oop_map: Option<OopMap>,
  pub debug_info: Option<DebugInfo>,
}

impl CodeEmitInfo {
  pub fn new(state: FrameState) -> Self {
    Self {
      state,
      exception_handlers: Vec::new(),
      oop_map: None,
      debug_info: None,
    }
  }

  pub fn with_handlers(mut self, handlers: Vec<ExceptionHandler>) -> Self {
    self.exception_handlers = handlers;
    self
  }
}

//=============================================================================
// Ops

#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct LirOp {
  /// Even position assigned by numbering, or `INSERTED_OP_ID`.
  pub id: i32,
  pub kind: LirOpKind,
  pub infos: SmallVec<[CodeEmitInfo; 1]>,
}

impl LirOp {
  pub fn new(kind: LirOpKind) -> Self {
    Self { id: INSERTED_OP_ID, kind, infos: SmallVec::new() }
  }

  pub fn with_info(kind: LirOpKind, info: CodeEmitInfo) -> Self {
    let mut infos = SmallVec::new();
    infos.push(info);
    Self { id: INSERTED_OP_ID, kind, infos }
  }

  pub fn label() -> Self {
    Self::new(LirOpKind::Label)
  }

  pub fn mov(src: Operand, dst: Operand) -> Self {
    Self::new(LirOpKind::Move { src, dst })
  }

  pub fn jump(target: BlockIx) -> Self {
    Self::new(LirOpKind::Branch { cond: Condition::Always, target })
  }

  pub fn is_call(&self) -> bool {
    match self.kind {
      LirOpKind::Call { .. } => true,
      _ => false,
    }
  }

  pub fn is_branch(&self) -> bool {
    match self.kind {
      LirOpKind::Branch { .. } => true,
      _ => false,
    }
  }

  pub fn is_label(&self) -> bool {
    self.kind == LirOpKind::Label
  }

  pub fn has_info(&self) -> bool {
    !self.infos.is_empty()
  }

  /// Loads and stores that may need runtime patching.
  pub fn is_patch(&self) -> bool {
    match self.kind {
      LirOpKind::Load { patch, .. } | LirOpKind::Store { patch, .. } => patch,
      _ => false,
    }
  }

  /// Source and destination of a register/stack move.
  pub fn as_move(&self) -> Option<(Operand, Operand)> {
    match self.kind {
      LirOpKind::Move { src, dst } => Some((src, dst)),
      _ => None,
    }
  }

  /// Visits all operands, inputs first, then temps, then outputs. Address
  /// registers are inputs.
  pub fn for_each_operand<F: FnMut(&Operand, OperandMode)>(&self, mut f: F) {
    use OperandMode::*;
    match &self.kind {
      LirOpKind::Label | LirOpKind::Safepoint => {}
      LirOpKind::Branch { .. } => {}
      LirOpKind::Move { src, dst } => {
        f(src, Input);
        f(dst, Output);
      }
      LirOpKind::Load { addr, dst, .. } => {
        f(&addr.base, Input);
        f(&addr.index, Input);
        f(dst, Output);
      }
      LirOpKind::Store { src, addr, .. } => {
        f(src, Input);
        f(&addr.base, Input);
        f(&addr.index, Input);
      }
      LirOpKind::Convert { src, dst, .. } => {
        f(src, Input);
        f(dst, Output);
      }
      LirOpKind::Op2 { left, right, result, .. }
      | LirOpKind::Cmove { left, right, result, .. } => {
        f(left, Input);
        f(right, Input);
        f(result, Output);
      }
      LirOpKind::Call { args, result, .. } => {
        for arg in args {
          f(arg, Input);
        }
        f(result, Output);
      }
      LirOpKind::Print { value } | LirOpKind::Return { value } => {
        f(value, Input);
      }
    }
  }

  pub fn for_each_operand_mut<F: FnMut(&mut Operand, OperandMode)>(
    &mut self, mut f: F,
  ) {
    use OperandMode::*;
    match &mut self.kind {
      LirOpKind::Label | LirOpKind::Safepoint => {}
      LirOpKind::Branch { .. } => {}
      LirOpKind::Move { src, dst } => {
        f(src, Input);
        f(dst, Output);
      }
      LirOpKind::Load { addr, dst, .. } => {
        f(&mut addr.base, Input);
        f(&mut addr.index, Input);
        f(dst, Output);
      }
      LirOpKind::Store { src, addr, .. } => {
        f(src, Input);
        f(&mut addr.base, Input);
        f(&mut addr.index, Input);
      }
      LirOpKind::Convert { src, dst, .. } => {
        f(src, Input);
        f(dst, Output);
      }
      LirOpKind::Op2 { left, right, result, .. }
      | LirOpKind::Cmove { left, right, result, .. } => {
        f(left, Input);
        f(right, Input);
        f(result, Output);
      }
      LirOpKind::Call { args, result, .. } => {
        for arg in args.iter_mut() {
          f(arg, Input);
        }
        f(result, Output);
      }
      LirOpKind::Print { value } | LirOpKind::Return { value } => {
        f(value, Input);
      }
    }
  }

  /// Visits the values recorded in the debug info of this op.
  pub fn for_each_state_value<F: FnMut(&Operand)>(&self, mut f: F) {
    for info in &self.infos {
      info.state.for_each_value(&mut f);
    }
  }
}

impl fmt::Debug for LirOp {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.id == INSERTED_OP_ID {
      write!(fmt, "   * ")?;
    } else {
      write!(fmt, "{:4} ", self.id)?;
    }
    match &self.kind {
      LirOpKind::Label => write!(fmt, "label"),
      LirOpKind::Move { src, dst } => {
        write!(fmt, "move {:?} -> {:?}", src, dst)
      }
      LirOpKind::Load { addr, dst, patch } => write!(
        fmt,
        "load{} {:?} -> {:?}",
        if *patch { "[patch]" } else { "" },
        addr,
        dst
      ),
      LirOpKind::Store { src, addr, patch } => write!(
        fmt,
        "store{} {:?} -> {:?}",
        if *patch { "[patch]" } else { "" },
        src,
        addr
      ),
      LirOpKind::Convert { op, src, dst } => {
        write!(fmt, "convert {:?} {:?} -> {:?}", op, src, dst)
      }
      LirOpKind::Op2 { op, left, right, result } => {
        write!(fmt, "{:?} {:?}, {:?} -> {:?}", op, left, right, result)
      }
      LirOpKind::Cmove { cond, left, right, result } => {
        write!(fmt, "cmove {:?} {:?}, {:?} -> {:?}", cond, left, right, result)
      }
      LirOpKind::Branch { cond, target } => {
        write!(fmt, "branch {:?} {:?}", cond, target)
      }
      LirOpKind::Call { target, args, result } => {
        write!(fmt, "call {:?} {:?} -> {:?}", target, args, result)
      }
      LirOpKind::Safepoint => write!(fmt, "safepoint"),
      LirOpKind::Print { value } => write!(fmt, "print {:?}", value),
      LirOpKind::Return { value } => write!(fmt, "return {:?}", value),
    }?;
    if self.has_info() {
      write!(fmt, " [info]")?;
    }
    Ok(())
  }
}

//=============================================================================
// Blocks and the whole method.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct BlockFlags {
  pub exception_entry: bool,
  pub loop_end: bool,
  pub osr_entry: bool,
}

/// A phi of an exception entry block. `inputs[k]` is the value flowing in
/// from handlers with `phi_operand == k`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Phi {
  pub operand: Operand,
  pub inputs: Vec<Operand>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Block {
  pub name: String,
  /// The first op is always a label.
  pub ops: Vec<LirOp>,
  pub preds: Vec<BlockIx>,
  pub succs: Vec<BlockIx>,
  /// Entry blocks of the handlers any op of this block can throw to.
  pub exception_handlers: Vec<BlockIx>,
  pub phis: Vec<Phi>,
  pub loop_index: Option<u32>,
  pub loop_depth: u32,
  pub flags: BlockFlags,

  // Computed by the allocator.
  pub first_op_id: i32,
  pub last_op_id: i32,
  pub live_gen: BitSet,
  pub live_kill: BitSet,
  pub live_in: BitSet,
  pub live_out: BitSet,
}

impl Block {
  pub fn new(name: String) -> Self {
    Self {
      name,
      ops: Vec::new(),
      preds: Vec::new(),
      succs: Vec::new(),
      exception_handlers: Vec::new(),
      phis: Vec::new(),
      loop_index: None,
      loop_depth: 0,
      flags: BlockFlags::default(),
      first_op_id: -1,
      last_op_id: -1,
      live_gen: BitSet::default(),
      live_kill: BitSet::default(),
      live_in: BitSet::default(),
      live_out: BitSet::default(),
    }
  }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Lir {
  pub name: String,
  /// Blocks in linear-scan order; the first one is the entry.
  pub blocks: TypedIxVec<BlockIx, Block>,
  pub num_virtual_regs: u32,
  pub num_loops: u32,
  /// Virtual registers whose value must be produced in a stack slot first.
  pub must_start_in_memory: HashSet<VirtualReg>,
}

impl Lir {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      blocks: TypedIxVec::new(),
      num_virtual_regs: 0,
      num_loops: 0,
      must_start_in_memory: HashSet::default(),
    }
  }

  pub fn print(&self, who: &str) {
    println!();
    println!("Lir {}: name='{}' {{", who, self.name);
    for (i, block) in self.blocks.iter().enumerate() {
      if i > 0 {
        println!();
      }
      println!(
        "  {:?}:{} preds={:?} succs={:?}",
        BlockIx::new(i as u32),
        block.name,
        block.preds,
        block.succs
      );
      for op in &block.ops {
        println!("      {:?}", op);
      }
    }
    println!("}}");
  }
}
