/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test harness for the allocator: a builder for LIR functions with named
//! blocks, and an interpreter that runs a function before and after
//! allocation so that the two runs can be compared.

use lsra::{
  allocate_registers, Address, ArithOp, BlockIx, CallTarget, CodeEmitInfo,
  Condition, Constant, ConvertOp, ExceptionHandler, FrameState, Lir, LirOp,
  LirOpKind, Location, Operand, Options, Phi, RegAllocError, RegAllocResult,
  RegClass, RegInfo, RegisterFile, SimpleFrameMap, StackSlot, TargetConfig,
  ValueKind,
};

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

//=============================================================================
// Register files

/// `num_cpu` CPU registers followed by `num_fpu` FPU registers. The first
/// half of each class (rounded up) is caller-saved.
pub fn make_register_file(
  num_cpu: usize, num_fpu: usize, is_64bit: bool,
) -> RegisterFile {
  let mut regs = Vec::new();
  for i in 0..num_cpu {
    regs.push(RegInfo {
      name: format!("r{}", i),
      class: RegClass::Cpu,
      caller_saved: i < (num_cpu + 1) / 2,
    });
  }
  for i in 0..num_fpu {
    regs.push(RegInfo {
      name: format!("f{}", i),
      class: RegClass::Fpu,
      caller_saved: i < (num_fpu + 1) / 2,
    });
  }
  RegisterFile::new(regs, TargetConfig { is_64bit, double_needs_pair: false })
}

//=============================================================================
// Instructions under construction

/// An op of a function under construction. Branch targets and exception
/// handlers are block names until `FuncBuilder::finish`.
#[derive(Clone)]
pub struct Inst {
  op: LirOp,
  target: Option<String>,
  handlers: Vec<(String, usize)>,
}

impl Inst {
  fn new(kind: LirOpKind) -> Self {
    Self { op: LirOp::new(kind), target: None, handlers: Vec::new() }
  }

  /// Attaches debug info describing `state`.
  pub fn with_info(mut self, state: FrameState) -> Self {
    self.op.infos.push(CodeEmitInfo::new(state));
    self
  }

  /// Lets the op throw to `handler`, selecting its phi inputs at
  /// `phi_operand`. Only division and remainder actually throw.
  pub fn throws_to(mut self, handler: &str, phi_operand: usize) -> Self {
    if self.op.infos.is_empty() {
      self.op.infos.push(CodeEmitInfo::new(FrameState::new(0, 0)));
    }
    self.handlers.push((handler.to_string(), phi_operand));
    self
  }
}

impl fmt::Debug for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match &self.target {
      Some(target) => write!(fmt, "{:?} ({})", self.op, target),
      None => write!(fmt, "{:?}", self.op),
    }
  }
}

pub fn i_move(src: Operand, dst: Operand) -> Inst {
  Inst::new(LirOpKind::Move { src, dst })
}
pub fn i_load(addr: Address, dst: Operand) -> Inst {
  Inst::new(LirOpKind::Load { addr, dst, patch: false })
}
pub fn i_store(src: Operand, addr: Address) -> Inst {
  Inst::new(LirOpKind::Store { src, addr, patch: false })
}
pub fn i_convert(op: ConvertOp, src: Operand, dst: Operand) -> Inst {
  Inst::new(LirOpKind::Convert { op, src, dst })
}
pub fn i_op2(
  op: ArithOp, left: Operand, right: Operand, result: Operand,
) -> Inst {
  Inst::new(LirOpKind::Op2 { op, left, right, result })
}
pub fn i_add(left: Operand, right: Operand, result: Operand) -> Inst {
  i_op2(ArithOp::Add, left, right, result)
}
pub fn i_sub(left: Operand, right: Operand, result: Operand) -> Inst {
  i_op2(ArithOp::Sub, left, right, result)
}
pub fn i_mul(left: Operand, right: Operand, result: Operand) -> Inst {
  i_op2(ArithOp::Mul, left, right, result)
}
pub fn i_div(left: Operand, right: Operand, result: Operand) -> Inst {
  i_op2(ArithOp::Div, left, right, result)
}
pub fn i_rem(left: Operand, right: Operand, result: Operand) -> Inst {
  i_op2(ArithOp::Rem, left, right, result)
}
pub fn i_cmp(left: Operand, right: Operand) -> Inst {
  i_op2(ArithOp::Cmp, left, right, Operand::Illegal)
}
pub fn i_cmove(
  cond: Condition, left: Operand, right: Operand, result: Operand,
) -> Inst {
  Inst::new(LirOpKind::Cmove { cond, left, right, result })
}
pub fn i_call(target: CallTarget, args: Vec<Operand>, result: Operand) -> Inst {
  Inst::new(LirOpKind::Call { target, args, result })
}
pub fn i_safepoint(state: FrameState) -> Inst {
  Inst::new(LirOpKind::Safepoint).with_info(state)
}
pub fn i_print(value: Operand) -> Inst {
  Inst::new(LirOpKind::Print { value })
}
pub fn i_ret(value: Operand) -> Inst {
  Inst::new(LirOpKind::Return { value })
}
pub fn i_goto(target: &str) -> Inst {
  i_branch(Condition::Always, target)
}
pub fn i_branch(cond: Condition, target: &str) -> Inst {
  let unresolved = BlockIx::new(u32::max_value());
  let mut inst = Inst::new(LirOpKind::Branch { cond, target: unresolved });
  inst.target = Some(target.to_string());
  inst
}

pub fn int(n: i32) -> Operand {
  Operand::Constant(Constant::Int(n))
}
pub fn long(n: i64) -> Operand {
  Operand::Constant(Constant::Long(n))
}
pub fn float(f: f32) -> Operand {
  Operand::Constant(Constant::float(f))
}
pub fn double(d: f64) -> Operand {
  Operand::Constant(Constant::double(d))
}
pub fn null() -> Operand {
  Operand::Constant(Constant::Object(None))
}

/// A frame state with the given locals and locks.
pub fn state(
  bci: i32, locals: Vec<Operand>, locks: Vec<Operand>,
) -> FrameState {
  let mut state = FrameState::new(0, bci);
  state.locals = locals;
  state.locks = locks;
  state
}

//=============================================================================
// Functions

/// A function ready to be allocated and run: the LIR, plus the values of the
/// incoming arguments that sit in the first stack slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Func {
  pub lir: Lir,
  pub args: Vec<Value>,
  pub num_arg_slots: u32,
  pub max_monitors: u32,
}

impl Func {
  pub fn print(&self, who: &str) {
    self.lir.print(who);
  }

  pub fn frame_map(&self) -> SimpleFrameMap {
    SimpleFrameMap::new(self.num_arg_slots, self.max_monitors)
  }

  /// Allocates registers in place.
  pub fn allocate(
    &mut self, regs: &RegisterFile, options: Options,
  ) -> Result<RegAllocResult, RegAllocError> {
    let mut frame_map = self.frame_map();
    allocate_registers(&mut self.lir, regs, &mut frame_map, options)
  }
}

struct BlockDef {
  name: String,
  insts: Vec<Inst>,
  phis: Vec<Phi>,
  is_handler: bool,
}

pub struct FuncBuilder {
  name: String,
  num_virtual_regs: u32,
  blocks: Vec<BlockDef>,
  args: Vec<Value>,
  num_arg_slots: u32,
  max_monitors: u32,
  must_start_in_memory: Vec<Operand>,
}

impl FuncBuilder {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      num_virtual_regs: 0,
      blocks: Vec::new(),
      args: Vec::new(),
      num_arg_slots: 0,
      max_monitors: 0,
      must_start_in_memory: Vec::new(),
    }
  }

  /// A fresh virtual register.
  pub fn vreg(&mut self, kind: ValueKind) -> Operand {
    let opr = Operand::virt(self.num_virtual_regs, kind);
    self.num_virtual_regs += 1;
    opr
  }

  /// An incoming argument with the given value. Double-word arguments take
  /// two slots.
  pub fn arg(&mut self, value: Value) -> Operand {
    let kind = value.kind();
    let slot = self.num_arg_slots;
    self.num_arg_slots += if kind.is_double_word() { 2 } else { 1 };
    self.args.push(value);
    Operand::stack(slot, kind)
  }

  pub fn set_max_monitors(&mut self, max_monitors: u32) {
    self.max_monitors = max_monitors;
  }

  /// The value of `vreg` must be produced in its stack slot first.
  pub fn start_in_memory(&mut self, vreg: Operand) {
    self.must_start_in_memory.push(vreg);
  }

  pub fn block(&mut self, name: &str, insts: Vec<Inst>) {
    self.blocks.push(BlockDef {
      name: name.to_string(),
      insts,
      phis: Vec::new(),
      is_handler: false,
    });
  }

  /// An exception handler entry. Each phi has one input per `phi_operand`
  /// used by the throwing ops.
  pub fn handler(&mut self, name: &str, phis: Vec<Phi>, insts: Vec<Inst>) {
    self.blocks.push(BlockDef {
      name: name.to_string(),
      insts,
      phis,
      is_handler: true,
    });
  }

  /// Resolves block names and computes predecessors, successors and loops.
  /// The blocks keep the order in which they were added.
  pub fn finish(self) -> Func {
    let mut index_of = HashMap::default();
    for (i, def) in self.blocks.iter().enumerate() {
      if index_of.insert(def.name.clone(), BlockIx::new(i as u32)).is_some() {
        panic!("FuncBuilder: duplicate block name '{}'", def.name);
      }
    }
    let lookup = |name: &str| -> BlockIx {
      match index_of.get(name) {
        Some(bix) => *bix,
        None => panic!("FuncBuilder: can't resolve label name '{}'", name),
      }
    };

    let num_blocks = self.blocks.len();
    let mut lir = Lir::new(&self.name);
    lir.num_virtual_regs = self.num_virtual_regs;
    for opr in &self.must_start_in_memory {
      if let Some(vreg) = opr.vreg() {
        lir.must_start_in_memory.insert(vreg);
      }
    }

    for (i, def) in self.blocks.into_iter().enumerate() {
      let mut block = lsra::Block::new(def.name);
      block.phis = def.phis;
      block.flags.exception_entry = def.is_handler;
      block.ops.push(LirOp::label());
      let mut falls_through = true;

      for inst in def.insts {
        let mut op = inst.op;
        if let Some(name) = &inst.target {
          let target = lookup(name);
          if let LirOpKind::Branch { target: t, cond } = &mut op.kind {
            *t = target;
            falls_through = *cond != Condition::Always;
          }
          if !block.succs.contains(&target) {
            block.succs.push(target);
          }
        } else if let LirOpKind::Return { .. } = op.kind {
          falls_through = false;
        } else {
          falls_through = true;
        }
        for (name, phi_operand) in &inst.handlers {
          let handler = lookup(name);
          if let Some(info) = op.infos.last_mut() {
            let entry = ExceptionHandler::new(handler, *phi_operand);
            info.exception_handlers.push(entry);
          }
          if !block.exception_handlers.contains(&handler) {
            block.exception_handlers.push(handler);
          }
        }
        block.ops.push(op);
      }

      if falls_through {
        if i + 1 >= num_blocks {
          panic!("FuncBuilder: last block '{}' falls off the end", block.name);
        }
        let next = BlockIx::new(i as u32 + 1);
        if !block.succs.contains(&next) {
          block.succs.push(next);
        }
      }
      lir.blocks.push(block);
    }

    // Predecessors.
    for i in 0..num_blocks {
      let bix = BlockIx::new(i as u32);
      for succ in lir.blocks[bix].succs.clone() {
        lir.blocks[succ].preds.push(bix);
      }
    }
    for i in 0..num_blocks {
      let block = &lir.blocks[BlockIx::new(i as u32)];
      if block.succs.len() > 1 {
        for &succ in &block.succs {
          if lir.blocks[succ].preds.len() > 1 {
            panic!(
              "FuncBuilder: critical edge from '{}' to '{}'",
              block.name, lir.blocks[succ].name
            );
          }
        }
      }
    }

    // Loops, from back edges in linear order: a loop spans its header up to
    // its last back edge.
    let mut loops: Vec<(u32, u32)> = Vec::new();
    for i in 0..num_blocks as u32 {
      for &succ in &lir.blocks[BlockIx::new(i)].succs {
        if succ.get() > i {
          continue;
        }
        match loops.iter_mut().find(|(header, _)| *header == succ.get()) {
          Some((_, end)) => *end = (*end).max(i),
          None => loops.push((succ.get(), i)),
        }
      }
    }
    loops.sort();
    for (loop_index, &(header, end)) in loops.iter().enumerate() {
      for i in header..=end {
        let block = &mut lir.blocks[BlockIx::new(i)];
        block.loop_depth += 1;
        // Inner loops come later, so the last one wins.
        block.loop_index = Some(loop_index as u32);
      }
      lir.blocks[BlockIx::new(end)].flags.loop_end = true;
    }
    lir.num_loops = loops.len() as u32;

    Func {
      lir,
      args: self.args,
      num_arg_slots: self.num_arg_slots,
      max_monitors: self.max_monitors,
    }
  }
}

//=============================================================================
// The interpreter

#[derive(Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
  Int(i32),
  Long(i64),
  Float(f32),
  Double(f64),
  Object(Option<u32>),
}

impl Value {
  pub fn kind(self) -> ValueKind {
    match self {
      Value::Int(_) => ValueKind::Int,
      Value::Long(_) => ValueKind::Long,
      Value::Float(_) => ValueKind::Float,
      Value::Double(_) => ValueKind::Double,
      Value::Object(_) => ValueKind::Object,
    }
  }

  fn from_constant(c: Constant) -> Self {
    match c {
      Constant::Int(n) => Value::Int(n),
      Constant::Long(n) => Value::Long(n),
      Constant::Float(bits) => Value::Float(f32::from_bits(bits)),
      Constant::Double(bits) => Value::Double(f64::from_bits(bits)),
      Constant::Object(obj) => Value::Object(obj),
    }
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::Int(n) => write!(fmt, "{}", n),
      Value::Long(n) => write!(fmt, "{}L", n),
      Value::Float(n) => write!(fmt, "{}f", n),
      Value::Double(n) => write!(fmt, "{}d", n),
      Value::Object(None) => write!(fmt, "null"),
      Value::Object(Some(n)) => write!(fmt, "obj{}", n),
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RunStage {
  BeforeRegalloc,
  AfterRegalloc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
  pub ret_value: Option<Value>,
  pub stdout: String,
  pub num_steps: usize,
}

const MAX_STEPS: usize = 1_000_000;
const MEMORY_SIZE: usize = 4096;
/// Objects live at `OBJECT_BASE + OBJECT_SIZE * n`.
const OBJECT_BASE: usize = 1024;
const OBJECT_SIZE: usize = 16;

fn holds(cond: Condition, flags: Ordering) -> bool {
  match cond {
    Condition::Always => true,
    Condition::Equal => flags == Ordering::Equal,
    Condition::NotEqual => flags != Ordering::Equal,
    Condition::Less => flags == Ordering::Less,
    Condition::LessEqual => flags != Ordering::Greater,
    Condition::Greater => flags == Ordering::Greater,
    Condition::GreaterEqual => flags != Ordering::Less,
  }
}

fn compare(left: Value, right: Value) -> Result<Ordering, String> {
  let ord = match (left, right) {
    (Value::Int(a), Value::Int(b)) => Some(a.cmp(&b)),
    (Value::Long(a), Value::Long(b)) => Some(a.cmp(&b)),
    (Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
    (Value::Double(a), Value::Double(b)) => a.partial_cmp(&b),
    (Value::Object(a), Value::Object(b)) => Some(a.cmp(&b)),
    _ => None,
  };
  ord.ok_or_else(|| format!("can't compare {:?} and {:?}", left, right))
}

/// `Ok(None)` is an integer division by zero.
fn arith(
  op: ArithOp, left: Value, right: Value,
) -> Result<Option<Value>, String> {
  use ArithOp::*;
  let value = match (left, right) {
    (Value::Int(a), Value::Int(b)) => Value::Int(match op {
      Add => a.wrapping_add(b),
      Sub => a.wrapping_sub(b),
      Mul => a.wrapping_mul(b),
      Div | Rem if b == 0 => return Ok(None),
      Div => a.wrapping_div(b),
      Rem => a.wrapping_rem(b),
      And => a & b,
      Or => a | b,
      Xor => a ^ b,
      Shl => a.wrapping_shl(b as u32),
      Shr => a.wrapping_shr(b as u32),
      Cmp => unreachable!(),
    }),
    (Value::Long(a), Value::Long(b)) => Value::Long(match op {
      Add => a.wrapping_add(b),
      Sub => a.wrapping_sub(b),
      Mul => a.wrapping_mul(b),
      Div | Rem if b == 0 => return Ok(None),
      Div => a.wrapping_div(b),
      Rem => a.wrapping_rem(b),
      And => a & b,
      Or => a | b,
      Xor => a ^ b,
      Shl => a.wrapping_shl(b as u32),
      Shr => a.wrapping_shr(b as u32),
      Cmp => unreachable!(),
    }),
    (Value::Long(a), Value::Int(b)) if op == Shl || op == Shr => {
      Value::Long(if op == Shl {
        a.wrapping_shl(b as u32)
      } else {
        a.wrapping_shr(b as u32)
      })
    }
    (Value::Float(a), Value::Float(b)) => Value::Float(match op {
      Add => a + b,
      Sub => a - b,
      Mul => a * b,
      Div => a / b,
      Rem => a % b,
      _ => return Err(format!("{:?} on floats", op)),
    }),
    (Value::Double(a), Value::Double(b)) => Value::Double(match op {
      Add => a + b,
      Sub => a - b,
      Mul => a * b,
      Div => a / b,
      Rem => a % b,
      _ => return Err(format!("{:?} on doubles", op)),
    }),
    _ => return Err(format!("{:?} on {:?} and {:?}", op, left, right)),
  };
  Ok(Some(value))
}

fn convert(op: ConvertOp, value: Value) -> Result<Value, String> {
  use ConvertOp::*;
  Ok(match (op, value) {
    (I2L, Value::Int(n)) => Value::Long(n as i64),
    (L2I, Value::Long(n)) => Value::Int(n as i32),
    (I2F, Value::Int(n)) => Value::Float(n as f32),
    (F2I, Value::Float(f)) => Value::Int(f as i32),
    (I2D, Value::Int(n)) => Value::Double(n as f64),
    (D2I, Value::Double(d)) => Value::Int(d as i32),
    (F2D, Value::Float(f)) => Value::Double(f as f64),
    (D2F, Value::Double(d)) => Value::Float(d as f32),
    _ => return Err(format!("can't convert {:?} with {:?}", value, op)),
  })
}

struct IState<'a> {
  lir: &'a Lir,
  regs: &'a RegisterFile,
  run_stage: RunStage,
  block: BlockIx,
  /// Index of the next op in `block`.
  index: usize,
  vregs: Vec<Option<Value>>,
  rregs: Vec<Option<Value>>,
  slots: Vec<Option<Value>>,
  mem: Vec<Option<Value>>,
  flags: Option<Ordering>,
  next_object: u32,
  num_steps: usize,
  stdout: String,
}

impl<'a> IState<'a> {
  fn new(
    lir: &'a Lir, regs: &'a RegisterFile, args: &[Value], run_stage: RunStage,
  ) -> Self {
    let mut state = IState {
      lir,
      regs,
      run_stage,
      block: BlockIx::new(0),
      index: 0,
      vregs: vec![None; lir.num_virtual_regs as usize],
      rregs: vec![None; regs.num_regs()],
      slots: Vec::new(),
      mem: vec![None; MEMORY_SIZE],
      flags: None,
      next_object: 0,
      num_steps: 0,
      stdout: String::new(),
    };
    let mut slot = 0;
    for &arg in args {
      state.set_slot(StackSlot(slot), arg);
      slot += if arg.kind().is_double_word() { 2 } else { 1 };
    }
    state
  }

  fn slot_width(kind: ValueKind) -> u32 {
    if kind.is_double_word() {
      2
    } else {
      1
    }
  }

  fn get_slot(
    &self, slot: StackSlot, kind: ValueKind,
  ) -> Result<Value, String> {
    let value = match self.slots.get(slot.get() as usize) {
      Some(Some(value)) => *value,
      _ => return Err(format!("read of uninit slot {:?}", slot)),
    };
    for i in 1..Self::slot_width(kind) {
      if self.slots.get((slot.get() + i) as usize) != Some(&Some(value)) {
        return Err(format!("high half of slot {:?} was overwritten", slot));
      }
    }
    Ok(value)
  }

  fn set_slot(&mut self, slot: StackSlot, value: Value) {
    let width = Self::slot_width(value.kind());
    let end = (slot.get() + width) as usize;
    if end > self.slots.len() {
      self.slots.resize(end, None);
    }
    for i in slot.get() as usize..end {
      self.slots[i] = Some(value);
    }
  }

  fn get_real_reg(&self, index: usize) -> Result<Value, String> {
    match self.rregs.get(index) {
      None => Err(format!("invalid register {}", index)),
      Some(None) => Err(format!(
        "read of uninit or clobbered register {} in {:?}",
        self.regs.regs[index].name, self.block
      )),
      Some(Some(value)) => Ok(*value),
    }
  }

  fn get(&self, opr: &Operand) -> Result<Value, String> {
    match *opr {
      Operand::Illegal => Err("read of an illegal operand".to_string()),
      Operand::Constant(c) => Ok(Value::from_constant(c)),
      Operand::Virtual { vreg, .. } => {
        if self.run_stage == RunStage::AfterRegalloc {
          return Err(format!("virtual register {:?} after regalloc", vreg));
        }
        match self.vregs.get(vreg.get_index()) {
          Some(Some(value)) => Ok(*value),
          _ => Err(format!("read of uninit vreg {:?}", vreg)),
        }
      }
      Operand::Register { reg, .. } => self.get_real_reg(reg.get_index()),
      Operand::RegisterPair { lo, hi, .. } => {
        let value = self.get_real_reg(lo.get_index())?;
        if self.get_real_reg(hi.get_index())? != value {
          return Err(format!("register pair {:?} is torn", opr));
        }
        Ok(value)
      }
      Operand::Stack { slot, kind } => self.get_slot(slot, kind),
    }
  }

  fn set(&mut self, opr: &Operand, value: Value) -> Result<(), String> {
    match *opr {
      Operand::Virtual { vreg, .. } => {
        if self.run_stage == RunStage::AfterRegalloc {
          return Err(format!("virtual register {:?} after regalloc", vreg));
        }
        self.vregs[vreg.get_index()] = Some(value);
      }
      Operand::Register { reg, .. } => {
        self.rregs[reg.get_index()] = Some(value)
      }
      Operand::RegisterPair { lo, hi, .. } => {
        self.rregs[lo.get_index()] = Some(value);
        self.rregs[hi.get_index()] = Some(value);
      }
      Operand::Stack { slot, .. } => self.set_slot(slot, value),
      Operand::Illegal | Operand::Constant(_) => {
        return Err(format!("write to {:?}", opr));
      }
    }
    Ok(())
  }

  fn address(&self, addr: &Address) -> Result<usize, String> {
    let part = |opr: &Operand| -> Result<i64, String> {
      if opr.is_illegal() {
        return Ok(0);
      }
      match self.get(opr)? {
        Value::Int(n) => Ok(n as i64),
        Value::Long(n) => Ok(n),
        Value::Object(Some(n)) => {
          Ok((OBJECT_BASE + OBJECT_SIZE * n as usize) as i64)
        }
        Value::Object(None) => Err("null dereference".to_string()),
        other => Err(format!("{:?} used as an address", other)),
      }
    };
    let addr_v = part(&addr.base)? + part(&addr.index)? + addr.disp as i64;
    if addr_v < 0 || addr_v as usize >= MEMORY_SIZE {
      return Err(format!("invalid address {}", addr_v));
    }
    Ok(addr_v as usize)
  }

  fn call(
    &mut self, target: CallTarget, args: &[Value],
  ) -> Result<Value, String> {
    Ok(match target {
      CallTarget::Sum => {
        let mut sum: i32 = 0;
        for arg in args {
          match arg {
            Value::Int(n) => sum = sum.wrapping_add(*n),
            other => return Err(format!("can't sum {:?}", other)),
          }
        }
        Value::Int(sum)
      }
      CallTarget::NewObject => {
        let obj = self.next_object;
        self.next_object += 1;
        Value::Object(Some(obj))
      }
      CallTarget::Identity => match args.first() {
        Some(arg) => *arg,
        None => return Err("identity without an argument".to_string()),
      },
    })
  }

  /// Every reference named by the oop maps of `op` must be in place.
  fn check_oop_maps(&self, op: &LirOp) -> Result<(), String> {
    for info in &op.infos {
      let oop_map = match &info.oop_map {
        Some(oop_map) => oop_map,
        None => continue,
      };
      for loc in &oop_map.locations {
        let value = match *loc {
          Location::Reg(reg) => self.rregs[reg.get_index()],
          Location::Stack(slot) => {
            self.slots.get(slot.get() as usize).copied().flatten()
          }
        };
        match value {
          Some(Value::Object(_)) => {}
          other => {
            return Err(format!(
              "oop map of {:?} names {:?}, which holds {:?}",
              op, loc, other
            ))
          }
        }
      }
    }
    Ok(())
  }

  /// Transfers control to `handler`, running its entry code after
  /// allocation, or binding its phis before.
  fn throw(&mut self, handler: &ExceptionHandler) -> Result<(), String> {
    let lir = self.lir;
    match self.run_stage {
      RunStage::BeforeRegalloc => {
        let phis = &lir.blocks[handler.handler_block].phis;
        let mut values = Vec::with_capacity(phis.len());
        for phi in phis {
          values.push(self.get(&phi.inputs[handler.phi_operand])?);
        }
        for (phi, value) in phis.iter().zip(values) {
          self.set(&phi.operand, value)?;
        }
      }
      RunStage::AfterRegalloc => {
        for op in handler.entry_code.iter().flatten() {
          self.num_steps += 1;
          if let Some((src, dst)) = op.as_move() {
            let value = self.get(&src)?;
            self.set(&dst, value)?;
          }
        }
      }
    }
    self.block = handler.handler_block;
    self.index = 0;
    Ok(())
  }

  /// Moves the interpreter one step forward. Returns the return value once
  /// the function returns.
  fn step(&mut self) -> Result<Option<Option<Value>>, String> {
    let lir = self.lir;
    let block = &lir.blocks[self.block];
    if self.index >= block.ops.len() {
      let next = self.block.plus(1);
      if next.get() >= lir.blocks.len() {
        return Err("fell off the end of the function".to_string());
      }
      self.block = next;
      self.index = 0;
      return Ok(None);
    }

    let op = &block.ops[self.index];
    self.index += 1;
    self.num_steps += 1;

    if self.run_stage == RunStage::AfterRegalloc {
      self.check_oop_maps(op)?;
    }

    match &op.kind {
      LirOpKind::Label | LirOpKind::Safepoint => {}
      LirOpKind::Move { src, dst } => {
        let value = self.get(src)?;
        self.set(dst, value)?;
      }
      LirOpKind::Load { addr, dst, .. } => {
        let addr_v = self.address(addr)?;
        let value = match self.mem[addr_v] {
          Some(value) => value,
          None => return Err(format!("read of uninit mem at addr {}", addr_v)),
        };
        self.set(dst, value)?;
      }
      LirOpKind::Store { src, addr, .. } => {
        let value = self.get(src)?;
        let addr_v = self.address(addr)?;
        self.mem[addr_v] = Some(value);
      }
      LirOpKind::Convert { op: conv, src, dst } => {
        let value = convert(*conv, self.get(src)?)?;
        self.set(dst, value)?;
      }
      LirOpKind::Op2 { op: ArithOp::Cmp, left, right, .. } => {
        self.flags = Some(compare(self.get(left)?, self.get(right)?)?);
      }
      LirOpKind::Op2 { op: arith_op, left, right, result } => {
        match arith(*arith_op, self.get(left)?, self.get(right)?)? {
          Some(value) => self.set(result, value)?,
          None => {
            let handler = op
              .infos
              .iter()
              .flat_map(|info| info.exception_handlers.iter())
              .next();
            match handler {
              Some(handler) => self.throw(handler)?,
              None => return Err("division by zero".to_string()),
            }
          }
        }
      }
      LirOpKind::Cmove { cond, left, right, result } => {
        let flags =
          self.flags.ok_or_else(|| "cmove without flags".to_string())?;
        let value = if holds(*cond, flags) {
          self.get(left)?
        } else {
          self.get(right)?
        };
        self.set(result, value)?;
      }
      LirOpKind::Branch { cond, target } => {
        let taken = match cond {
          Condition::Always => true,
          _ => {
            let flags =
              self.flags.ok_or_else(|| "branch without flags".to_string())?;
            holds(*cond, flags)
          }
        };
        if taken {
          self.block = *target;
          self.index = 0;
        }
      }
      LirOpKind::Call { target, args, result } => {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
          values.push(self.get(arg)?);
        }
        let value = self.call(*target, &values)?;
        for reg in self.regs.caller_saved() {
          self.rregs[reg.get_index()] = None;
        }
        self.flags = None;
        if !result.is_illegal() {
          self.set(result, value)?;
        }
      }
      LirOpKind::Print { value } => {
        let value = self.get(value)?;
        self.stdout.push_str(&format!("{:?}\n", value));
      }
      LirOpKind::Return { value } => {
        let ret =
          if value.is_illegal() { None } else { Some(self.get(value)?) };
        return Ok(Some(ret));
      }
    }
    Ok(None)
  }
}

/// Runs `lir` with the given incoming arguments.
pub fn run_lir(
  lir: &Lir, args: &[Value], regs: &RegisterFile, run_stage: RunStage,
) -> Result<RunResult, String> {
  let mut istate = IState::new(lir, regs, args, run_stage);
  loop {
    if istate.num_steps > MAX_STEPS {
      return Err("too many steps".to_string());
    }
    if let Some(ret_value) = istate.step()? {
      return Ok(RunResult {
        ret_value,
        stdout: istate.stdout,
        num_steps: istate.num_steps,
      });
    }
  }
}

pub fn run_func(
  f: &Func, who: &str, regs: &RegisterFile, run_stage: RunStage,
) -> Result<RunResult, String> {
  println!();
  println!("Running stage '{}': Func: name='{}'", who, f.lir.name);
  let result = run_lir(&f.lir, &f.args, regs, run_stage);
  match &result {
    Ok(res) => println!(
      "Running stage '{}': done. {} steps, returned {:?}",
      who, res.num_steps, res.ret_value
    ),
    Err(err) => println!("Running stage '{}': failed: {}", who, err),
  }
  result
}
