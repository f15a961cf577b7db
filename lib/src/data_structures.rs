/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Registers, operands, stack slots and the register file description.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::slice::{Iter, IterMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.)

#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  #[cfg_attr(feature = "enable-serde", serde(skip))]
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty> {
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) {
    self.vek.push(item);
  }
  pub fn as_slice(&self) -> &[Ty] {
    &self.vek
  }
}

impl<TyIx, Ty: Clone> TypedIxVec<TyIx, Ty> {
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
}

impl<TyIx, Ty> Default for TypedIxVec<TyIx, Ty> {
  fn default() -> Self {
    Self::new()
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty: Clone> Clone for TypedIxVec<TyIx, Ty> {
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct $TypeIx(u32);

    impl $TypeIx {
      pub fn new(n: u32) -> Self {
        $TypeIx(n)
      }
      pub fn get(self) -> u32 {
        self.0
      }
      pub fn get_usize(self) -> usize {
        self.0 as usize
      }
      pub fn plus(self, delta: u32) -> Self {
        $TypeIx(self.0 + delta)
      }
      pub fn minus(self, delta: u32) -> Self {
        $TypeIx(self.0 - delta)
      }
      pub fn dotdot(&self, last_plus1: $TypeIx) -> impl Iterator<Item = Self> {
        (self.0..last_plus1.0).map($TypeIx)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, self.0)
      }
    }
    impl Into<u32> for $TypeIx {
      fn into(self) -> u32 {
        self.0
      }
    }
  };
}

generate_boilerplate!(BlockIx, "B");

//=============================================================================
// Register classes, registers and value kinds.

pub const NUM_REG_CLASSES: usize = 2;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegClass {
  /// General purpose integer and pointer registers.
  Cpu = 0,
  /// Floating point (flat SSE-style) registers.
  Fpu = 1,
}

impl RegClass {
  pub fn short_name(self) -> &'static str {
    match self {
      RegClass::Cpu => "C",
      RegClass::Fpu => "F",
    }
  }
}

/// A physical register, denoted by its dense index in the `RegisterFile`.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RealReg(pub u8);

impl RealReg {
  pub fn get_index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for RealReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "r{}", self.0)
  }
}

/// A virtual register. Interval number `num_regs + index`.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VirtualReg(pub u32);

impl VirtualReg {
  pub fn get_index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for VirtualReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "v{}", self.0)
  }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ValueKind {
  Int,
  Long,
  Float,
  Double,
  /// An object reference, tracked by oop maps.
  Object,
  /// A machine word that is not a reference.
  Word,
  Illegal,
}

impl ValueKind {
  pub fn is_float(self) -> bool {
    match self {
      ValueKind::Float | ValueKind::Double => true,
      _ => false,
    }
  }

  pub fn reg_class(self) -> RegClass {
    if self.is_float() {
      RegClass::Fpu
    } else {
      RegClass::Cpu
    }
  }

  /// Values that occupy two slots of a frame state.
  pub fn is_double_word(self) -> bool {
    match self {
      ValueKind::Long | ValueKind::Double => true,
      _ => false,
    }
  }

  fn suffix(self) -> &'static str {
    match self {
      ValueKind::Int => "i",
      ValueKind::Long => "j",
      ValueKind::Float => "f",
      ValueKind::Double => "d",
      ValueKind::Object => "a",
      ValueKind::Word => "w",
      ValueKind::Illegal => "?",
    }
  }
}

/// A frame slot. Incoming arguments come first, then spill slots.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct StackSlot(pub u32);

impl StackSlot {
  pub fn get(self) -> u32 {
    self.0
  }
  pub fn plus(self, delta: u32) -> Self {
    StackSlot(self.0 + delta)
  }
}

impl fmt::Debug for StackSlot {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "s{}", self.0)
  }
}

/// Constants keep floating point values as raw bits, so that operands can be
/// compared and hashed.
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Constant {
  Int(i32),
  Long(i64),
  Float(u32),
  Double(u64),
  /// `None` is the null reference.
  Object(Option<u32>),
}

impl Constant {
  pub fn float(f: f32) -> Self {
    Constant::Float(f.to_bits())
  }
  pub fn double(d: f64) -> Self {
    Constant::Double(d.to_bits())
  }
  pub fn kind(self) -> ValueKind {
    match self {
      Constant::Int(_) => ValueKind::Int,
      Constant::Long(_) => ValueKind::Long,
      Constant::Float(_) => ValueKind::Float,
      Constant::Double(_) => ValueKind::Double,
      Constant::Object(_) => ValueKind::Object,
    }
  }
}

impl fmt::Debug for Constant {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Constant::Int(n) => write!(fmt, "#{}", n),
      Constant::Long(n) => write!(fmt, "#{}L", n),
      Constant::Float(bits) => write!(fmt, "#{}f", f32::from_bits(*bits)),
      Constant::Double(bits) => write!(fmt, "#{}d", f64::from_bits(*bits)),
      Constant::Object(None) => write!(fmt, "#null"),
      Constant::Object(Some(n)) => write!(fmt, "#obj{}", n),
    }
  }
}

//=============================================================================
// Operands

#[derive(Copy, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Operand {
  Illegal,
  Virtual { vreg: VirtualReg, kind: ValueKind },
  Register { reg: RealReg, kind: ValueKind },
  /// A two-register value (longs on 32-bit targets, paired doubles).
  RegisterPair { lo: RealReg, hi: RealReg, kind: ValueKind },
  Stack { slot: StackSlot, kind: ValueKind },
  Constant(Constant),
}

impl Operand {
  pub fn virt(index: u32, kind: ValueKind) -> Self {
    Operand::Virtual { vreg: VirtualReg(index), kind }
  }

  pub fn reg(reg: RealReg, kind: ValueKind) -> Self {
    Operand::Register { reg, kind }
  }

  pub fn stack(slot: u32, kind: ValueKind) -> Self {
    Operand::Stack { slot: StackSlot(slot), kind }
  }

  pub fn kind(&self) -> ValueKind {
    match *self {
      Operand::Illegal => ValueKind::Illegal,
      Operand::Virtual { kind, .. }
      | Operand::Register { kind, .. }
      | Operand::RegisterPair { kind, .. }
      | Operand::Stack { kind, .. } => kind,
      Operand::Constant(c) => c.kind(),
    }
  }

  pub fn vreg(&self) -> Option<VirtualReg> {
    match *self {
      Operand::Virtual { vreg, .. } => Some(vreg),
      _ => None,
    }
  }

  pub fn is_illegal(&self) -> bool {
    *self == Operand::Illegal
  }

  pub fn is_virtual(&self) -> bool {
    self.vreg().is_some()
  }

  pub fn is_constant(&self) -> bool {
    match self {
      Operand::Constant(_) => true,
      _ => false,
    }
  }

  pub fn is_stack(&self) -> bool {
    match self {
      Operand::Stack { .. } => true,
      _ => false,
    }
  }

  /// Both physical registers and virtual registers count as registers.
  pub fn is_register(&self) -> bool {
    match self {
      Operand::Virtual { .. }
      | Operand::Register { .. }
      | Operand::RegisterPair { .. } => true,
      _ => false,
    }
  }

  /// The physical registers named by this operand, low half first.
  pub fn real_regs(&self) -> (Option<RealReg>, Option<RealReg>) {
    match *self {
      Operand::Register { reg, .. } => (Some(reg), None),
      Operand::RegisterPair { lo, hi, .. } => (Some(lo), Some(hi)),
      _ => (None, None),
    }
  }
}

impl fmt::Debug for Operand {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Operand::Illegal => write!(fmt, "-"),
      Operand::Virtual { vreg, kind } => {
        write!(fmt, "{:?}{}", vreg, kind.suffix())
      }
      Operand::Register { reg, kind } => {
        write!(fmt, "{:?}{}", reg, kind.suffix())
      }
      Operand::RegisterPair { lo, hi, kind } => {
        write!(fmt, "{:?}:{:?}{}", lo, hi, kind.suffix())
      }
      Operand::Stack { slot, kind } => {
        write!(fmt, "{:?}{}", slot, kind.suffix())
      }
      Operand::Constant(c) => write!(fmt, "{:?}", c),
    }
  }
}

/// A memory address `[base + index + disp]`. `index` is `Operand::Illegal`
/// when absent.
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Address {
  pub base: Operand,
  pub index: Operand,
  pub disp: i32,
}

impl Address {
  pub fn new(base: Operand, disp: i32) -> Self {
    Self { base, index: Operand::Illegal, disp }
  }
}

impl fmt::Debug for Address {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.index.is_illegal() {
      write!(fmt, "[{:?} + {}]", self.base, self.disp)
    } else {
      write!(fmt, "[{:?} + {:?} + {}]", self.base, self.index, self.disp)
    }
  }
}

//=============================================================================
// Register file description.

/// Target switches that change how many registers or slots a value needs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TargetConfig {
  /// Longs fit in one register and words/objects need two 32-bit slots.
  pub is_64bit: bool,
  /// Doubles live in two adjacent FPU registers.
  pub double_needs_pair: bool,
}

#[derive(Clone, Debug)]
pub struct RegInfo {
  pub name: String,
  pub class: RegClass,
  pub caller_saved: bool,
}

/// Inclusive range of register indices of one class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegClassInfo {
  pub first: usize,
  pub last: usize,
}

#[derive(Clone, Debug)]
pub struct RegisterFile {
  /// The registers themselves. The index of an entry is its `RealReg`.
  pub regs: Vec<RegInfo>,

  // Registers of one class must be contiguous in `regs`, so that a class can
  // be addressed as one inclusive range.
  pub allocable_by_class: [Option<RegClassInfo>; NUM_REG_CLASSES],

  pub target: TargetConfig,
}

impl RegisterFile {
  /// Builds a register file. Registers of the same class must be adjacent.
  pub fn new(regs: Vec<RegInfo>, target: TargetConfig) -> Self {
    debug_assert!(regs.len() <= u8::max_value() as usize);
    let mut allocable_by_class = [None; NUM_REG_CLASSES];
    for (i, info) in regs.iter().enumerate() {
      let entry: &mut Option<RegClassInfo> =
        &mut allocable_by_class[info.class as usize];
      match entry {
        None => *entry = Some(RegClassInfo { first: i, last: i }),
        Some(range) => {
          debug_assert!(
            range.last + 1 == i,
            "register classes must be contiguous"
          );
          range.last = i;
        }
      }
    }
    Self { regs, allocable_by_class, target }
  }

  pub fn num_regs(&self) -> usize {
    self.regs.len()
  }

  pub fn class_of(&self, reg: RealReg) -> RegClass {
    self.regs[reg.get_index()].class
  }

  pub fn name(&self, reg: RealReg) -> &str {
    &self.regs[reg.get_index()].name
  }

  pub fn regs_of_class(&self, rc: RegClass) -> impl Iterator<Item = RealReg> {
    let range = match self.allocable_by_class[rc as usize] {
      Some(info) => info.first..info.last + 1,
      None => 0..0,
    };
    range.map(|i| RealReg(i as u8))
  }

  pub fn caller_saved(&self) -> impl Iterator<Item = RealReg> + '_ {
    self
      .regs
      .iter()
      .enumerate()
      .filter(|(_, info)| info.caller_saved)
      .map(|(i, _)| RealReg(i as u8))
  }

  /// Number of physical registers a value of the given kind occupies.
  pub fn num_physical_regs(&self, kind: ValueKind) -> usize {
    match kind {
      ValueKind::Long if !self.target.is_64bit => 2,
      ValueKind::Double if self.target.double_needs_pair => 2,
      _ => 1,
    }
  }

  /// Number of stack slots a value of the given kind occupies.
  pub fn num_spill_slots(&self, kind: ValueKind) -> u32 {
    match kind {
      ValueKind::Long | ValueKind::Double => 2,
      ValueKind::Object | ValueKind::Word if self.target.is_64bit => 2,
      _ => 1,
    }
  }
}
