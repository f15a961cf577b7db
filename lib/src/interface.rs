/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the allocator library.

use std::fmt;

pub use crate::analysis::AnalysisError;
pub use crate::checker::{CheckerError, CheckerErrors, CheckerValue};
pub use crate::data_structures::{
  Address, BlockIx, Constant, Operand, RealReg, RegClass, RegClassInfo,
  RegInfo, RegisterFile, StackSlot, TargetConfig, TypedIxVec, ValueKind,
  VirtualReg, NUM_REG_CLASSES,
};
pub use crate::lir::*;

//=============================================================================
// Frame layout collaborator.

/// The frame layout finalizer. Stack slots `0..argument_slots()` hold the
/// incoming arguments; spill slots are numbered after them.
pub trait FrameMap {
  /// Number of stack slots occupied by incoming arguments.
  fn argument_slots(&self) -> u32;

  /// Fixes the number of spill slots. Returns false when the resulting frame
  /// is too large.
  fn finalize_frame(&mut self, spill_slots: u32) -> bool;

  /// Total frame size in slots, once finalized.
  fn frame_size(&self) -> u32;

  /// Slot holding the object locked by the monitor with the given index.
  fn monitor_object_slot(&self, monitor_index: usize) -> StackSlot;

  /// Slot holding the lock record of the monitor with the given index.
  fn monitor_lock_slot(&self, monitor_index: usize) -> StackSlot;
}

/// A frame made of the argument area, then the spill area, then two slots
/// per monitor.
#[derive(Clone, Debug)]
pub struct SimpleFrameMap {
  pub argument_slots: u32,
  pub max_monitors: u32,
  pub max_frame_size: u32,
  spill_slots: Option<u32>,
}

impl SimpleFrameMap {
  pub fn new(argument_slots: u32, max_monitors: u32) -> Self {
    Self {
      argument_slots,
      max_monitors,
      max_frame_size: DEFAULT_MAX_FRAME_SIZE,
      spill_slots: None,
    }
  }

  pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
    self.max_frame_size = max_frame_size;
    self
  }

  pub fn spill_slots(&self) -> Option<u32> {
    self.spill_slots
  }

  fn monitor_base(&self) -> u32 {
    self.argument_slots + self.spill_slots.unwrap_or(0)
  }
}

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4096;

impl FrameMap for SimpleFrameMap {
  fn argument_slots(&self) -> u32 {
    self.argument_slots
  }

  fn finalize_frame(&mut self, spill_slots: u32) -> bool {
    debug_assert!(self.spill_slots.is_none(), "frame finalized twice");
    self.spill_slots = Some(spill_slots);
    self.frame_size() <= self.max_frame_size
  }

  fn frame_size(&self) -> u32 {
    self.monitor_base() + 2 * self.max_monitors
  }

  fn monitor_object_slot(&self, monitor_index: usize) -> StackSlot {
    debug_assert!((monitor_index as u32) < self.max_monitors);
    StackSlot(self.monitor_base() + 2 * monitor_index as u32)
  }

  fn monitor_lock_slot(&self, monitor_index: usize) -> StackSlot {
    self.monitor_object_slot(monitor_index).plus(1)
  }
}

//=============================================================================
// Options, results and errors.

#[derive(Clone, Copy, Debug)]
pub struct Options {
  /// Checks the allocated intervals for consistency before rewriting the LIR.
  pub run_verifier: bool,
  /// Symbolically checks that every input operand of the rewritten LIR holds
  /// the value of its virtual register.
  pub run_checker: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self { run_verifier: cfg!(debug_assertions), run_checker: false }
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegAllocResult {
  /// Number of spill slots used, as passed to `FrameMap::finalize_frame`.
  pub num_spill_slots: u32,
  /// Number of intervals, including fixed intervals and split children.
  pub num_intervals: usize,
  pub num_split_children: usize,
  /// Moves inserted by the walker and the data-flow resolution.
  pub num_inserted_moves: usize,
}

#[derive(Clone, Debug)]
pub enum RegAllocError {
  /// Allocation of this method cannot complete; the caller should drop the
  /// compilation.
  Bailout(String),
  /// The input LIR is malformed.
  Analysis(AnalysisError),
  /// The allocated intervals are inconsistent.
  Verifier(String),
  /// The rewritten LIR does not preserve the dataflow of the input.
  RegChecker(CheckerErrors),
}

impl RegAllocError {
  pub fn bailout(msg: &str) -> Self {
    RegAllocError::Bailout(msg.to_string())
  }

  pub fn is_bailout(&self) -> bool {
    match self {
      RegAllocError::Bailout(_) => true,
      _ => false,
    }
  }
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::Bailout(msg) => write!(f, "bailout: {}", msg),
      RegAllocError::Analysis(err) => write!(f, "analysis error: {}", err),
      RegAllocError::Verifier(msg) => write!(f, "verifier error: {}", msg),
      RegAllocError::RegChecker(errors) => {
        write!(f, "checker error: {} problem(s)", errors.errors.len())?;
        for err in &errors.errors {
          write!(f, "\n  {}", err)?;
        }
        Ok(())
      }
    }
  }
}

impl std::error::Error for RegAllocError {}

//=============================================================================
// Top level entry point.

/// Allocates registers for `lir` in place. Every virtual operand is replaced
/// by a register or stack operand, moves are inserted where intervals were
/// split, and oop maps and debug info are attached to every op with an info.
///
/// On error, `lir` is left in an unspecified state and must be discarded.
#[inline(never)]
pub fn allocate_registers(
  lir: &mut Lir, regs: &RegisterFile, frame_map: &mut dyn FrameMap,
  options: Options,
) -> Result<RegAllocResult, RegAllocError> {
  crate::linear_scan::run(lir, regs, frame_map, options)
}
