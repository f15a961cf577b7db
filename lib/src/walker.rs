/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The interval walker of one register class.
//!
//! Intervals are visited in order of their start position. At each start
//! position the active intervals (covering the position) and the inactive
//! ones (started, but in a lifetime hole) are updated, and the new interval
//! gets a register:
//!
//! - if a register is free for the whole interval, or at least until its
//!   first use, it is taken, and the interval is split where the register
//!   stops being free;
//! - otherwise the register whose next use by another interval is farthest
//!   away is taken from those intervals, which are split and spilled; if that
//!   use is before the first use of the new interval, the new interval is
//!   spilled instead.
//!
//! Split positions are moved out of loops and to block boundaries when
//! possible. Moves between split children inside a block are inserted here;
//! moves on control-flow edges are added later by the data-flow resolution.

use log::{debug, log_enabled, trace, Level};
use std::ops::Range;

use crate::data_structures::*;
use crate::interface::RegAllocError;
use crate::interval::{IntId, IntervalLocation, UseKind, MAX_POS};
use crate::linear_scan::{bailout, LinearScan};
use crate::move_resolver::{InsertTarget, MoveResolver};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Binding {
  /// Intervals of physical registers.
  Fixed,
  /// Intervals of virtual registers and their split children.
  Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
  Active,
  Inactive,
}

#[derive(Default)]
struct IntervalLists {
  fixed: Vec<IntId>,
  any: Vec<IntId>,
}

impl IntervalLists {
  fn get_mut(&mut self, binding: Binding) -> &mut Vec<IntId> {
    match binding {
      Binding::Fixed => &mut self.fixed,
      Binding::Any => &mut self.any,
    }
  }
}

pub(crate) struct Walker<'a, 'b> {
  ls: &'b mut LinearScan<'a>,
  rc: RegClass,
  class_regs: Range<usize>,

  // Per-register scratch state of the allocation decisions, indexed by
  // register number.
  use_pos: Vec<i32>,
  block_pos: Vec<i32>,
  spill_intervals: Vec<Vec<IntId>>,

  move_resolver: MoveResolver,

  /// Sorted by descending start position, so the next interval is the last.
  unhandled: IntervalLists,
  active: IntervalLists,
  inactive: IntervalLists,

  current: Option<IntId>,
  current_binding: Binding,
  current_position: i32,
}

impl<'a, 'b> Walker<'a, 'b> {
  /// `fixed` and `any` must be sorted by start position.
  pub(crate) fn new(
    ls: &'b mut LinearScan<'a>, rc: RegClass, mut fixed: Vec<IntId>,
    mut any: Vec<IntId>,
  ) -> Self {
    let class_regs = match ls.regs.allocable_by_class[rc as usize] {
      Some(info) => info.first..info.last + 1,
      None => 0..0,
    };
    let num_regs = ls.num_regs;
    fixed.reverse();
    any.reverse();
    let mut walker = Self {
      ls,
      rc,
      class_regs,
      use_pos: vec![MAX_POS; num_regs],
      block_pos: vec![MAX_POS; num_regs],
      spill_intervals: vec![Vec::new(); num_regs],
      move_resolver: MoveResolver::new(num_regs),
      unhandled: IntervalLists { fixed, any },
      active: IntervalLists::default(),
      inactive: IntervalLists::default(),
      current: None,
      current_binding: Binding::Any,
      current_position: -1,
    };
    walker.next_interval();
    walker
  }

  //===========================================================================
  // The walk

  fn next_interval(&mut self) {
    let intervals = &self.ls.intervals;
    let from = |id: &IntId| intervals.get(*id).from();
    let fixed_from = self.unhandled.fixed.last().map(from);
    let any_from = self.unhandled.any.last().map(from);
    // Intervals may start at the same position: prefer the fixed one.
    let binding = match (fixed_from, any_from) {
      (Some(fixed), Some(any)) if fixed <= any => Binding::Fixed,
      (Some(_), None) => Binding::Fixed,
      (_, Some(_)) => Binding::Any,
      (None, None) => {
        self.current = None;
        return;
      }
    };
    self.current = self.unhandled.get_mut(binding).pop();
    self.current_binding = binding;
    if let Some(id) = self.current {
      self.ls.intervals.get_mut(id).rewind_range();
    }
  }

  /// Moves the intervals of one state list whose current range changed
  /// because the walk reached `pos`.
  fn walk_to_state(&mut self, state: State, pos: i32) {
    for &binding in &[Binding::Fixed, Binding::Any] {
      let list = match state {
        State::Active => self.active.get_mut(binding),
        State::Inactive => self.inactive.get_mut(binding),
      };
      let ids = std::mem::take(list);
      let mut kept = Vec::with_capacity(ids.len());
      let mut to_active = Vec::new();
      let mut to_inactive = Vec::new();

      for id in ids {
        let interval = self.ls.intervals.get_mut(id);
        let mut changed = false;
        while interval.current_to() <= pos {
          interval.next_range();
          changed = true;
        }
        changed |= state == State::Inactive && interval.current_from() <= pos;

        if !changed {
          kept.push(id);
        } else if interval.current_at_end() {
          trace!("  {:?} {:?} -> handled", id, state);
        } else if interval.current_from() <= pos {
          trace!("  {:?} {:?} -> active", id, state);
          to_active.push(id);
        } else {
          trace!("  {:?} {:?} -> inactive", id, state);
          to_inactive.push(id);
        }
      }

      match state {
        State::Active => *self.active.get_mut(binding) = kept,
        State::Inactive => *self.inactive.get_mut(binding) = kept,
      }
      self.active.get_mut(binding).extend(to_active);
      self.inactive.get_mut(binding).extend(to_inactive);
    }
  }

  fn walk_to(&mut self, to_from: i32) -> Result<(), RegAllocError> {
    while let Some(cur) = self.current {
      let cur_from = self.ls.intervals.get(cur).from();
      let is_active = cur_from <= to_from;
      let pos = if is_active { cur_from } else { to_from };
      self.current_position = pos;

      self.walk_to_state(State::Active, pos);
      self.walk_to_state(State::Inactive, pos);

      if !is_active {
        return Ok(());
      }

      let binding = self.current_binding;
      if log_enabled!(Level::Trace) {
        trace!("{:?} @ {}: {}", self.rc, pos, self.ls.intervals.display(cur));
      }
      if self.activate_current(cur, binding)? {
        self.active.get_mut(binding).push(cur);
      }
      self.next_interval();
    }
    Ok(())
  }

  pub(crate) fn walk(&mut self) -> Result<(), RegAllocError> {
    self.walk_to(MAX_POS)
  }

  /// Resolves and inserts the moves collected during the walk.
  pub(crate) fn finish_allocation(&mut self) -> Result<(), RegAllocError> {
    self.move_resolver.resolve_and_append_moves(self.ls)
  }

  /// Returns whether `cur` ends up in a register.
  fn activate_current(
    &mut self, cur: IntId, binding: Binding,
  ) -> Result<bool, RegAllocError> {
    let mut result = true;

    if binding == Binding::Any {
      let location = self.ls.intervals.get(cur).location;
      if let IntervalLocation::Stack(_) = location {
        // A method argument: it gets a register at its first use.
        debug!("{:?} starts on the stack", cur);
        self.split_stack_interval(cur);
        result = false;
      } else if self.must_start_in_memory(cur) {
        debug!("{:?} must start in memory", cur);
        self.ls.assign_spill_slot(cur)?;
        self.split_stack_interval(cur);
        result = false;
      } else if location.is_none() {
        if self.no_allocation_possible(cur) || !self.alloc_free_reg(cur) {
          self.alloc_locked_reg(cur)?;
        }
        if self.ls.intervals.get(cur).location.reg().is_none() {
          result = false;
        }
      }
    }

    // Reload the value of a split child that becomes active.
    if self.ls.intervals.get(cur).insert_move_when_activated {
      debug_assert!(self.ls.intervals.is_split_child(cur));
      if let Some(src) = self.ls.intervals.current_split_child(cur) {
        debug_assert!(src != cur, "cannot insert move between same interval");
        let from = self.ls.intervals.get(cur).from();
        self.insert_move(from, src, cur)?;
      }
    }
    self.ls.intervals.make_current_split_child(cur);
    Ok(result)
  }

  fn must_start_in_memory(&self, id: IntId) -> bool {
    let reg_num = self.ls.intervals.get(id).reg_num;
    let num_regs = self.ls.num_regs;
    reg_num >= num_regs
      && reg_num < num_regs + self.ls.num_virtual_regs
      && self
        .ls
        .lir
        .must_start_in_memory
        .contains(&VirtualReg((reg_num - num_regs) as u32))
  }

  /// A split child starting just before a call that destroys every register
  /// of the class can never get one.
  fn no_allocation_possible(&self, cur: IntId) -> bool {
    let interval = self.ls.intervals.get(cur);
    let pos = interval.from();
    pos & 1 == 1
      && pos < self.ls.max_op_id
      && self.ls.has_call(pos + 1)
      && interval.to() > pos + 1
      && self.class_regs.clone().all(|r| self.ls.regs.regs[r].caller_saved)
  }

  //===========================================================================
  // Register usage bookkeeping

  fn init_use_lists(&mut self, only_process_use_pos: bool) {
    for reg in self.class_regs.clone() {
      self.use_pos[reg] = MAX_POS;
      if !only_process_use_pos {
        self.block_pos[reg] = MAX_POS;
        self.spill_intervals[reg].clear();
      }
    }
  }

  fn set_use_pos(&mut self, id: IntId, pos: i32, only_process_use_pos: bool) {
    let location = self.ls.intervals.get(id).location;
    for reg in location.reg().into_iter().chain(location.hi()) {
      let reg = reg.get_index();
      if self.class_regs.contains(&reg) {
        if self.use_pos[reg] > pos {
          self.use_pos[reg] = pos;
        }
        if !only_process_use_pos {
          self.spill_intervals[reg].push(id);
        }
      }
    }
  }

  fn set_block_pos(&mut self, id: IntId, pos: i32) {
    let location = self.ls.intervals.get(id).location;
    for reg in location.reg().into_iter().chain(location.hi()) {
      let reg = reg.get_index();
      if self.class_regs.contains(&reg) {
        if self.block_pos[reg] > pos {
          self.block_pos[reg] = pos;
        }
        if self.use_pos[reg] > pos {
          self.use_pos[reg] = pos;
        }
      }
    }
  }

  fn intersection(&self, id: IntId, cur: IntId) -> Option<i32> {
    let intervals = &self.ls.intervals;
    intervals.get(id).current_intersects_at(intervals.get(cur))
  }

  //===========================================================================
  // Allocation without spilling

  fn prefer(
    &self, best: Option<usize>, reg: usize, hint: Option<usize>,
  ) -> bool {
    match best {
      None => true,
      Some(best) => {
        Some(reg) == hint
          || (self.use_pos[reg] > self.use_pos[best] && Some(best) != hint)
      }
    }
  }

  /// A register free until `interval_to` is preferred over one free only
  /// past `reg_needed_until`; the latter requires a split. Among candidates
  /// the hint wins, then the register free the longest.
  fn find_free_reg(
    &self, reg_needed_until: i32, interval_to: i32, hint: Option<RealReg>,
    ignore: Option<usize>, need_split: &mut bool,
  ) -> Option<usize> {
    let hint = hint.map(|r| r.get_index());
    let mut full = None;
    let mut partial = None;
    for reg in self.class_regs.clone() {
      if Some(reg) == ignore {
        continue;
      }
      if self.use_pos[reg] >= interval_to {
        if self.prefer(full, reg, hint) {
          full = Some(reg);
        }
      } else if self.use_pos[reg] > reg_needed_until {
        if self.prefer(partial, reg, hint) {
          partial = Some(reg);
        }
      }
    }
    if full.is_some() {
      full
    } else {
      *need_split |= partial.is_some();
      partial
    }
  }

  fn alloc_free_reg(&mut self, cur: IntId) -> bool {
    self.init_use_lists(true);
    for i in 0..self.active.fixed.len() {
      let id = self.active.fixed[i];
      self.set_use_pos(id, 0, true);
    }
    for i in 0..self.active.any.len() {
      let id = self.active.any[i];
      self.set_use_pos(id, 0, true);
    }
    for i in 0..self.inactive.fixed.len() {
      let id = self.inactive.fixed[i];
      let current_from = self.ls.intervals.get(id).current_from();
      let pos = if self.ls.intervals.get(cur).to() <= current_from {
        Some(current_from)
      } else {
        self.intersection(id, cur)
      };
      if let Some(pos) = pos {
        self.set_use_pos(id, pos, true);
      }
    }
    for i in 0..self.inactive.any.len() {
      let id = self.inactive.any[i];
      if let Some(pos) = self.intersection(id, cur) {
        self.set_use_pos(id, pos, true);
      }
    }

    let (from, to, kind) = {
      let interval = self.ls.intervals.get(cur);
      (interval.from(), interval.to(), interval.kind)
    };
    let hint = self
      .ls
      .intervals
      .register_hint(cur, true)
      .map(|hint| self.ls.intervals.get(hint).location);
    let hint_reg = hint.and_then(|l| l.reg());
    let hint_hi = hint.and_then(|l| l.hi());

    // The register must be free at least until this position.
    let reg_needed_until = from + 1;
    let mut need_split = false;
    let reg = match self.find_free_reg(
      reg_needed_until,
      to,
      hint_reg,
      None,
      &mut need_split,
    ) {
      Some(reg) => reg,
      None => return false,
    };
    let mut hi = None;
    if self.ls.regs.num_physical_regs(kind) == 2 {
      hi = self.find_free_reg(
        reg_needed_until,
        to,
        hint_hi,
        Some(reg),
        &mut need_split,
      );
      if hi.is_none() {
        return false;
      }
    }

    let mut split_pos = self.use_pos[reg];
    if let Some(hi) = hi {
      split_pos = split_pos.min(self.use_pos[hi]);
    }
    self.assign_reg(cur, reg, hi);
    if need_split {
      self.split_when_partial_register_available(cur, split_pos);
    }
    true
  }

  fn assign_reg(&mut self, cur: IntId, reg: usize, hi: Option<usize>) {
    // Sorted, so that a pair never swaps its halves in a move.
    let (reg, hi) = match hi {
      Some(hi) if hi < reg => (hi, Some(reg)),
      _ => (reg, hi),
    };
    let location =
      IntervalLocation::Reg(RealReg(reg as u8), hi.map(|h| RealReg(h as u8)));
    debug!("assign {:?} to {}", cur, location);
    self.ls.intervals.get_mut(cur).location = location;
  }

  //===========================================================================
  // Allocation with spilling

  fn find_locked_reg(
    &self, reg_needed_until: i32, interval_to: i32, ignore: Option<usize>,
    need_split: &mut bool,
  ) -> Option<usize> {
    let mut max_reg: Option<usize> = None;
    for reg in self.class_regs.clone() {
      if Some(reg) == ignore {
        continue;
      }
      if self.use_pos[reg] > reg_needed_until
        && max_reg.map_or(true, |max| self.use_pos[reg] > self.use_pos[max])
      {
        max_reg = Some(reg);
      }
    }
    if let Some(reg) = max_reg {
      if self.block_pos[reg] <= interval_to {
        *need_split = true;
      }
    }
    max_reg
  }

  fn spill_use_pos(&self, id: IntId) -> i32 {
    let interval = self.ls.intervals.get(id);
    interval
      .next_usage(UseKind::LoopEndMarker, self.current_position)
      .min(interval.to())
  }

  fn alloc_locked_reg(&mut self, cur: IntId) -> Result<(), RegAllocError> {
    self.init_use_lists(false);
    for i in 0..self.active.fixed.len() {
      let id = self.active.fixed[i];
      self.set_use_pos(id, 0, true);
    }
    for i in 0..self.inactive.fixed.len() {
      let id = self.inactive.fixed[i];
      let intervals = &self.ls.intervals;
      if intervals.get(cur).to() > intervals.get(id).current_from() {
        if let Some(pos) = self.intersection(id, cur) {
          self.set_block_pos(id, pos);
        }
      }
    }
    for i in 0..self.active.any.len() {
      let id = self.active.any[i];
      let pos = self.spill_use_pos(id);
      self.set_use_pos(id, pos, false);
    }
    for i in 0..self.inactive.any.len() {
      let id = self.inactive.any[i];
      if self.intersection(id, cur).is_some() {
        let pos = self.spill_use_pos(id);
        self.set_use_pos(id, pos, false);
      }
    }

    let (from, to, kind, first_usage, ignore) = {
      let interval = self.ls.intervals.get(cur);
      (
        interval.from(),
        interval.to(),
        interval.kind,
        interval.first_usage(UseKind::MustHaveRegister),
        interval.location.reg().map(|r| r.get_index()),
      )
    };
    let reg_needed_until = first_usage.min(from + 1);
    let pair = self.ls.regs.num_physical_regs(kind) == 2;

    let mut need_split = false;
    let reg =
      self.find_locked_reg(reg_needed_until, to, ignore, &mut need_split);
    let hi = match reg {
      Some(reg) if pair => {
        self.find_locked_reg(reg_needed_until, to, Some(reg), &mut need_split)
      }
      _ => None,
    };

    let found = match reg {
      Some(reg) if !pair || hi.is_some() => {
        let mut use_pos = self.use_pos[reg];
        let mut split_pos = self.block_pos[reg];
        if let Some(hi) = hi {
          use_pos = use_pos.min(self.use_pos[hi]);
          split_pos = split_pos.min(self.block_pos[hi]);
        }
        Some((reg, use_pos, split_pos))
      }
      _ => None,
    };

    match found {
      Some((reg, use_pos, split_pos)) if use_pos >= first_usage => {
        debug_assert!(
          !need_split || split_pos > from,
          "splitting interval at from"
        );
        self.assign_reg(cur, reg, hi);
        if need_split {
          self.split_when_partial_register_available(cur, split_pos);
        }
        self.split_and_spill_intersecting_intervals(reg, hi)
      }
      _ => {
        // Every register is needed before the first use of `cur`.
        if first_usage <= from + 1 {
          self.ls.assign_spill_slot(cur)?;
          return Err(bailout("LinearScan: no register found"));
        }
        debug!("spilling {:?}", cur);
        self.split_and_spill_interval(cur, false)
      }
    }
  }

  /// Takes an interval out of the active or inactive list. Returns whether
  /// it was inactive.
  fn remove_from_list(&mut self, id: IntId) -> bool {
    if let Some(index) = self.active.any.iter().position(|&x| x == id) {
      self.active.any.remove(index);
      false
    } else {
      if let Some(index) = self.inactive.any.iter().position(|&x| x == id) {
        self.inactive.any.remove(index);
      }
      true
    }
  }

  fn split_and_spill_intersecting_intervals(
    &mut self, reg: usize, hi: Option<usize>,
  ) -> Result<(), RegAllocError> {
    let processed = std::mem::take(&mut self.spill_intervals[reg]);
    for &id in &processed {
      let inactive = self.remove_from_list(id);
      self.split_and_spill_interval(id, inactive)?;
    }
    if let Some(hi) = hi {
      let others = std::mem::take(&mut self.spill_intervals[hi]);
      for id in others {
        if !processed.contains(&id) {
          let inactive = self.remove_from_list(id);
          self.split_and_spill_interval(id, inactive)?;
        }
      }
    }
    Ok(())
  }

  //===========================================================================
  // Splitting

  fn append_to_unhandled(&mut self, id: IntId) {
    let intervals = &self.ls.intervals;
    let key = |id: IntId| {
      let interval = intervals.get(id);
      (interval.from(), interval.first_usage(UseKind::NoUse))
    };
    let new_key = key(id);
    let list = &self.unhandled.any;
    let mut index = list.len();
    while index > 0 && key(list[index - 1]) < new_key {
      index -= 1;
    }
    self.unhandled.any.insert(index, id);
  }

  /// Picks the split position for the block boundary between
  /// `min_block` and `max_block` with the lowest loop depth.
  fn find_block_split_pos(
    &self, min_block: BlockIx, max_block: BlockIx, max_split_pos: i32,
  ) -> i32 {
    let blocks = &self.ls.lir.blocks;
    let mut optimal = blocks[max_block].last_op_id + 2;
    if optimal > max_split_pos {
      optimal = blocks[max_block].first_op_id;
    }
    let mut min_loop_depth = blocks[max_block].loop_depth;
    for i in (min_block.get()..max_block.get()).rev() {
      let block = &blocks[BlockIx::new(i)];
      if block.loop_depth < min_loop_depth {
        // Split at the end of a block with lower loop depth.
        min_loop_depth = block.loop_depth;
        optimal = block.last_op_id + 2;
      }
    }
    optimal
  }

  fn find_optimal_split_pos(
    &self, it: IntId, min_split_pos: i32, max_split_pos: i32,
    do_loop_optimization: bool,
  ) -> i32 {
    if min_split_pos == max_split_pos {
      return min_split_pos;
    }
    // The block before `min_split_pos` when it is a block begin.
    let min_block = self.ls.block_of_op_with_id(min_split_pos - 1);
    let max_block = self.ls.block_of_op_with_id(max_split_pos - 1);
    if min_block == max_block {
      // No block boundary in between: split as late as possible.
      return max_split_pos;
    }
    let interval = self.ls.intervals.get(it);
    if interval.has_hole_between(max_split_pos - 1, max_split_pos)
      && !self.ls.is_block_begin(max_split_pos)
    {
      // The register is needed for a definition after a hole; reloading
      // earlier is useless.
      return max_split_pos;
    }

    if do_loop_optimization {
      // Split before a loop whose end marker lies in between, so that uses
      // inside the loop get the register.
      let min_block_last = self.ls.lir.blocks[min_block].last_op_id;
      let loop_end_pos =
        interval.next_usage_exact(UseKind::LoopEndMarker, min_block_last + 2);
      if loop_end_pos < max_split_pos {
        let loop_block = self.ls.block_of_op_with_id(loop_end_pos);
        debug_assert!(loop_block != min_block);
        let loop_block_end = self.ls.lir.blocks[loop_block].last_op_id + 2;
        let optimal =
          self.find_block_split_pos(min_block, loop_block, loop_block_end);
        if optimal != loop_block_end {
          return optimal;
        }
      }
    }
    self.find_block_split_pos(min_block, max_block, max_split_pos)
  }

  /// Splits `it` at the best position in `[min_split_pos, max_split_pos]`.
  /// The split child is added to the unhandled list and gets a register when
  /// it is activated.
  fn split_before_usage(
    &mut self, it: IntId, min_split_pos: i32, max_split_pos: i32,
  ) {
    debug_assert!(min_split_pos <= max_split_pos, "invalid order");
    let mut optimal =
      self.find_optimal_split_pos(it, min_split_pos, max_split_pos, true);

    let interval = self.ls.intervals.get(it);
    debug_assert!(optimal <= interval.to() && optimal > interval.from());
    if optimal == interval.to()
      && interval.next_usage(UseKind::MustHaveRegister, min_split_pos)
        == MAX_POS
    {
      // The split would be right at the end.
      trace!("no split of {:?} needed", it);
      return;
    }

    let is_block_begin = self.ls.is_block_begin(optimal);
    let move_necessary =
      !is_block_begin && !interval.has_hole_between(optimal - 1, optimal);
    if !is_block_begin {
      // Before the op, at an odd position.
      optimal = (optimal - 1) | 1;
    }

    let child = self.ls.intervals.split(it, optimal);
    self.ls.intervals.get_mut(child).insert_move_when_activated =
      move_necessary;
    debug!(
      "split {:?} at {} (move {}) in [{}, {}]: {}",
      it,
      optimal,
      move_necessary,
      min_split_pos,
      max_split_pos,
      self.ls.intervals.display(child)
    );
    self.append_to_unhandled(child);
  }

  fn split_when_partial_register_available(
    &mut self, it: IntId, available_until: i32,
  ) {
    let interval = self.ls.intervals.get(it);
    let min_split_pos = interval
      .previous_usage(UseKind::ShouldHaveRegister, available_until)
      .max(interval.from() + 1);
    self.split_before_usage(it, min_split_pos, available_until);
  }

  /// Splits an interval that starts on the stack before its first use that
  /// wants a register.
  fn split_stack_interval(&mut self, it: IntId) {
    let interval = self.ls.intervals.get(it);
    let min_split_pos = self.current_position + 1;
    let max_split_pos =
      interval.first_usage(UseKind::ShouldHaveRegister).min(interval.to());
    let max_split_pos = max_split_pos.max(min_split_pos);
    self.split_before_usage(it, min_split_pos, max_split_pos);
  }

  fn split_and_spill_interval(
    &mut self, it: IntId, inactive: bool,
  ) -> Result<(), RegAllocError> {
    let pos = self.current_position;
    if inactive {
      // No stack slot needed yet: the split child gets a new chance for a
      // register when activated.
      debug_assert!(
        self.ls.intervals.get(it).has_hole_between(pos - 1, pos + 1)
      );
      self.split_before_usage(it, pos + 1, pos + 1);
      Ok(())
    } else {
      let interval = self.ls.intervals.get(it);
      let min_split_pos = pos + 1;
      let max_split_pos = interval
        .next_usage(UseKind::MustHaveRegister, min_split_pos)
        .min(interval.to());
      self.split_before_usage(it, min_split_pos, max_split_pos);
      self.split_for_spilling(it)
    }
  }

  /// Spills the part of `it` after its last use before the current position.
  fn split_for_spilling(&mut self, it: IntId) -> Result<(), RegAllocError> {
    let max_split_pos = self.current_position;
    let min_split_pos = {
      let interval = self.ls.intervals.get(it);
      (interval.previous_usage(UseKind::ShouldHaveRegister, max_split_pos) + 1)
        .max(interval.from())
        .min(max_split_pos)
    };

    if min_split_pos == self.ls.intervals.get(it).from() {
      // Never used before the current position: spill it entirely.
      debug!("spilling {:?} entirely", it);
      self.ls.assign_spill_slot(it)?;
      self.ls.change_spill_state(it, min_split_pos);

      // Kick unused predecessors out of their registers as well, which
      // avoids a short register fragment between stack fragments.
      let mut parent = it;
      while self.ls.intervals.is_split_child(parent) {
        let from = self.ls.intervals.get(parent).from();
        let before = self.ls.intervals.split_child_before_op_id(parent, from);
        parent = match before {
          Some(parent) => parent,
          None => break,
        };
        let interval = self.ls.intervals.get(parent);
        if interval.location.reg().is_some() {
          if interval.first_usage(UseKind::ShouldHaveRegister) == MAX_POS {
            debug!("spilling unused {:?}", parent);
            self.ls.assign_spill_slot(parent)?;
          } else {
            break;
          }
        }
      }
    } else {
      let mut optimal =
        self.find_optimal_split_pos(it, min_split_pos, max_split_pos, false);
      let is_block_begin = self.ls.is_block_begin(optimal);
      if !is_block_begin {
        optimal = (optimal - 1) | 1;
      }
      let spilled = self.ls.intervals.split(it, optimal);
      self.ls.assign_spill_slot(spilled)?;
      self.ls.change_spill_state(spilled, optimal);
      debug!("spilling {:?} from {}", spilled, optimal);
      if !is_block_begin {
        self.insert_move(optimal, it, spilled)?;
      }
      self.ls.intervals.make_current_split_child(spilled);
    }
    Ok(())
  }

  //===========================================================================
  // Moves

  /// Queues a move from `src` to `dst` before the op at `op_id`.
  fn insert_move(
    &mut self, op_id: i32, src: IntId, dst: IntId,
  ) -> Result<(), RegAllocError> {
    let op_id = (op_id + 1) & !1;
    let bix = self.ls.block_of_op_with_id(op_id);
    debug_assert!(
      op_id > 0 && self.ls.block_of_op_with_id(op_id - 2) == bix,
      "cannot insert move at block boundary"
    );

    // Earlier moves may already be in the list, so search forward from the
    // index the numbering gives.
    let ops = &self.ls.lir.blocks[bix].ops;
    let start = ops
      .first()
      .and_then(|first| op_id.checked_sub(first.id))
      .filter(|delta| *delta >= 0);
    let mut index = match start {
      Some(delta) => (delta / 2) as usize,
      None => return Err(bailout("LinearScan: no insert position for move")),
    };
    while index < ops.len() && ops[index].id != op_id {
      index += 1;
    }
    if index == 0 || index >= ops.len() {
      return Err(bailout("LinearScan: no insert position for move"));
    }

    self.move_resolver.move_insert_position(
      self.ls,
      InsertTarget::Block(bix),
      index as i32 - 1,
    )?;
    self.move_resolver.add_mapping(self.ls, src, dst);
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::SimpleFrameMap;
  use crate::interval::Range as LiveRange;
  use crate::lir::*;
  use crate::test_util::*;

  /// Runs the allocator up to and including the walk of the CPU class.
  fn walk(lir: &mut Lir, regs: &RegisterFile, f: impl FnOnce(&LinearScan)) {
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(lir, regs, &mut frame_map);
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    ls.sort_intervals_before_allocation();
    ls.allocate_registers().unwrap();
    f(&ls);
  }

  fn vint(ls: &LinearScan, n: usize) -> IntId {
    ls.intervals.interval_for(ls.num_regs + n).unwrap()
  }

  #[test]
  fn disjoint_intervals_share_a_register() {
    // 2: v0 = 1
    // 4: print v0
    // 6: v1 = 2
    // 8: print v1
    let mut lir = make_lir(
      vec![make_block(
        vec![mov(cint(1), v(0)), print(v(0)), mov(cint(2), v(1)), print(v(1))],
        &[],
      )],
      2,
    );
    let regs = make_regs(1, 0);
    walk(&mut lir, &regs, |ls| {
      let loc = |n| ls.intervals.get(vint(ls, n)).location;
      assert_eq!(loc(0), IntervalLocation::Reg(RealReg(0), None));
      assert_eq!(loc(1), IntervalLocation::Reg(RealReg(0), None));
      assert_eq!(ls.intervals.len(), 2);
    });
  }

  #[test]
  fn pressure_splits_and_spills() {
    // 2: v0 = 1
    // 4: v1 = 2
    // 6: print v1
    // 8: print v0
    let mut lir = make_lir(
      vec![make_block(
        vec![mov(cint(1), v(0)), mov(cint(2), v(1)), print(v(1)), print(v(0))],
        &[],
      )],
      2,
    );
    let regs = make_regs(1, 0);
    walk(&mut lir, &regs, |ls| {
      let v0 = vint(ls, 0);
      let v1 = vint(ls, 1);
      // v1 is used first, so v0 is moved out of the register and reloaded.
      assert_eq!(
        ls.intervals.get(v1).location,
        IntervalLocation::Reg(RealReg(0), None)
      );
      let children = &ls.intervals.get(v0).split_children;
      assert_eq!(children.len(), 3, "{:?}", children);
      assert_eq!(
        ls.intervals.get(v0).ranges,
        vec![LiveRange { from: 2, to: 3 }]
      );
      // The reload child is split off first, then the spilled part.
      let spilled = ls.intervals.get(children[2]);
      assert!(spilled.location.spill().is_some());
      assert_eq!(spilled.ranges, vec![LiveRange { from: 3, to: 7 }]);
      let reloaded = ls.intervals.get(children[1]);
      assert_eq!(reloaded.location, IntervalLocation::Reg(RealReg(0), None));
      assert_eq!(reloaded.from(), 7);
      assert_eq!(ls.max_spills, 1);

      // A store after the def and a reload before the second print.
      let ops = &ls.lir.blocks[BlockIx::new(0)].ops;
      let inserted: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.id == INSERTED_OP_ID)
        .map(|(i, _)| i)
        .collect();
      assert_eq!(inserted, vec![2, 5]);
    });
  }

  #[test]
  fn hint_is_followed() {
    // 2: v0 = 1
    // 4: print v0
    // 6: v1 = v0
    // 8: print v1
    let mut lir = make_lir(
      vec![make_block(
        vec![mov(cint(1), v(0)), print(v(0)), mov(v(0), v(1)), print(v(1))],
        &[],
      )],
      2,
    );
    let regs = make_regs(3, 0);
    walk(&mut lir, &regs, |ls| {
      let loc = |n| ls.intervals.get(vint(ls, n)).location;
      assert_eq!(loc(1), loc(0));
    });
  }

  #[test]
  fn move_without_insert_position_bails_out() {
    // 2: v0 = 1
    // 4: print v0
    // 6: v1 = 2
    // 8: print v1
    let mut lir = make_lir(
      vec![make_block(
        vec![mov(cint(1), v(0)), print(v(0)), mov(cint(2), v(1)), print(v(1))],
        &[],
      )],
      2,
    );
    let regs = make_regs(1, 0);
    let mut frame_map = SimpleFrameMap::new(0, 0);
    let mut ls = LinearScan::new(&mut lir, &regs, &mut frame_map);
    ls.validate().unwrap();
    ls.number_instructions();
    ls.compute_local_live_sets();
    ls.compute_global_live_sets().unwrap();
    ls.build_intervals();
    let (v0, v1) = (vint(&ls, 0), vint(&ls, 1));
    let b0 = BlockIx::new(0);
    let check = |result: Result<(), RegAllocError>| match result {
      Err(RegAllocError::Bailout(msg)) => {
        assert_eq!(msg, "LinearScan: no insert position for move")
      }
      other => panic!("unexpected result {:?}", other),
    };

    // The op at 4 is gone.
    ls.lir.blocks[b0].ops.retain(|op| op.id != 4);
    {
      let mut walker = Walker::new(&mut ls, RegClass::Cpu, vec![], vec![]);
      check(walker.insert_move(3, v0, v1));
    }

    // The block has no ops at all.
    ls.lir.blocks[b0].ops.clear();
    let mut walker = Walker::new(&mut ls, RegClass::Cpu, vec![], vec![]);
    check(walker.insert_move(3, v0, v1));
    assert_eq!(walker.ls.num_inserted_moves, 0);
  }
}
