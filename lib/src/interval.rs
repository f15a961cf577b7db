/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Live intervals: the lifetime of one physical register, one virtual
//! register, or one split fragment of a virtual register.
//!
//! An interval is an ascending list of disjoint half-open `[from, to)` ranges
//! over op ids, plus a list of use positions. Intervals live in an arena and
//! refer to each other (split parent, split children, register hint) through
//! `IntId` handles.

use log::trace;
use std::fmt;

use crate::data_structures::*;
use crate::lir::{Location, OperandMode};

/// Position larger than any op id.
pub const MAX_POS: i32 = i32::max_value();

/// A unique identifier for an interval.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntId(pub usize);

impl fmt::Debug for IntId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "int{}", self.0)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
  pub from: i32,
  pub to: i32,
}

/// Ordered by how strongly a use wants a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UseKind {
  NoUse,
  LoopEndMarker,
  ShouldHaveRegister,
  MustHaveRegister,
}

/// Tracks whether the spill store of an interval can be moved to its single
/// definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpillState {
  NoDefinitionFound,
  OneDefinitionFound,
  OneMoveInserted,
  StoreAtDefinition,
  StartInMemory,
  NoOptimization,
}

/// Where an interval lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalLocation {
  None,
  /// Low register and optional high register of a two-register value.
  Reg(RealReg, Option<RealReg>),
  Stack(StackSlot),
}

impl IntervalLocation {
  pub fn reg(&self) -> Option<RealReg> {
    match self {
      IntervalLocation::Reg(reg, _) => Some(*reg),
      _ => None,
    }
  }
  pub fn hi(&self) -> Option<RealReg> {
    match self {
      IntervalLocation::Reg(_, hi) => *hi,
      _ => None,
    }
  }
  pub fn spill(&self) -> Option<StackSlot> {
    match self {
      IntervalLocation::Stack(slot) => Some(*slot),
      _ => None,
    }
  }
  pub fn is_none(&self) -> bool {
    *self == IntervalLocation::None
  }
  /// The location of the low half, for oop maps and debug info.
  pub fn to_location(&self) -> Option<Location> {
    match self {
      IntervalLocation::None => None,
      IntervalLocation::Reg(reg, _) => Some(Location::Reg(*reg)),
      IntervalLocation::Stack(slot) => Some(Location::Stack(*slot)),
    }
  }
}

impl fmt::Display for IntervalLocation {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      IntervalLocation::None => write!(fmt, "none"),
      IntervalLocation::Reg(reg, None) => write!(fmt, "{:?}", reg),
      IntervalLocation::Reg(reg, Some(hi)) => write!(fmt, "{:?}:{:?}", reg, hi),
      IntervalLocation::Stack(slot) => write!(fmt, "{:?}", slot),
    }
  }
}

pub struct Interval {
  /// Operand number: physical registers first, then virtual registers, then
  /// split children and allocator temporaries.
  pub reg_num: usize,
  pub kind: ValueKind,
  pub ranges: Vec<Range>,
  /// Use positions in descending order, as they are found by the backwards
  /// walk of the interval builder. No-use positions are not recorded.
  pub uses: Vec<(i32, UseKind)>,
  pub location: IntervalLocation,
  pub split_parent: IntId,
  pub register_hint: Option<IntId>,
  pub insert_move_when_activated: bool,
  pub cached_operand: Option<Operand>,

  // Only meaningful on split parents.
  pub split_children: Vec<IntId>,
  pub current_split_child: Option<IntId>,
  pub canonical_spill_slot: Option<StackSlot>,
  pub spill_state: SpillState,
  pub spill_definition_pos: i32,

  // Walker cursor into `ranges`; `ranges.len()` means the end was reached.
  current: usize,
}

impl Interval {
  fn new(id: IntId, reg_num: usize, kind: ValueKind) -> Self {
    Self {
      reg_num,
      kind,
      ranges: Vec::new(),
      uses: Vec::new(),
      location: IntervalLocation::None,
      split_parent: id,
      register_hint: None,
      insert_move_when_activated: false,
      cached_operand: None,
      split_children: Vec::new(),
      current_split_child: None,
      canonical_spill_slot: None,
      spill_state: SpillState::NoDefinitionFound,
      spill_definition_pos: -1,
      current: 0,
    }
  }

  pub fn from(&self) -> i32 {
    self.ranges.first().map_or(MAX_POS, |r| r.from)
  }

  pub fn to(&self) -> i32 {
    self.ranges.last().map_or(MAX_POS, |r| r.to)
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  /// Ranges are built backwards: a new range either extends the first one or
  /// is prepended.
  pub fn add_range(&mut self, from: i32, to: i32) {
    debug_assert!(from < to, "invalid range [{}, {})", from, to);
    match self.ranges.first_mut() {
      Some(first) if first.from <= to => {
        first.from = first.from.min(from);
        first.to = first.to.max(to);
      }
      _ => self.ranges.insert(0, Range { from, to }),
    }
  }

  /// Only virtual intervals record use positions.
  pub fn add_use_pos(&mut self, pos: i32, kind: UseKind, is_virtual: bool) {
    debug_assert!(
      self.covers(pos, OperandMode::Input),
      "use position not covered by live range"
    );
    if kind == UseKind::NoUse || !is_virtual {
      return;
    }
    match self.uses.last_mut() {
      Some(last) if last.0 <= pos => {
        debug_assert!(last.0 == pos, "use positions not sorted");
        if last.1 < kind {
          last.1 = kind;
        }
      }
      _ => self.uses.push((pos, kind)),
    }
  }

  pub fn covers(&self, op_id: i32, mode: OperandMode) -> bool {
    for r in &self.ranges {
      if r.to < op_id {
        continue;
      }
      return if mode == OperandMode::Output {
        r.from <= op_id && op_id < r.to
      } else {
        r.from <= op_id && op_id <= r.to
      };
    }
    false
  }

  pub fn has_hole_between(&self, hole_from: i32, hole_to: i32) -> bool {
    debug_assert!(hole_from < hole_to);
    for r in &self.ranges {
      if hole_from < r.from {
        return true;
      } else if hole_to <= r.to {
        return false;
      } else if hole_from <= r.to {
        return true;
      }
    }
    false
  }

  pub fn first_usage(&self, min_kind: UseKind) -> i32 {
    for &(pos, kind) in self.uses.iter().rev() {
      if kind >= min_kind {
        return pos;
      }
    }
    MAX_POS
  }

  pub fn next_usage(&self, min_kind: UseKind, from: i32) -> i32 {
    for &(pos, kind) in self.uses.iter().rev() {
      if pos >= from && kind >= min_kind {
        return pos;
      }
    }
    MAX_POS
  }

  pub fn next_usage_exact(&self, exact_kind: UseKind, from: i32) -> i32 {
    for &(pos, kind) in self.uses.iter().rev() {
      if pos >= from && kind == exact_kind {
        return pos;
      }
    }
    MAX_POS
  }

  /// Last use position of at least `min_kind` at or before `from`, 0 if none.
  pub fn previous_usage(&self, min_kind: UseKind, from: i32) -> i32 {
    let mut prev = 0;
    for &(pos, kind) in self.uses.iter().rev() {
      if pos > from {
        return prev;
      }
      if kind >= min_kind {
        prev = pos;
      }
    }
    prev
  }

  // Walker cursor.

  pub fn rewind_range(&mut self) {
    self.current = 0;
  }
  pub fn next_range(&mut self) {
    debug_assert!(self.current < self.ranges.len());
    self.current += 1;
  }
  pub fn current_at_end(&self) -> bool {
    self.current >= self.ranges.len()
  }
  pub fn current_from(&self) -> i32 {
    self.ranges.get(self.current).map_or(MAX_POS, |r| r.from)
  }
  pub fn current_to(&self) -> i32 {
    self.ranges.get(self.current).map_or(MAX_POS, |r| r.to)
  }

  /// First position where both interval cursors' remaining ranges overlap.
  pub fn current_intersects_at(&self, other: &Interval) -> Option<i32> {
    let mine = &self.ranges[self.current.min(self.ranges.len())..];
    let theirs = &other.ranges[other.current.min(other.ranges.len())..];
    intersects_at(mine, theirs)
  }

  pub fn intersects_at(&self, other: &Interval) -> Option<i32> {
    intersects_at(&self.ranges, &other.ranges)
  }
}

fn intersects_at(r1: &[Range], r2: &[Range]) -> Option<i32> {
  let (mut i, mut j) = (0, 0);
  while i < r1.len() && j < r2.len() {
    let (a, b) = (r1[i], r2[j]);
    if a.from < b.from {
      if a.to <= b.from {
        i += 1;
      } else {
        return Some(b.from);
      }
    } else if b.from < a.from {
      if b.to <= a.from {
        j += 1;
      } else {
        return Some(a.from);
      }
    } else {
      return Some(a.from);
    }
  }
  None
}

//=============================================================================
// The interval arena.

pub struct Intervals {
  data: Vec<Interval>,
  /// Maps operand numbers to intervals.
  by_reg: Vec<Option<IntId>>,
  num_regs: usize,
}

impl Intervals {
  /// `num_operands` is the number of physical plus virtual registers.
  pub fn new(num_regs: usize, num_operands: usize) -> Self {
    Self { data: Vec::new(), by_reg: vec![None; num_operands], num_regs }
  }

  pub fn num_regs(&self) -> usize {
    self.num_regs
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn num_operands(&self) -> usize {
    self.by_reg.len()
  }

  pub fn get(&self, id: IntId) -> &Interval {
    &self.data[id.0]
  }

  pub fn get_mut(&mut self, id: IntId) -> &mut Interval {
    &mut self.data[id.0]
  }

  pub fn ids(&self) -> impl Iterator<Item = IntId> {
    (0..self.data.len()).map(IntId)
  }

  pub fn interval_for(&self, reg_num: usize) -> Option<IntId> {
    self.by_reg.get(reg_num).copied().flatten()
  }

  pub fn is_fixed(&self, id: IntId) -> bool {
    self.get(id).reg_num < self.num_regs
  }

  pub fn is_split_parent(&self, id: IntId) -> bool {
    self.get(id).split_parent == id
  }

  pub fn is_split_child(&self, id: IntId) -> bool {
    !self.is_split_parent(id)
  }

  /// Temporaries of the move resolver carry the dummy range `[1, 2)`.
  pub fn is_resolver_temp(&self, id: IntId) -> bool {
    let ranges = &self.get(id).ranges;
    ranges.len() == 1 && ranges[0] == Range { from: 1, to: 2 }
  }

  pub fn parent(&self, id: IntId) -> &Interval {
    self.get(self.get(id).split_parent)
  }

  fn parent_mut(&mut self, id: IntId) -> &mut Interval {
    let parent = self.get(id).split_parent;
    self.get_mut(parent)
  }

  /// Creates the interval of an existing operand number.
  pub fn create(&mut self, reg_num: usize, kind: ValueKind) -> IntId {
    debug_assert!(self.by_reg[reg_num].is_none(), "interval created twice");
    let id = IntId(self.data.len());
    let mut interval = Interval::new(id, reg_num, kind);
    if reg_num < self.num_regs {
      interval.location = IntervalLocation::Reg(RealReg(reg_num as u8), None);
    }
    self.data.push(interval);
    self.by_reg[reg_num] = Some(id);
    id
  }

  /// Creates an interval with a fresh operand number.
  pub fn create_derived(&mut self, kind: ValueKind) -> IntId {
    let reg_num = self.by_reg.len();
    self.by_reg.push(None);
    self.create(reg_num, kind)
  }

  pub fn operand(&self, id: IntId) -> Operand {
    let interval = self.get(id);
    if interval.reg_num < self.num_regs {
      Operand::reg(RealReg(interval.reg_num as u8), interval.kind)
    } else {
      Operand::virt((interval.reg_num - self.num_regs) as u32, interval.kind)
    }
  }

  // Split-parent state.

  pub fn spill_state(&self, id: IntId) -> SpillState {
    self.parent(id).spill_state
  }

  pub fn set_spill_state(&mut self, id: IntId, state: SpillState) {
    self.parent_mut(id).spill_state = state;
  }

  pub fn spill_definition_pos(&self, id: IntId) -> i32 {
    self.parent(id).spill_definition_pos
  }

  pub fn set_spill_definition_pos(&mut self, id: IntId, pos: i32) {
    self.parent_mut(id).spill_definition_pos = pos;
  }

  pub fn canonical_spill_slot(&self, id: IntId) -> Option<StackSlot> {
    self.parent(id).canonical_spill_slot
  }

  pub fn set_canonical_spill_slot(&mut self, id: IntId, slot: StackSlot) {
    let parent = self.parent_mut(id);
    debug_assert!(
      parent.canonical_spill_slot.is_none(),
      "canonical spill slot already set"
    );
    parent.canonical_spill_slot = Some(slot);
  }

  /// The value is stored to its canonical slot once and stays there.
  pub fn always_in_memory(&self, id: IntId) -> bool {
    match self.spill_state(id) {
      SpillState::StoreAtDefinition | SpillState::StartInMemory => {
        self.canonical_spill_slot(id).is_some()
      }
      _ => false,
    }
  }

  pub fn current_split_child(&self, id: IntId) -> Option<IntId> {
    self.parent(id).current_split_child
  }

  pub fn make_current_split_child(&mut self, id: IntId) {
    self.parent_mut(id).current_split_child = Some(id);
  }

  /// The register hint, optionally searching the hint's split children for
  /// the first one holding a register.
  pub fn register_hint(
    &self, id: IntId, search_split_child: bool,
  ) -> Option<IntId> {
    let hint = self.get(id).register_hint?;
    if !search_split_child {
      return Some(hint);
    }
    if self.get(hint).location.reg().is_some() {
      return Some(hint);
    }
    self
      .get(hint)
      .split_children
      .iter()
      .copied()
      .find(|&child| self.get(child).location.reg().is_some())
  }

  // Splitting.

  fn new_split_child(&mut self, id: IntId) -> IntId {
    let kind = self.get(id).kind;
    let parent = self.get(id).split_parent;
    let child = self.create_derived(kind);
    {
      let child_int = self.get_mut(child);
      child_int.split_parent = parent;
      child_int.register_hint = Some(parent);
    }
    let parent_int = self.get_mut(parent);
    if parent_int.split_children.is_empty() {
      debug_assert!(parent == id, "first split must be on the parent");
      parent_int.split_children.push(parent);
    }
    parent_int.split_children.push(child);
    child
  }

  /// Splits `id` at `split_pos`. `id` keeps `[from, split_pos)`, the returned
  /// child gets `[split_pos, to)`.
  pub fn split(&mut self, id: IntId, split_pos: i32) -> IntId {
    debug_assert!(!self.is_fixed(id), "cannot split fixed intervals");
    let child = self.new_split_child(id);

    let interval = self.get_mut(id);
    let idx = interval
      .ranges
      .iter()
      .position(|r| r.to > split_pos)
      .unwrap_or(interval.ranges.len());
    debug_assert!(idx < interval.ranges.len(), "split after end of last range");
    let mut tail = interval.ranges.split_off(idx);
    if let Some(first) = tail.first_mut() {
      if first.from < split_pos {
        interval.ranges.push(Range { from: first.from, to: split_pos });
        first.from = split_pos;
      }
    }
    debug_assert!(
      !interval.ranges.is_empty(),
      "split before start of first range"
    );

    // Uses are descending, so the child's uses form the prefix.
    let keep = interval.uses.iter().take_while(|u| u.0 >= split_pos).count();
    let head_uses = interval.uses.split_off(keep);
    let child_uses = std::mem::replace(&mut interval.uses, head_uses);

    let child_int = self.get_mut(child);
    child_int.ranges = tail;
    child_int.uses = child_uses;
    trace!("split {:?} at {} -> {:?}", id, split_pos, child);
    child
  }

  /// Splits off the head `[from, split_pos)` of `id` into a new child, which is
  /// returned; `id` keeps the tail. Only the first range may be split and the
  /// head must not contain use positions.
  pub fn split_from_start(&mut self, id: IntId, split_pos: i32) -> IntId {
    debug_assert!(!self.is_fixed(id), "cannot split fixed intervals");
    {
      let interval = self.get(id);
      debug_assert!(split_pos > interval.from() && split_pos < interval.to());
      debug_assert!(split_pos <= interval.ranges[0].to);
      debug_assert!(interval.first_usage(UseKind::NoUse) > split_pos);
    }
    let child = self.new_split_child(id);
    let interval = self.get_mut(id);
    let first_from = interval.ranges[0].from;
    if split_pos == interval.ranges[0].to {
      interval.ranges.remove(0);
    } else {
      interval.ranges[0].from = split_pos;
    }
    self.get_mut(child).add_range(first_from, split_pos);
    child
  }

  /// Finds the split child of `id`'s parent that is valid at `op_id`. In
  /// output mode the end of an interval does not count.
  pub fn split_child_at_op_id(
    &self, id: IntId, op_id: i32, mode: OperandMode,
  ) -> Option<IntId> {
    let parent_id = self.get(id).split_parent;
    let parent = self.get(parent_id);
    debug_assert!(op_id >= 0, "invalid op id");
    if parent.split_children.is_empty() {
      debug_assert!(parent.covers(op_id, mode), "op id not covered");
      return Some(parent_id);
    }
    let to_offset = if mode == OperandMode::Output { 0 } else { 1 };
    parent.split_children.iter().copied().find(|&child| {
      let c = self.get(child);
      c.from() <= op_id && op_id < c.to() + to_offset
    })
  }

  /// The split child that ends last at or before `op_id`.
  pub fn split_child_before_op_id(
    &self, id: IntId, op_id: i32,
  ) -> Option<IntId> {
    let parent = self.parent(id);
    let mut result: Option<IntId> = None;
    for &child in parent.split_children.iter().rev() {
      let to = self.get(child).to();
      if to <= op_id && result.map_or(true, |r| self.get(r).to() < to) {
        result = Some(child);
      }
    }
    result
  }

  pub fn display(&self, id: IntId) -> String {
    let interval = self.get(id);
    let mut s = format!(
      "{:?} (reg {} {:?}, parent {:?}) @ {}",
      id,
      interval.reg_num,
      interval.kind,
      interval.split_parent,
      interval.location
    );
    if let Some(hi) = interval.location.hi() {
      s += &format!(" hi {:?}", hi);
    }
    s += ":";
    for r in &interval.ranges {
      s += &format!(" [{}, {})", r.from, r.to);
    }
    if !interval.uses.is_empty() {
      s += " uses";
      for (pos, kind) in interval.uses.iter().rev() {
        s += &format!(" {}:{:?}", pos, kind);
      }
    }
    s
  }
}

//=============================================================================
// A plain interval walker.

/// Walks a set of intervals in order of their start positions, and tracks
/// which of them cover the current position. Unlike the allocating walker,
/// activation never fails.
pub struct IntervalWalker {
  /// Sorted by descending start position.
  unhandled: Vec<IntId>,
  active: Vec<IntId>,
  inactive: Vec<IntId>,
  position: i32,
}

impl IntervalWalker {
  /// `sorted` must be ordered by start position.
  pub fn new(mut sorted: Vec<IntId>) -> Self {
    sorted.reverse();
    Self {
      unhandled: sorted,
      active: Vec::new(),
      inactive: Vec::new(),
      position: -1,
    }
  }

  /// Intervals whose current range contains the last walked-to position.
  pub fn active(&self) -> &[IntId] {
    &self.active
  }

  /// Advances to `pos`. Positions must not decrease.
  pub fn walk_to(&mut self, intervals: &mut Intervals, pos: i32) {
    debug_assert!(pos >= self.position, "walking backwards");
    self.position = pos;
    while let Some(&id) = self.unhandled.last() {
      if intervals.get(id).from() > pos {
        break;
      }
      self.unhandled.pop();
      intervals.get_mut(id).rewind_range();
      self.active.push(id);
    }

    let mut candidates = std::mem::take(&mut self.active);
    candidates.append(&mut self.inactive);
    for id in candidates {
      let interval = intervals.get_mut(id);
      while !interval.current_at_end() && interval.current_to() <= pos {
        interval.next_range();
      }
      if interval.current_at_end() {
        trace!("{:?} handled at {}", id, pos);
      } else if interval.current_from() <= pos {
        self.active.push(id);
      } else {
        self.inactive.push(id);
      }
    }
  }

  /// Advances to just before the op with `op_id`, so that intervals starting
  /// at the op are not active yet.
  pub fn walk_before(&mut self, intervals: &mut Intervals, op_id: i32) {
    self.walk_to(intervals, op_id - 1);
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn make(
    ints: &mut Intervals, ranges: &[(i32, i32)], uses: &[(i32, UseKind)],
  ) -> IntId {
    let reg_num = ints.num_regs();
    let id = ints.create(reg_num, ValueKind::Int);
    for &(from, to) in ranges.iter().rev() {
      ints.get_mut(id).add_range(from, to);
    }
    for &(pos, kind) in uses.iter().rev() {
      ints.get_mut(id).add_use_pos(pos, kind, true);
    }
    id
  }

  #[test]
  fn add_range_coalesces_backwards() {
    let mut ints = Intervals::new(2, 4);
    let id = ints.create(2, ValueKind::Int);
    let int = ints.get_mut(id);
    int.add_range(10, 20);
    int.add_range(4, 10);
    int.add_range(0, 2);
    assert_eq!(
      int.ranges,
      vec![Range { from: 0, to: 2 }, Range { from: 4, to: 20 }]
    );
    assert!(int.has_hole_between(2, 4));
    assert!(!int.has_hole_between(6, 8));
    assert!(int.covers(20, OperandMode::Input));
    assert!(!int.covers(20, OperandMode::Output));
  }

  #[test]
  fn split_partitions_ranges_and_uses() {
    let mut ints = Intervals::new(2, 4);
    let id = make(
      &mut ints,
      &[(2, 8), (12, 30)],
      &[
        (2, UseKind::MustHaveRegister),
        (14, UseKind::ShouldHaveRegister),
        (28, UseKind::MustHaveRegister),
      ],
    );
    let child = ints.split(id, 17);

    let parent = ints.get(id);
    assert_eq!(
      parent.ranges,
      vec![Range { from: 2, to: 8 }, Range { from: 12, to: 17 }]
    );
    assert_eq!(
      parent.uses,
      vec![(14, UseKind::ShouldHaveRegister), (2, UseKind::MustHaveRegister)]
    );

    let c = ints.get(child);
    assert_eq!(c.from(), 17);
    assert_eq!(c.ranges, vec![Range { from: 17, to: 30 }]);
    assert_eq!(c.uses, vec![(28, UseKind::MustHaveRegister)]);
    assert_eq!(c.split_parent, id);
    assert_eq!(ints.get(id).split_children, vec![id, child]);

    // Splitting the child again keeps the same split parent.
    let grandchild = ints.split(child, 21);
    assert_eq!(ints.get(grandchild).split_parent, id);
    assert_eq!(ints.get(id).split_children.len(), 3);

    assert_eq!(ints.split_child_at_op_id(id, 10, OperandMode::Input), None);
    assert_eq!(
      ints.split_child_at_op_id(id, 17, OperandMode::Output),
      Some(child)
    );
    // In input mode, the end of the left part is still valid.
    assert_eq!(ints.split_child_at_op_id(id, 17, OperandMode::Input), Some(id));
    assert_eq!(
      ints.split_child_at_op_id(id, 21, OperandMode::Output),
      Some(grandchild)
    );
    assert_eq!(ints.split_child_before_op_id(grandchild, 21), Some(child));
  }

  #[test]
  fn split_in_a_hole() {
    let mut ints = Intervals::new(0, 1);
    let id = make(&mut ints, &[(2, 8), (12, 30)], &[]);
    let child = ints.split(id, 10);
    assert_eq!(ints.get(id).ranges, vec![Range { from: 2, to: 8 }]);
    assert_eq!(ints.get(child).ranges, vec![Range { from: 12, to: 30 }]);
  }

  #[test]
  fn split_from_start_returns_head() {
    let mut ints = Intervals::new(0, 1);
    let id = make(&mut ints, &[(4, 20)], &[(10, UseKind::MustHaveRegister)]);
    let head = ints.split_from_start(id, 5);
    assert_eq!(ints.get(head).ranges, vec![Range { from: 4, to: 5 }]);
    assert_eq!(ints.get(id).from(), 5);
    assert_eq!(ints.get(head).split_parent, id);
  }

  #[test]
  fn use_position_queries() {
    let mut ints = Intervals::new(0, 1);
    let id = make(
      &mut ints,
      &[(0, 40)],
      &[
        (6, UseKind::ShouldHaveRegister),
        (11, UseKind::LoopEndMarker),
        (20, UseKind::MustHaveRegister),
      ],
    );
    let int = ints.get(id);
    assert_eq!(int.first_usage(UseKind::MustHaveRegister), 20);
    assert_eq!(int.first_usage(UseKind::NoUse), 6);
    assert_eq!(int.next_usage(UseKind::ShouldHaveRegister, 7), 20);
    assert_eq!(int.next_usage_exact(UseKind::LoopEndMarker, 0), 11);
    assert_eq!(int.previous_usage(UseKind::ShouldHaveRegister, 19), 6);
    assert_eq!(int.previous_usage(UseKind::MustHaveRegister, 19), 0);
    assert_eq!(int.next_usage(UseKind::MustHaveRegister, 21), MAX_POS);
  }

  #[test]
  fn intersection() {
    let mut ints = Intervals::new(0, 2);
    let a = make(&mut ints, &[(0, 4), (10, 14)], &[]);
    let b = ints.create(1, ValueKind::Int);
    ints.get_mut(b).add_range(4, 10);
    assert_eq!(ints.get(a).intersects_at(ints.get(b)), None);
    ints.get_mut(b).add_range(2, 4);
    assert_eq!(ints.get(a).intersects_at(ints.get(b)), Some(2));
  }

  #[test]
  fn interval_walker_tracks_holes() {
    let mut ints = Intervals::new(0, 2);
    let a = make(&mut ints, &[(2, 6), (10, 14)], &[]);
    let b = ints.create(1, ValueKind::Int);
    ints.get_mut(b).add_range(4, 12);
    let mut walker = IntervalWalker::new(vec![a, b]);

    walker.walk_before(&mut ints, 4);
    assert_eq!(walker.active(), &[a]);
    walker.walk_to(&mut ints, 4);
    assert_eq!(walker.active(), &[a, b]);
    // a is in its hole.
    walker.walk_to(&mut ints, 8);
    assert_eq!(walker.active(), &[b]);
    walker.walk_before(&mut ints, 12);
    assert_eq!(walker.active(), &[b, a]);
    walker.walk_to(&mut ints, 14);
    assert!(walker.active().is_empty());
  }
}
