/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Batched insertion of allocator-generated ops into an op list.
//!
//! Ops are recorded against indices of the list as it was when the buffer was
//! filled, so that indices stay stable while more ops are queued. `apply`
//! then splices everything in one pass.

use log::trace;

use crate::lir::LirOp;

#[derive(Clone, Debug)]
pub(crate) struct InstToInsert {
  /// The op is inserted after the op at this index; -1 inserts at the front.
  pub(crate) at: i32,
  seq: usize,
  pub(crate) op: LirOp,
}

#[derive(Debug, Default)]
pub(crate) struct InsertionBuffer {
  insts: Vec<InstToInsert>,
}

impl InsertionBuffer {
  pub(crate) fn new() -> Self {
    Self { insts: Vec::new() }
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.insts.is_empty()
  }

  pub(crate) fn len(&self) -> usize {
    self.insts.len()
  }

  /// Queues `op` after the op at index `at`. Ops queued at the same index
  /// keep their relative order.
  pub(crate) fn append(&mut self, at: i32, op: LirOp) {
    let seq = self.insts.len();
    self.insts.push(InstToInsert { at, seq, op });
  }

  /// Splices all queued ops into `ops` and empties the buffer.
  pub(crate) fn apply(&mut self, ops: &mut Vec<LirOp>) {
    if self.insts.is_empty() {
      return;
    }
    let mut insts = std::mem::take(&mut self.insts);
    insts.sort_by_key(|inst| (inst.at, inst.seq));
    trace!("inserting {} ops into a list of {}", insts.len(), ops.len());

    let old_ops = std::mem::take(ops);
    ops.reserve(old_ops.len() + insts.len());
    let mut pending = insts.into_iter().peekable();

    while let Some(inst) = pending.next_if(|inst| inst.at < 0) {
      ops.push(inst.op);
    }
    for (index, op) in old_ops.into_iter().enumerate() {
      ops.push(op);
      while let Some(inst) = pending.next_if(|inst| inst.at as usize == index) {
        ops.push(inst.op);
      }
    }
    // Indices past the end append.
    ops.extend(pending.map(|inst| inst.op));
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_util::*;

  fn ids(ops: &[LirOp]) -> Vec<i32> {
    ops.iter().map(|op| op.id).collect()
  }

  fn numbered(n: i32) -> Vec<LirOp> {
    (0..n)
      .map(|i| {
        let mut op = print(cint(i));
        op.id = 2 * i;
        op
      })
      .collect()
  }

  #[test]
  fn inserts_after_index_in_queue_order() {
    let mut ops = numbered(3);
    let mut buffer = InsertionBuffer::new();
    buffer.append(1, mov(cint(7), v(0)));
    buffer.append(-1, mov(cint(8), v(1)));
    buffer.append(0, mov(cint(9), v(2)));
    buffer.append(1, mov(cint(10), v(3)));
    assert_eq!(buffer.len(), 4);
    buffer.apply(&mut ops);
    assert!(buffer.is_empty());

    assert_eq!(ids(&ops), vec![-1, 0, -1, 2, -1, -1, 4]);
    assert_eq!(ops[0].as_move().map(|m| m.0), Some(cint(8)));
    assert_eq!(ops[4].as_move().map(|m| m.0), Some(cint(7)));
    assert_eq!(ops[5].as_move().map(|m| m.0), Some(cint(10)));
  }

  #[test]
  fn empty_list_takes_front_insertions() {
    let mut ops = Vec::new();
    let mut buffer = InsertionBuffer::new();
    buffer.append(-1, mov(cint(1), v(0)));
    buffer.append(-1, jump(0));
    buffer.apply(&mut ops);
    assert_eq!(ops.len(), 2);
    assert!(ops[1].is_branch());
  }
}
