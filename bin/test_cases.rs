/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function |find_func|.
/// Add new ones there.
use lsra::{Address, CallTarget, Condition, ConvertOp, Operand, Phi, ValueKind};

use crate::test_framework::*;

fn at(base: Operand, disp: i32) -> Address {
  Address::new(base, disp)
}

fn test_straight_line() -> Func {
  let mut f = FuncBuilder::new("straight_line");
  let v0 = f.vreg(ValueKind::Int);
  let v1 = f.vreg(ValueKind::Int);
  let v2 = f.vreg(ValueKind::Int);
  let v3 = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(1), v0),
      i_move(int(2), v1),
      i_add(v0, v1, v2),
      i_print(v2),
      i_mul(v2, v1, v3),
      i_print(v3),
      i_sub(v3, v0, v3),
      i_ret(v3),
    ],
  );
  f.finish()
}

/// A value defined before a two-way branch and used after the join.
fn test_diamond() -> Func {
  let mut f = FuncBuilder::new("diamond");
  let v0 = f.vreg(ValueKind::Int);
  let v1 = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(10), v0),
      i_cmp(v0, int(5)),
      i_branch(Condition::Greater, "big"),
    ],
  );
  f.block("small", vec![i_add(v0, int(1), v1), i_print(v1), i_goto("join")]);
  f.block("big", vec![i_mul(v0, int(2), v1), i_print(v1), i_goto("join")]);
  f.block("join", vec![i_print(v0), i_add(v0, v1, v1), i_ret(v1)]);
  f.finish()
}

/// s = 0 + 1 + ... + 9
fn test_loop_sum() -> Func {
  let mut f = FuncBuilder::new("loop_sum");
  let i = f.vreg(ValueKind::Int);
  let s = f.vreg(ValueKind::Int);
  f.block("start", vec![i_move(int(0), i), i_move(int(0), s), i_goto("head")]);
  f.block(
    "head",
    vec![i_cmp(i, int(10)), i_branch(Condition::GreaterEqual, "exit")],
  );
  f.block("body", vec![i_add(s, i, s), i_add(i, int(1), i), i_goto("head")]);
  f.block("exit", vec![i_print(s), i_ret(s)]);
  f.finish()
}

fn test_nested_loops() -> Func {
  let mut f = FuncBuilder::new("nested_loops");
  let i = f.vreg(ValueKind::Int);
  let j = f.vreg(ValueKind::Int);
  let s = f.vreg(ValueKind::Int);
  let t = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![i_move(int(0), i), i_move(int(0), s), i_goto("outer_head")],
  );
  f.block(
    "outer_head",
    vec![i_cmp(i, int(4)), i_branch(Condition::GreaterEqual, "exit")],
  );
  f.block("outer_body", vec![i_move(int(0), j), i_goto("inner_head")]);
  f.block(
    "inner_head",
    vec![i_cmp(j, int(3)), i_branch(Condition::GreaterEqual, "inner_exit")],
  );
  f.block(
    "inner_body",
    vec![
      i_mul(i, j, t),
      i_add(s, t, s),
      i_add(j, int(1), j),
      i_goto("inner_head"),
    ],
  );
  f.block(
    "inner_exit",
    vec![i_print(s), i_add(i, int(1), i), i_goto("outer_head")],
  );
  f.block("exit", vec![i_print(s), i_ret(s)]);
  f.finish()
}

/// Eight values live at the same time.
fn test_pressure() -> Func {
  let mut f = FuncBuilder::new("pressure");
  let vs: Vec<Operand> = (0..8).map(|_| f.vreg(ValueKind::Int)).collect();
  let sum = f.vreg(ValueKind::Int);
  let mut insts = Vec::new();
  for (n, &v) in vs.iter().enumerate() {
    insts.push(i_move(int(n as i32 * 3 + 1), v));
  }
  insts.push(i_move(int(0), sum));
  for &v in vs.iter().rev() {
    insts.push(i_add(sum, v, sum));
    insts.push(i_print(sum));
  }
  for &v in &vs {
    insts.push(i_print(v));
  }
  insts.push(i_ret(sum));
  f.block("start", insts);
  f.finish()
}

/// Insertion sort of six numbers in memory.
fn test_isort() -> Func {
  let mut f = FuncBuilder::new("isort");
  let n = 6;
  let i = f.vreg(ValueKind::Int);
  let j = f.vreg(ValueKind::Int);
  let j1 = f.vreg(ValueKind::Int);
  let key = f.vreg(ValueKind::Int);
  let t = f.vreg(ValueKind::Int);
  let k = f.vreg(ValueKind::Int);
  let x = f.vreg(ValueKind::Int);
  let zero = f.vreg(ValueKind::Int);

  let mut start = vec![i_move(int(0), zero)];
  for (addr, value) in [31, 4, 13, 30, 29, 1].iter().enumerate() {
    start.push(i_store(int(*value), at(zero, addr as i32)));
  }
  start.push(i_move(int(1), i));
  start.push(i_goto("outer_head"));
  f.block("start", start);

  f.block(
    "outer_head",
    vec![i_cmp(i, int(n)), i_branch(Condition::GreaterEqual, "done")],
  );
  f.block(
    "outer_body",
    vec![i_load(at(i, 0), key), i_sub(i, int(1), j), i_goto("inner_head")],
  );
  f.block(
    "inner_head",
    vec![i_cmp(j, int(0)), i_branch(Condition::Less, "inner_exit_a")],
  );
  f.block(
    "inner_test",
    vec![
      i_load(at(j, 0), t),
      i_cmp(t, key),
      i_branch(Condition::LessEqual, "inner_exit_b"),
    ],
  );
  f.block(
    "inner_body",
    vec![
      i_add(j, int(1), j1),
      i_store(t, at(j1, 0)),
      i_sub(j, int(1), j),
      i_goto("inner_head"),
    ],
  );
  f.block("inner_exit_a", vec![i_goto("inner_exit")]);
  f.block("inner_exit_b", vec![i_goto("inner_exit")]);
  f.block(
    "inner_exit",
    vec![
      i_add(j, int(1), j1),
      i_store(key, at(j1, 0)),
      i_add(i, int(1), i),
      i_goto("outer_head"),
    ],
  );
  f.block("done", vec![i_move(int(0), k), i_goto("print_head")]);
  f.block(
    "print_head",
    vec![i_cmp(k, int(n)), i_branch(Condition::GreaterEqual, "end")],
  );
  f.block(
    "print_body",
    vec![
      i_load(at(k, 0), x),
      i_print(x),
      i_add(k, int(1), k),
      i_goto("print_head"),
    ],
  );
  f.block("end", vec![i_ret(zero)]);
  f.finish()
}

/// Values live across calls, which destroy the caller-saved registers.
fn test_calls() -> Func {
  let mut f = FuncBuilder::new("calls");
  let a = f.vreg(ValueKind::Int);
  let b = f.vreg(ValueKind::Int);
  let c = f.vreg(ValueKind::Int);
  let s = f.vreg(ValueKind::Int);
  let t = f.vreg(ValueKind::Int);
  let u = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(1), a),
      i_move(int(2), b),
      i_move(int(3), c),
      i_call(CallTarget::Sum, vec![a, b], s),
      i_print(s),
      i_call(CallTarget::Sum, vec![s, c], t),
      i_print(t),
      i_print(a),
      i_print(b),
      i_call(CallTarget::Identity, vec![c], u),
      i_add(t, u, t),
      i_ret(t),
    ],
  );
  f.finish()
}

/// Long arithmetic; on 32-bit targets longs live in register pairs.
fn test_longs() -> Func {
  let mut f = FuncBuilder::new("longs");
  let i = f.vreg(ValueKind::Int);
  let a = f.vreg(ValueKind::Long);
  let b = f.vreg(ValueKind::Long);
  let c = f.vreg(ValueKind::Long);
  let d = f.vreg(ValueKind::Long);
  let e = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(3), i),
      i_convert(ConvertOp::I2L, i, a),
      i_move(long(1 << 40), b),
      i_add(a, b, c),
      i_mul(c, a, d),
      i_print(d),
      i_sub(d, b, d),
      i_print(c),
      i_convert(ConvertOp::L2I, d, e),
      i_print(e),
      i_ret(d),
    ],
  );
  f.finish()
}

fn test_floats() -> Func {
  let mut f = FuncBuilder::new("floats");
  let f0 = f.vreg(ValueKind::Float);
  let f1 = f.vreg(ValueKind::Float);
  let f2 = f.vreg(ValueKind::Float);
  let d0 = f.vreg(ValueKind::Double);
  let d1 = f.vreg(ValueKind::Double);
  let n = f.vreg(ValueKind::Int);
  let i = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(float(1.5), f0),
      i_move(float(2.25), f1),
      i_move(int(0), i),
      i_goto("head"),
    ],
  );
  f.block(
    "head",
    vec![i_cmp(i, int(3)), i_branch(Condition::GreaterEqual, "exit")],
  );
  f.block(
    "body",
    vec![
      i_mul(f0, f1, f2),
      i_print(f2),
      i_add(f0, f2, f0),
      i_add(i, int(1), i),
      i_goto("head"),
    ],
  );
  f.block(
    "exit",
    vec![
      i_convert(ConvertOp::F2D, f0, d0),
      i_add(d0, double(0.5), d1),
      i_print(d1),
      i_convert(ConvertOp::D2I, d1, n),
      i_print(f1),
      i_ret(n),
    ],
  );
  f.finish()
}

/// References live across safepoints and calls.
fn test_oops() -> Func {
  let mut f = FuncBuilder::new("oops");
  let o0 = f.vreg(ValueKind::Object);
  let o1 = f.vreg(ValueKind::Object);
  let i = f.vreg(ValueKind::Int);
  let s = f.vreg(ValueKind::Int);
  let x = f.vreg(ValueKind::Int);
  let y = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_call(CallTarget::NewObject, vec![], o0),
      i_call(CallTarget::NewObject, vec![], o1),
      i_store(int(11), at(o0, 0)),
      i_store(int(22), at(o1, 1)),
      i_move(int(0), i),
      i_move(int(0), s),
      i_goto("head"),
    ],
  );
  f.block(
    "head",
    vec![i_cmp(i, int(3)), i_branch(Condition::GreaterEqual, "exit")],
  );
  f.block(
    "body",
    vec![
      i_safepoint(state(1, vec![o0, o1, i], vec![])),
      i_load(at(o0, 0), x),
      i_load(at(o1, 1), y),
      i_add(s, x, s),
      i_add(s, y, s),
      i_call(CallTarget::Sum, vec![s, i], s),
      i_add(i, int(1), i),
      i_goto("head"),
    ],
  );
  f.block(
    "exit",
    vec![
      i_safepoint(state(2, vec![o1, s], vec![])),
      i_load(at(o1, 1), x),
      i_print(x),
      i_print(s),
      i_ret(s),
    ],
  );
  f.finish()
}

/// A locked object recorded in the debug info of a safepoint.
fn test_monitors() -> Func {
  let mut f = FuncBuilder::new("monitors");
  f.set_max_monitors(1);
  let o = f.vreg(ValueKind::Object);
  let v = f.vreg(ValueKind::Int);
  let l = f.vreg(ValueKind::Long);
  f.block(
    "start",
    vec![
      i_call(CallTarget::NewObject, vec![], o),
      i_move(int(5), v),
      i_move(long(-7), l),
      i_safepoint(state(3, vec![o, v, l, Operand::Illegal], vec![o])),
      i_print(v),
      i_print(l),
      i_ret(o),
    ],
  );
  f.finish()
}

/// A division by zero throws to a handler that reads a phi and a value live
/// across the exception edge.
fn test_exception() -> Func {
  let mut f = FuncBuilder::new("exception");
  let a = f.vreg(ValueKind::Int);
  let b = f.vreg(ValueKind::Int);
  let c = f.vreg(ValueKind::Int);
  let t = f.vreg(ValueKind::Int);
  let p = f.vreg(ValueKind::Int);
  let q = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(10), a),
      i_move(int(0), b),
      i_move(int(3), c),
      i_div(a, b, t)
        .with_info(state(4, vec![a, c], vec![]))
        .throws_to("catch", 0),
      i_print(t),
      i_ret(t),
    ],
  );
  f.handler(
    "catch",
    vec![Phi { operand: p, inputs: vec![c] }],
    vec![i_print(p), i_add(p, a, q), i_print(q), i_ret(q)],
  );
  f.finish()
}

/// Two throwing ops select different phi inputs, one of them a constant.
fn test_exception_sites() -> Func {
  let mut f = FuncBuilder::new("exception_sites");
  let x = f.vreg(ValueKind::Int);
  let y = f.vreg(ValueKind::Int);
  let z = f.vreg(ValueKind::Int);
  let r1 = f.vreg(ValueKind::Int);
  let r2 = f.vreg(ValueKind::Int);
  let p = f.vreg(ValueKind::Int);
  let q = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(5), x),
      i_move(int(0), y),
      i_move(int(7), z),
      i_div(x, int(1), r1).throws_to("catch", 0),
      i_print(r1),
      i_rem(z, y, r2).throws_to("catch", 1),
      i_print(r2),
      i_ret(r2),
    ],
  );
  f.handler(
    "catch",
    vec![
      Phi { operand: p, inputs: vec![x, z] },
      Phi { operand: q, inputs: vec![int(99), y] },
    ],
    vec![i_print(p), i_print(q), i_add(p, q, p), i_ret(p)],
  );
  f.finish()
}

/// Incoming arguments in stack slots.
fn test_args() -> Func {
  let mut f = FuncBuilder::new("args");
  let a0 = f.arg(Value::Int(7));
  let a1 = f.arg(Value::Long(1 << 33));
  let a2 = f.arg(Value::Int(35));
  let v0 = f.vreg(ValueKind::Int);
  let v1 = f.vreg(ValueKind::Long);
  let v2 = f.vreg(ValueKind::Int);
  let v3 = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(a0, v0),
      i_move(a1, v1),
      i_move(a2, v2),
      i_add(v0, v2, v3),
      i_print(v3),
      i_print(v1),
      i_call(CallTarget::Sum, vec![v0, v3], v3),
      i_print(v0),
      i_print(v2),
      i_ret(v3),
    ],
  );
  f.finish()
}

/// A value that must be produced in its stack slot, then used in a loop.
fn test_start_in_memory() -> Func {
  let mut f = FuncBuilder::new("start_in_memory");
  let v0 = f.vreg(ValueKind::Int);
  let v1 = f.vreg(ValueKind::Int);
  let i = f.vreg(ValueKind::Int);
  let s = f.vreg(ValueKind::Int);
  f.start_in_memory(v0);
  f.block(
    "start",
    vec![
      i_move(int(42), v1),
      i_move(v1, v0),
      i_move(int(0), i),
      i_move(int(0), s),
      i_goto("head"),
    ],
  );
  f.block(
    "head",
    vec![i_cmp(i, int(4)), i_branch(Condition::GreaterEqual, "exit")],
  );
  f.block("body", vec![i_add(s, v0, s), i_add(i, int(1), i), i_goto("head")]);
  f.block("exit", vec![i_print(s), i_ret(v0)]);
  f.finish()
}

fn test_cmove() -> Func {
  let mut f = FuncBuilder::new("cmove");
  let a = f.vreg(ValueKind::Int);
  let b = f.vreg(ValueKind::Int);
  let m = f.vreg(ValueKind::Int);
  f.block(
    "start",
    vec![
      i_move(int(17), a),
      i_move(int(4), b),
      i_cmp(a, b),
      i_cmove(Condition::Less, a, b, m),
      i_print(m),
      i_cmove(Condition::Greater, a, b, m),
      i_print(m),
      i_ret(m),
    ],
  );
  f.finish()
}

pub fn find_func(name: &str) -> Result<Func, Vec<String>> {
  let all_funcs = vec![
    test_straight_line(),
    test_diamond(),
    test_loop_sum(),
    test_nested_loops(),
    test_pressure(),
    test_isort(),
    test_calls(),
    test_longs(),
    test_floats(),
    test_oops(),
    test_monitors(),
    test_exception(),
    test_exception_sites(),
    test_args(),
    test_start_in_memory(),
    test_cmove(),
  ];

  let mut all_names = Vec::new();
  for cand in all_funcs {
    if cand.lir.name == *name {
      return Ok(cand);
    }
    all_names.push(cand.lir.name);
  }
  Err(all_names)
}
