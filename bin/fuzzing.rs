/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implements fuzzing primitives: a generator of random, well-formed
//! functions.
//!
//! Every virtual register is defined in the entry block, so that all uses
//! are dominated by a definition. Control flow is built from structured
//! regions (straight-line code, diamonds and counted loops), which never
//! produce critical edges. Divisions may throw to a single exception
//! handler placed at the end of the function.

use arbitrary::{Arbitrary, Result, Unstructured};
use lsra::{
  Address, ArithOp, CallTarget, Condition, ConvertOp, Operand, Phi, ValueKind,
};

use crate::test_framework::*;

pub const NUM_REAL_REGS_PER_RC: usize = 6;
const MAX_INT_VREGS: u8 = 12;
const MAX_FLOAT_VREGS: u8 = 4;
const MAX_OBJECT_VREGS: u8 = 3;
const MAX_DEPTH: u32 = 3;
const NUM_FIELDS: i32 = 4;

struct FuzzingEnv {
  f: FuncBuilder,
  ints: Vec<Operand>,
  floats: Vec<Operand>,
  objects: Vec<Operand>,
  /// Loop counters; never written by random ops.
  counters: Vec<Operand>,
  num_blocks: usize,
  cur_name: String,
  cur: Vec<Inst>,
  /// Phi inputs of the exception handler, one row per throwing op.
  handler_sites: Vec<Vec<Operand>>,
  num_handler_phis: usize,
}

impl FuzzingEnv {
  fn new_name(&mut self) -> String {
    self.num_blocks += 1;
    format!("b{}", self.num_blocks)
  }

  /// Ends the current block and starts `next`.
  fn flush(&mut self, next: String) {
    let insts = std::mem::replace(&mut self.cur, Vec::new());
    let name = std::mem::replace(&mut self.cur_name, next);
    self.f.block(&name, insts);
  }

  fn pick(u: &mut Unstructured, from: &[Operand]) -> Result<Operand> {
    Ok(from[usize::arbitrary(u)? % from.len()])
  }

  fn int(&self, u: &mut Unstructured) -> Result<Operand> {
    Self::pick(u, &self.ints)
  }

  fn int_or_const(&self, u: &mut Unstructured) -> Result<Operand> {
    Ok(if u8::arbitrary(u)? % 4 == 0 {
      int(i8::arbitrary(u)? as i32)
    } else {
      self.int(u)?
    })
  }

  fn any_value(&self, u: &mut Unstructured) -> Result<Operand> {
    Ok(match u8::arbitrary(u)? % 4 {
      0 if !self.floats.is_empty() => Self::pick(u, &self.floats)?,
      1 if !self.objects.is_empty() => Self::pick(u, &self.objects)?,
      2 => {
        let readable: Vec<Operand> =
          self.counters.iter().chain(self.ints.iter()).copied().collect();
        Self::pick(u, &readable)?
      }
      _ => self.int(u)?,
    })
  }

  fn field(&self, u: &mut Unstructured) -> Result<Option<Address>> {
    if self.objects.is_empty() {
      return Ok(None);
    }
    let base = Self::pick(u, &self.objects)?;
    Ok(Some(Address::new(base, (u8::arbitrary(u)? as i32) % NUM_FIELDS)))
  }

  fn inst(&mut self, u: &mut Unstructured) -> Result<Inst> {
    const NUM_VARIANTS: u8 = 12;
    Ok(match u8::arbitrary(u)? % NUM_VARIANTS {
      0 => i_move(self.int_or_const(u)?, self.int(u)?),
      1 | 2 => {
        let op = match u8::arbitrary(u)? % 6 {
          0 => ArithOp::Add,
          1 => ArithOp::Sub,
          2 => ArithOp::Mul,
          3 => ArithOp::And,
          4 => ArithOp::Xor,
          _ => ArithOp::Or,
        };
        i_op2(op, self.int(u)?, self.int_or_const(u)?, self.int(u)?)
      }
      3 => i_print(self.any_value(u)?),
      4 => {
        let mut args = Vec::new();
        for _ in 0..u8::arbitrary(u)? % 3 {
          args.push(self.int(u)?);
        }
        i_call(CallTarget::Sum, args, self.int(u)?)
      }
      5 => {
        let mut locals = Vec::new();
        for _ in 0..u8::arbitrary(u)? % 4 {
          locals.push(self.any_value(u)?);
        }
        i_safepoint(state(u8::arbitrary(u)? as i32, locals, vec![]))
      }
      6 if !self.floats.is_empty() => {
        let op = if bool::arbitrary(u)? { ArithOp::Add } else { ArithOp::Mul };
        let floats = &self.floats;
        let left = Self::pick(u, floats)?;
        let right = Self::pick(u, floats)?;
        i_op2(op, left, right, Self::pick(u, floats)?)
      }
      7 if !self.floats.is_empty() => {
        if bool::arbitrary(u)? {
          i_convert(ConvertOp::I2F, self.int(u)?, Self::pick(u, &self.floats)?)
        } else {
          i_convert(ConvertOp::F2I, Self::pick(u, &self.floats)?, self.int(u)?)
        }
      }
      8 => match self.field(u)? {
        Some(addr) => i_store(self.int_or_const(u)?, addr),
        None => i_print(self.int(u)?),
      },
      9 => match self.field(u)? {
        Some(addr) => i_load(addr, self.int(u)?),
        None => i_print(self.int(u)?),
      },
      10 => {
        let op = if bool::arbitrary(u)? { ArithOp::Div } else { ArithOp::Rem };
        let inst = i_op2(op, self.int(u)?, self.int(u)?, self.int(u)?);
        if self.num_handler_phis > 0 && bool::arbitrary(u)? {
          let mut inputs = Vec::new();
          for _ in 0..self.num_handler_phis {
            inputs.push(self.int_or_const(u)?);
          }
          let site = self.handler_sites.len();
          self.handler_sites.push(inputs);
          let mut locals = Vec::new();
          for _ in 0..u8::arbitrary(u)? % 3 {
            locals.push(self.any_value(u)?);
          }
          inst
            .with_info(state(site as i32, locals, vec![]))
            .throws_to("handler", site)
        } else {
          // Keep the divisor away from zero.
          let divisor = int(1 + (u8::arbitrary(u)? % 7) as i32);
          i_op2(op, self.int(u)?, divisor, self.int(u)?)
        }
      }
      _ => {
        let a = self.int(u)?;
        let b = self.int_or_const(u)?;
        let cond = self.cond(u)?;
        let dst = self.int(u)?;
        self.cur.push(i_cmp(a, b));
        i_cmove(cond, a, b, dst)
      }
    })
  }

  fn cond(&self, u: &mut Unstructured) -> Result<Condition> {
    Ok(match u8::arbitrary(u)? % 6 {
      0 => Condition::Equal,
      1 => Condition::NotEqual,
      2 => Condition::Less,
      3 => Condition::LessEqual,
      4 => Condition::Greater,
      _ => Condition::GreaterEqual,
    })
  }

  fn straight(&mut self, u: &mut Unstructured) -> Result<()> {
    for _ in 0..1 + u8::arbitrary(u)? % 6 {
      let inst = self.inst(u)?;
      self.cur.push(inst);
    }
    Ok(())
  }

  fn region(&mut self, u: &mut Unstructured, depth: u32) -> Result<()> {
    let kind = if depth >= MAX_DEPTH { 0 } else { u8::arbitrary(u)? % 4 };
    match kind {
      // Diamond.
      1 => {
        let then_name = self.new_name();
        let else_name = self.new_name();
        let join_name = self.new_name();
        let a = self.int(u)?;
        let b = self.int_or_const(u)?;
        let cond = self.cond(u)?;
        self.cur.push(i_cmp(a, b));
        self.cur.push(i_branch(cond, &else_name));
        self.flush(then_name);
        self.regions(u, depth + 1)?;
        self.cur.push(i_goto(&join_name));
        self.flush(else_name);
        self.regions(u, depth + 1)?;
        self.cur.push(i_goto(&join_name));
        self.flush(join_name);
      }
      // Counted loop.
      2 => {
        let counter = self.f.vreg(ValueKind::Int);
        let head_name = self.new_name();
        let body_name = self.new_name();
        let exit_name = self.new_name();
        let trips = 1 + (u8::arbitrary(u)? % 4) as i32;
        self.cur.push(i_move(int(0), counter));
        self.cur.push(i_goto(&head_name));
        self.flush(head_name.clone());
        self.cur.push(i_cmp(counter, int(trips)));
        self.cur.push(i_branch(Condition::GreaterEqual, &exit_name));
        self.flush(body_name);
        self.counters.push(counter);
        self.regions(u, depth + 1)?;
        self.counters.pop();
        self.cur.push(i_add(counter, int(1), counter));
        self.cur.push(i_goto(&head_name));
        self.flush(exit_name);
      }
      _ => self.straight(u)?,
    }
    Ok(())
  }

  fn regions(&mut self, u: &mut Unstructured, depth: u32) -> Result<()> {
    for _ in 0..1 + u8::arbitrary(u)? % 3 {
      self.region(u, depth)?;
    }
    Ok(())
  }
}

impl<'a> Arbitrary<'a> for Func {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<Func> {
    let mut f = FuncBuilder::new("funk");
    let num_ints = 1 + u8::arbitrary(u)? % MAX_INT_VREGS;
    let num_floats = u8::arbitrary(u)? % (MAX_FLOAT_VREGS + 1);
    let num_objects = u8::arbitrary(u)? % (MAX_OBJECT_VREGS + 1);
    let mut vregs = |n: u8, kind: ValueKind| -> Vec<Operand> {
      (0..n).map(|_| f.vreg(kind)).collect()
    };
    let ints = vregs(num_ints, ValueKind::Int);
    let floats = vregs(num_floats, ValueKind::Float);
    let objects = vregs(num_objects, ValueKind::Object);

    let mut entry = Vec::new();
    for &v in &ints {
      entry.push(i_move(int(i8::arbitrary(u)? as i32), v));
    }
    for &v in &floats {
      entry.push(i_move(float(i8::arbitrary(u)? as f32 / 4.0), v));
    }
    for &o in &objects {
      entry.push(i_call(CallTarget::NewObject, vec![], o));
      for field in 0..NUM_FIELDS {
        entry.push(i_store(int(field), Address::new(o, field)));
      }
    }

    let num_handler_phis = (u8::arbitrary(u)? % 3) as usize;
    let handler_phis: Vec<Operand> =
      (0..num_handler_phis).map(|_| f.vreg(ValueKind::Int)).collect();

    let mut env = FuzzingEnv {
      f,
      ints,
      floats,
      objects,
      counters: Vec::new(),
      num_blocks: 0,
      cur_name: "entry".to_string(),
      cur: entry,
      handler_sites: Vec::new(),
      num_handler_phis,
    };

    env.regions(u, 0)?;
    let ret = env.int(u)?;
    for &v in &env.ints.clone() {
      env.cur.push(i_print(v));
    }
    env.cur.push(i_ret(ret));
    env.flush(String::new());

    if !env.handler_sites.is_empty() {
      let phis: Vec<Phi> = handler_phis
        .iter()
        .enumerate()
        .map(|(i, &operand)| Phi {
          operand,
          inputs: env.handler_sites.iter().map(|site| site[i]).collect(),
        })
        .collect();
      let mut insts: Vec<Inst> =
        handler_phis.iter().map(|&p| i_print(p)).collect();
      insts.push(i_ret(env.ints[0]));
      env.f.handler("handler", phis, insts);
    }

    Ok(env.f.finish())
  }
}
