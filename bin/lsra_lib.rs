/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test harness for the lsra library: a function builder, an interpreter
//! for the LIR, hand-written test cases and a random function generator.

pub mod fuzzing;
pub mod test_cases;
pub mod test_framework;
