/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the lsra library: a linear scan
//! register allocator for the low-level IR of a method JIT.

// Make the analysis module public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod analysis;
#[cfg(not(feature = "fuzzing"))]
mod analysis;

mod assign;
mod bitset;
mod builder;
mod checker;
mod data_structures;
mod inst_stream;
mod interface;
mod interval;
mod linear_scan;
mod lir;
mod move_resolver;
mod resolve;
mod spill_moves;
mod verifier;
mod walker;

#[cfg(test)]
mod test_util;

pub use crate::interface::*;
