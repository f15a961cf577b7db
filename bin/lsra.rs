/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use lsra::Options;
use lsra_util::test_framework::{
  make_register_file, run_func, Func, RunResult, RunStage,
};

use clap;
use log::{self, error, info};
use pretty_env_logger;

use std::fs::File;
use std::io::{BufReader, BufWriter};

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("lsra")
    .about("a simple program to allow separate testing of the lsra allocator")
    .arg(
      clap::Arg::new("iregs")
        .short('i')
        .takes_value(true)
        .help("number of integer registers available (8 if not set)"),
    )
    .arg(
      clap::Arg::new("fregs")
        .short('f')
        .takes_value(true)
        .help("number of floating-point registers available (4 if not set)"),
    )
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .required_unless_present("load")
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("64bit")
        .long("64")
        .help("longs and objects take a single register"),
    )
    .arg(
      clap::Arg::new("save")
        .long("save")
        .takes_value(true)
        .help("write the function to the given file before allocation"),
    )
    .arg(
      clap::Arg::new("load")
        .long("load")
        .takes_value(true)
        .conflicts_with("test")
        .help("read the function from the given file (see --save)"),
    )
    .arg(
      clap::Arg::new("no-verify")
        .long("no-verify")
        .help("skip the interval verifier and the checker"),
    );
  let matches = app.get_matches();

  let mut func = if let Some(path) = matches.value_of("load") {
    match load_func(path) {
      Ok(func) => func,
      Err(err) => {
        error!("can't load Func from '{}': {}", path, err);
        return;
      }
    }
  } else {
    let func_name = matches.value_of("test").unwrap_or_default();
    match lsra_util::test_cases::find_func(func_name) {
      Ok(func) => func,
      Err(available_func_names) => {
        error!("can't find Func with name '{}'", func_name);
        println!("available func names are:");
        for name in available_func_names {
          println!("     {}", name);
        }
        return;
      }
    }
  };

  if let Some(path) = matches.value_of("save") {
    if let Err(err) = save_func(&func, path) {
      error!("can't save Func to '{}': {}", path, err);
      return;
    }
    info!("saved Func '{}' to '{}'", func.lir.name, path);
  }

  let (num_cpu, num_fpu) = match (
    matches.value_of("iregs").unwrap_or("8").parse::<usize>(),
    matches.value_of("fregs").unwrap_or("4").parse::<usize>(),
  ) {
    (Ok(num_cpu), Ok(num_fpu)) => (num_cpu, num_fpu),
    _other => {
      println!("invalid iregs/fregs values");
      return;
    }
  };

  let regs = make_register_file(num_cpu, num_fpu, matches.is_present("64bit"));
  let options = if matches.is_present("no-verify") {
    Options { run_verifier: false, run_checker: false }
  } else {
    Options { run_verifier: true, run_checker: true }
  };

  func.print("before allocation");

  // Just so we can run it later.
  let original_func = func.clone();

  let result = match func.allocate(&regs, options) {
    Err(e) => {
      println!("allocation failed: {}", e);
      return;
    }
    Ok(r) => r,
  };
  info!(
    "allocated: {} intervals, {} split children, {} spill slots, {} moves",
    result.num_intervals,
    result.num_split_children,
    result.num_spill_slots,
    result.num_inserted_moves
  );

  func.print("after allocation");

  let before_regalloc_result = run_func(
    &original_func,
    "Before allocation",
    &regs,
    RunStage::BeforeRegalloc,
  );
  let after_regalloc_result =
    run_func(&func, "After allocation", &regs, RunStage::AfterRegalloc);

  println!();

  check_results(before_regalloc_result, after_regalloc_result);
}

fn load_func(path: &str) -> Result<Func, String> {
  let file = File::open(path).map_err(|e| e.to_string())?;
  bincode::deserialize_from(BufReader::new(file)).map_err(|e| e.to_string())
}

fn save_func(func: &Func, path: &str) -> Result<(), String> {
  let file = File::create(path).map_err(|e| e.to_string())?;
  bincode::serialize_into(BufWriter::new(file), func).map_err(|e| e.to_string())
}

fn check_results(
  before_regalloc_result: Result<RunResult, String>,
  after_regalloc_result: Result<RunResult, String>,
) {
  match before_regalloc_result {
    Ok(before_regalloc_result) => {
      let after_regalloc_result = after_regalloc_result
        .expect("code after regalloc should have succeeded");

      // Inserted moves only add steps.
      assert!(
        before_regalloc_result.num_steps <= after_regalloc_result.num_steps,
        "inconsistent trace"
      );

      assert_eq!(
        before_regalloc_result.ret_value, after_regalloc_result.ret_value,
        "Incorrect interpreter result: expected {:?}, observed {:?}",
        before_regalloc_result.ret_value, after_regalloc_result.ret_value
      );

      assert_eq!(
        before_regalloc_result.stdout, after_regalloc_result.stdout,
        r#"Different stdout values before/after regalloc:
- before:
{}
-after:
{}
        "#,
        before_regalloc_result.stdout, after_regalloc_result.stdout
      );
    }

    Err(err) => {
      assert_eq!(err, after_regalloc_result.unwrap_err());
    }
  }
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use lsra::{RegAllocError, RegAllocResult};
  use lsra_util::test_cases;

  pub fn run(
    func_name: &str, num_cpu: usize, num_fpu: usize, is_64bit: bool,
  ) -> Result<RegAllocResult, RegAllocError> {
    let _ = pretty_env_logger::try_init();
    let mut func = test_cases::find_func(func_name).unwrap();
    let regs = make_register_file(num_cpu, num_fpu, is_64bit);
    func.allocate(&regs, Options { run_verifier: true, run_checker: true })
  }

  pub fn check(
    func_name: &str, num_cpu: usize, num_fpu: usize, is_64bit: bool,
  ) -> RegAllocResult {
    let _ = pretty_env_logger::try_init();
    let mut func = test_cases::find_func(func_name).unwrap();
    let regs = make_register_file(num_cpu, num_fpu, is_64bit);
    let before_regalloc_result =
      run_func(&func, "Before allocation", &regs, RunStage::BeforeRegalloc);
    func.print("BEFORE");
    let result = func
      .allocate(&regs, Options { run_verifier: true, run_checker: true })
      .unwrap_or_else(|err| {
        panic!("allocation failed: {}", err);
      });
    func.print("AFTER");
    let after_regalloc_result =
      run_func(&func, "After allocation", &regs, RunStage::AfterRegalloc);
    check_results(before_regalloc_result, after_regalloc_result);
    result
  }

  /// Runs the test case with decreasing numbers of integer registers.
  pub fn check_down_to(func_name: &str, min_cpu: usize) {
    for num_cpu in (min_cpu..=8).rev() {
      check(func_name, num_cpu, 4, true);
    }
  }
}

#[test]
fn straight_line() {
  test_utils::check_down_to("straight_line", 2);
}

#[test]
fn diamond() {
  test_utils::check_down_to("diamond", 2);
}

#[test]
fn loop_sum() {
  test_utils::check_down_to("loop_sum", 2);
}

#[test]
fn nested_loops() {
  test_utils::check_down_to("nested_loops", 3);
}

#[test]
fn pressure() {
  let roomy = test_utils::check("pressure", 12, 4, true);
  assert_eq!(roomy.num_spill_slots, 0);
  let tight = test_utils::check("pressure", 3, 4, true);
  assert!(tight.num_spill_slots > 0);
  assert!(tight.num_split_children > 0);
  test_utils::check_down_to("pressure", 3);
}

#[test]
fn isort() {
  test_utils::check_down_to("isort", 3);
}

#[test]
fn calls() {
  test_utils::check_down_to("calls", 3);
}

#[test]
fn longs() {
  test_utils::check_down_to("longs", 3);
  // Register pairs.
  test_utils::check("longs", 8, 4, false);
  test_utils::check("longs", 6, 4, false);
}

#[test]
fn floats() {
  test_utils::check("floats", 8, 4, true);
  test_utils::check("floats", 8, 2, true);
}

#[test]
fn oops() {
  test_utils::check_down_to("oops", 3);
}

#[test]
fn monitors() {
  test_utils::check_down_to("monitors", 3);
}

#[test]
fn exception() {
  test_utils::check_down_to("exception", 3);
}

#[test]
fn exception_sites() {
  test_utils::check_down_to("exception_sites", 3);
}

#[test]
fn args() {
  test_utils::check_down_to("args", 3);
  test_utils::check("args", 8, 4, false);
}

#[test]
fn start_in_memory() {
  test_utils::check_down_to("start_in_memory", 3);
}

#[test]
fn cmove() {
  test_utils::check_down_to("cmove", 3);
}

#[test]
fn unknown_test_case() {
  let names = lsra_util::test_cases::find_func("no_such_func").unwrap_err();
  assert!(names.iter().any(|name| name == "isort"));
}

#[test]
fn allocation_is_deterministic() {
  let a = test_utils::run("pressure", 3, 4, true).unwrap();
  let b = test_utils::run("pressure", 3, 4, true).unwrap();
  assert_eq!(a, b);
}
