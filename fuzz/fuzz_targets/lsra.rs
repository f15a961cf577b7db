#![no_main]
use libfuzzer_sys::fuzz_target;

use lsra;
use lsra_util::{self, test_framework as ir};

static mut COUNTER_GEN: usize = 0;
static mut COUNTER_OK: usize = 0;

fuzz_target!(|func: ir::Func| {
    let (num_gen, num_ok) = unsafe {
        COUNTER_GEN += 1;
        (COUNTER_GEN, COUNTER_OK)
    };

    println!(
        "=== status: #ok/#total: {}/{} == {} ",
        num_ok,
        num_gen,
        100.0 * (num_ok as f64) / (num_gen as f64)
    );

    let mut func = func;
    let num_regs = lsra_util::fuzzing::NUM_REAL_REGS_PER_RC;
    let regs = ir::make_register_file(num_regs, num_regs, true);

    let expected = ir::run_func(
        &func,
        "Before allocation",
        &regs,
        ir::RunStage::BeforeRegalloc,
    );
    if expected.is_err() {
        return;
    }

    let original_func = func.clone();
    let opts = lsra::Options { run_verifier: true, run_checker: true };
    match func.allocate(&regs, opts) {
        Ok(_) => unsafe {
            COUNTER_OK += 1;
        },
        Err(err) => {
            if let lsra::RegAllocError::RegChecker(_)
            | lsra::RegAllocError::Verifier(_) = &err
            {
                original_func.print("func:");
                panic!("fuzz_targets/lsra.rs: checker error: {}", err);
            }
            println!("allocation error: {}", err);
            return;
        }
    }

    let observed = ir::run_func(
        &func,
        "After allocation",
        &regs,
        ir::RunStage::AfterRegalloc,
    );
    let (expected, observed) = match (expected, observed) {
        (Ok(expected), Ok(observed)) => (expected, observed),
        (_, Err(err)) => {
            original_func.print("func:");
            panic!("allocated code failed: {}", err);
        }
        _ => unreachable!(),
    };
    assert_eq!(expected.ret_value, observed.ret_value);
    assert_eq!(expected.stdout, observed.stdout);
});
