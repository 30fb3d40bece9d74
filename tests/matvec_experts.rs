//! End-to-end runs of the twelve matvec experts
//!
//! Every (expert, size) case is compiled, executed on seeded inputs and checked
//! against the reference contraction. None of the 24 cases may fail.

use codegen_experts::harness::{CaseStatus, HarnessConfig};
use codegen_experts::matvec;

fn quiet_config() -> HarnessConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    matvec::config()
}

#[test]
fn test_all_cases_pass() {
    let report = matvec::run(quiet_config()).expect("harness run");

    assert_eq!(report.cases.len(), 24);
    for case in &report.cases {
        assert_eq!(
            case.status,
            CaseStatus::Passed,
            "{} at {} failed",
            case.expert,
            case.sizes
        );
        assert_eq!(case.timings_ms.len(), matvec::N_ITERS);
    }
    assert!(report.passed());
    assert_eq!(report.failures().count(), 0);
}

#[test]
fn test_entry_point_passes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let report = matvec::main().expect("matvec entry point");

    assert_eq!(report.function_name, matvec::FUNCTION_NAME);
    assert_eq!(report.n_iters, matvec::N_ITERS);
    assert_eq!(report.cases.len(), 24);
    assert!(report.passed());
    assert!(report.check().is_ok());
}

#[test]
fn test_cases_reported_in_declaration_order() {
    let report = matvec::run(quiet_config()).expect("harness run");
    let experts = matvec::all_experts();

    for (i, case) in report.cases.iter().enumerate() {
        assert_eq!(case.expert, experts[i % experts.len()].name);
        let expected_m = if i < experts.len() { 24 } else { 27 };
        assert_eq!(case.sizes.get("m"), Some(expected_m));
    }
}

#[test]
fn test_parallel_run_is_deterministic() {
    let serial = matvec::run(quiet_config()).expect("serial run");
    let parallel = matvec::run(HarnessConfig {
        parallel: true,
        ..quiet_config()
    })
    .expect("parallel run");

    assert_eq!(serial.cases.len(), parallel.cases.len());
    for (a, b) in serial.cases.iter().zip(&parallel.cases) {
        assert_eq!(a.expert, b.expert);
        assert_eq!(a.status, b.status);
        assert_eq!(a.ir_stats, b.ir_stats);
        assert_eq!(a.exec_stats, b.exec_stats);
    }
}

#[test]
fn test_hoisted_padding_reuses_packs() {
    let report = matvec::run(quiet_config()).expect("harness run");
    let hoisted: Vec<_> = report
        .cases
        .iter()
        .filter(|c| c.expert == "tile_1_pad_hoist")
        .collect();
    assert_eq!(hoisted.len(), 2);

    // x is packed once per n tile; later m tiles reuse it
    let small = hoisted[0].exec_stats.expect("stats");
    assert_eq!(small.pack_reuses, 2 * 2);
    let large = hoisted[1].exec_stats.expect("stats");
    assert_eq!(large.pack_reuses, 2 * 3);
}

#[test]
fn test_vectorization_depends_on_static_tiles() {
    let report = matvec::run(quiet_config()).expect("harness run");
    let stats = |expert: &str, m: usize| {
        report
            .cases
            .iter()
            .find(|c| c.expert == expert && c.sizes.get("m") == Some(m))
            .and_then(|c| c.ir_stats)
            .expect("case present")
    };

    // 32 is not a multiple of 24, so the n tiles are dynamic
    assert_eq!(stats("tile_1", 24).vector_ops, 0);
    // padding makes every tile static
    assert_eq!(stats("tile_1_pad", 24).vector_ops, 1);
    assert_eq!(stats("tile_1_pad", 27).vector_ops, 1);
    // untiled kernels are static and get no vectorization step
    assert_eq!(stats("no_tiling", 24).vector_ops, 0);
    // the peeled main body and remainder are both static
    assert_eq!(stats("tile_1_peel_scalarize", 27).vector_ops, 2);
    // the fused fill sees full 8-wide m tiles; the generic's n tiles of 3 over 4 are ragged
    assert_eq!(stats("fuse_2_tile_1", 24).vector_ops, 1);
}
