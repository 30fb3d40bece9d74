//! Harness runs beyond matvec: a matmul problem with experts loaded from JSON,
//! IR dumps and the JSON report.

use codegen_experts::harness::{CaseStatus, Harness, HarnessConfig, HarnessReport};
use codegen_experts::{
    EinsumProblem, ElemType, Expert, Fuse, Generalize, ProblemSizes, Tile, Vectorize,
};
use std::fs;
use tempfile::TempDir;

const FN: &str = "matmul";
const OP: &str = "linalg.generic";

fn matmul_experts() -> Vec<Expert> {
    vec![
        Expert::test_expert("untiled", vec![], FN),
        Expert::test_expert(
            "tile_pad_hoist",
            vec![
                Tile::new(FN, OP)
                    .tile_sizes([4, 4, 4])
                    .pad(true)
                    .pack_paddings([1, 1, 1])
                    .hoist_paddings([1, 1, 0])
                    .into(),
                Vectorize::new(FN, OP).into(),
            ],
            FN,
        ),
        Expert::test_expert(
            "fuse_tile_peel",
            vec![
                Fuse::new(FN, OP).tile_sizes([4, 8]).into(),
                Tile::new(FN, OP).tile_sizes([2, 4, 3]).peel([0, 1, 2]).into(),
                Vectorize::new(FN, OP).into(),
                Vectorize::new(FN, "linalg.fill").into(),
            ],
            FN,
        ),
        Expert::test_expert(
            "reduction_outer",
            vec![
                Tile::new(FN, OP)
                    .tile_sizes([8, 8, 4])
                    .tile_interchange([2, 0, 1])
                    .into(),
                Generalize::new(FN, OP).iterator_interchange([0, 2, 1]).into(),
                Tile::new(FN, OP).scalarize_dyn_dims(true).into(),
            ],
            FN,
        ),
    ]
}

fn matmul_sizes() -> Vec<ProblemSizes> {
    vec![
        ProblemSizes::parse("m=16,n=24,k=8").unwrap(),
        ProblemSizes::parse("m=17,n=23,k=9").unwrap(),
    ]
}

fn run_matmul(config: HarnessConfig, experts: &[Expert]) -> HarnessReport {
    let _ = env_logger::builder().is_test(true).try_init();
    Harness::new(config)
        .run(
            |_, _| EinsumProblem::new("mk,kn", "mnk", 2),
            &[vec![ElemType::F32; 3]],
            &matmul_sizes(),
            experts,
        )
        .expect("harness run")
}

fn matmul_config() -> HarnessConfig {
    HarnessConfig {
        function_name: FN.to_string(),
        ..HarnessConfig::default()
    }
}

#[test]
fn test_matmul_experts_from_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("experts.json");
    fs::write(&path, serde_json::to_string_pretty(&matmul_experts()).unwrap()).unwrap();
    let experts: Vec<Expert> =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

    let report = run_matmul(matmul_config(), &experts);
    assert_eq!(report.cases.len(), 8);
    for case in &report.cases {
        assert!(case.passed(), "{} at {}: {}", case.expert, case.sizes, case.status);
    }
}

#[test]
fn test_dump_and_report_files() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("ir");
    let report_path = dir.path().join("report.json");
    let config = HarnessConfig {
        dump_ir_dir: Some(dump.clone()),
        report_path: Some(report_path.clone()),
        n_iters: 2,
        ..matmul_config()
    };

    let report = run_matmul(config, &matmul_experts()[..2]);
    assert!(report.passed());

    let ir = fs::read_to_string(dump.join("matmul_tile_pad_hoist_m16_n24_k8.mlir")).unwrap();
    assert!(ir.starts_with("func @matmul("));
    assert!(ir.contains("pad #0"));
    assert_eq!(fs::read_dir(&dump).unwrap().count(), 4);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["function_name"], "matmul");
    assert_eq!(json["cases"].as_array().unwrap().len(), 4);
    assert_eq!(json["cases"][0]["status"], "passed");
    assert_eq!(json["cases"][1]["timings_ms"].as_array().unwrap().len(), 2);
}

#[test]
fn test_compile_error_fails_the_case() {
    // vector ops cannot reach LLVM without the vector lowering stages; only the
    // evenly divisible size produces static tiles and therefore vector ops
    let broken = Expert::new(
        "no_lowering",
        vec![
            Tile::new(FN, OP).tile_sizes([4, 4, 4]).into(),
            Vectorize::new(FN, OP).into(),
            codegen_experts::Transform::Bufferize,
            codegen_experts::Transform::LowerToLlvm,
        ]
        .into(),
    );
    let report = run_matmul(matmul_config(), &[broken]);

    assert!(!report.passed());
    assert_eq!(report.failures().count(), 1);
    assert!(matches!(
        report.cases[0].status,
        CaseStatus::CompileFailed { .. }
    ));
    assert_eq!(report.cases[1].status, CaseStatus::Passed);
}

#[test]
fn test_wrong_function_name_leaves_kernel_untransformed() {
    // anchors on another function are skipped, so the kernel still computes correctly
    let config = HarnessConfig {
        function_name: "other".to_string(),
        ..matmul_config()
    };
    let report = run_matmul(config, &matmul_experts()[1..2]);
    assert!(report.passed());
    let stats = report.cases[0].ir_stats.unwrap();
    assert_eq!(stats.loops, 0);
}
