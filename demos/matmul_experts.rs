//! Matmul through a handful of experts, printing the compiled loop nests
//!
//! `C[m, n] = sum_k A[m, k] * B[k, n]` over the domain `mnk`, at one evenly
//! divisible and one ragged size. Each expert's IR is printed before the
//! harness compiles, runs and checks it.
//!
//! Run with: cargo run --example matmul_experts

use codegen_experts::compiler::compile;
use codegen_experts::harness::{Harness, HarnessConfig};
use codegen_experts::printer::render;
use codegen_experts::{
    test_sizes, EinsumProblem, ElemType, Expert, Fuse, ProblemError, ProblemSizes, Tile,
    Vectorize,
};

const FN: &str = "matmul";
const OP: &str = "linalg.generic";

fn make_problem(_sizes: &ProblemSizes, _types: &[ElemType]) -> Result<EinsumProblem, ProblemError> {
    EinsumProblem::new("mk,kn", "mnk", 2)
}

fn experts() -> Vec<Expert> {
    vec![
        Expert::test_expert("no_tiling", vec![], FN),
        Expert::test_expert(
            "tile_pad",
            vec![
                Tile::new(FN, OP)
                    .tile_sizes([8, 8, 4])
                    .pad(true)
                    .pack_paddings([1, 1, 1])
                    .hoist_paddings([2, 1, 0])
                    .into(),
                Vectorize::new(FN, OP).into(),
            ],
            FN,
        ),
        Expert::test_expert(
            "fuse_peel",
            vec![
                Fuse::new(FN, OP).tile_sizes([8, 8]).into(),
                Tile::new(FN, OP).tile_sizes([4, 4, 4]).peel([0, 1, 2]).into(),
                Vectorize::new(FN, OP).into(),
                Vectorize::new(FN, "linalg.fill").into(),
            ],
            FN,
        ),
    ]
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let sizes = test_sizes(&["m", "n", "k"], &[vec![32, 32, 16], vec![30, 29, 17]])?;
    let types = vec![vec![ElemType::F32; 3]];
    let experts = experts();

    println!("======================================================================");
    println!("  Matmul experts");
    println!("======================================================================");
    for expert in &experts {
        let compiled = compile(
            &make_problem(&sizes[1], &types[0])?,
            &sizes[1],
            &types[0],
            FN,
            &expert.transforms,
        )?;
        println!("\n--- {} at {} ---", expert.name, sizes[1]);
        print!("{}", render(&compiled.kernel));
    }
    println!();

    let config = HarnessConfig {
        function_name: FN.to_string(),
        n_iters: 3,
        ..HarnessConfig::default()
    };
    let report = Harness::new(config).run(make_problem, &types, &sizes, &experts)?;
    if !report.passed() {
        return Err(format!("{} cases failed", report.failures().count()).into());
    }
    Ok(())
}
