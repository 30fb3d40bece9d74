//! Matrix-vector product driven through twelve compilation experts
//!
//! `y[m] = sum_n A[m, n] * x[n]`, expressed as the einsum `"mn,n"` iterated
//! over the domain `"mn"`. Each expert tiles, fuses, pads, or vectorizes the
//! kernel differently before the shared bufferize/lower suffix; all of them
//! must produce the reference result at both problem sizes.

use crate::experts::Expert;
use crate::harness::{Harness, HarnessConfig, HarnessError, HarnessReport};
use crate::problem::{test_sizes, EinsumProblem, ElemType, ProblemError, ProblemSizes};
use crate::transforms::{Fuse, Generalize, Tile, Transform, Vectorize};

pub const FUNCTION_NAME: &str = "matvec";
pub const OP_NAME: &str = "linalg.generic";
pub const FILL_OP_NAME: &str = "linalg.fill";

/// Size keys, in the order of each entry of [`PROBLEM_SIZE_LIST`]
pub const KEYS: [&str; 2] = ["m", "n"];
pub const PROBLEM_SIZE_LIST: [[usize; 2]; 2] = [[24, 32], [27, 37]];
pub const N_ITERS: usize = 1;

fn generic_tile() -> Tile {
    Tile::new(FUNCTION_NAME, OP_NAME)
}

fn vectorize() -> Vectorize {
    Vectorize::new(FUNCTION_NAME, OP_NAME)
}

/// The twelve matvec experts, in reporting order
pub fn all_experts() -> Vec<Expert> {
    let tile_3_pad_hoist_peel: Vec<Transform> = vec![
        generic_tile().tile_sizes([8, 24]).pad(false).into(),
        generic_tile()
            .tile_sizes([4, 12])
            .pad(true)
            .pack_paddings([1, 1, 1])
            .hoist_paddings([6, 6, 6])
            .into(),
        generic_tile().tile_sizes([2, 7]).peel([0, 1]).into(),
    ];
    let mut tile_3_pad_hoist_peel_scalarize = tile_3_pad_hoist_peel.clone();
    tile_3_pad_hoist_peel_scalarize.push(generic_tile().scalarize_dyn_dims(true).into());

    let with_vectorize = |mut tiling: Vec<Transform>| {
        tiling.push(vectorize().into());
        tiling
    };

    let experts: Vec<(&str, Vec<Transform>)> = vec![
        ("no_tiling", vec![]),
        (
            "tile_1",
            vec![
                generic_tile().tile_sizes([8, 24]).into(),
                vectorize().into(),
            ],
        ),
        (
            "tile_and_interchange_1",
            vec![
                generic_tile()
                    .tile_sizes([8, 24])
                    .tile_interchange([1, 0])
                    .into(),
                vectorize().into(),
            ],
        ),
        (
            "tile_1_and_generalize_interchange",
            vec![
                generic_tile()
                    .tile_sizes([8, 24])
                    .tile_interchange([1, 0])
                    .into(),
                Generalize::new(FUNCTION_NAME, OP_NAME)
                    .iterator_interchange([0, 1])
                    .into(),
                vectorize().into(),
            ],
        ),
        (
            "tile_1_peel_scalarize",
            vec![
                generic_tile().tile_sizes([8]).peel([0]).into(),
                generic_tile().scalarize_dyn_dims(true).into(),
                vectorize().into(),
            ],
        ),
        (
            "tile_1_pad",
            vec![
                generic_tile()
                    .tile_sizes([8, 24])
                    .pad(true)
                    .pack_paddings([1, 1, 1])
                    .into(),
                vectorize().into(),
            ],
        ),
        (
            "tile_1_pad_hoist",
            vec![
                generic_tile()
                    .tile_sizes([8, 24])
                    .pad(true)
                    .pack_paddings([1, 1, 1])
                    .hoist_paddings([3, 3, 3])
                    .into(),
                vectorize().into(),
            ],
        ),
        (
            "tile_2_pad_hoist",
            vec![
                generic_tile().tile_sizes([8, 24]).into(),
                generic_tile()
                    .tile_sizes([4, 12])
                    .pad(true)
                    .pack_paddings([1, 1, 1])
                    .hoist_paddings([6, 6, 6])
                    .into(),
                vectorize().into(),
            ],
        ),
        ("tile_3_pad_hoist_peel", with_vectorize(tile_3_pad_hoist_peel)),
        (
            "tile_3_pad_hoist_peel_scalarize",
            with_vectorize(tile_3_pad_hoist_peel_scalarize),
        ),
        (
            "fuse_2_tile_1",
            vec![
                Fuse::new(FUNCTION_NAME, OP_NAME).tile_sizes([8, 16]).into(),
                Fuse::new(FUNCTION_NAME, OP_NAME).tile_sizes([4, 4]).into(),
                generic_tile().tile_sizes([2, 3]).into(),
                vectorize().into(),
                Vectorize::new(FUNCTION_NAME, FILL_OP_NAME).into(),
            ],
        ),
        (
            "fuse_and_pad",
            vec![
                Fuse::new(FUNCTION_NAME, OP_NAME).tile_sizes([16, 16]).into(),
                generic_tile()
                    .tile_sizes([8, 12])
                    .pad(true)
                    .pack_paddings([1, 1, 1])
                    .hoist_paddings([3, 3, 3])
                    .into(),
                vectorize().into(),
                Tile::new(FUNCTION_NAME, FILL_OP_NAME).tile_sizes([8, 8]).into(),
                Vectorize::new(FUNCTION_NAME, FILL_OP_NAME).into(),
            ],
        ),
    ];

    experts
        .into_iter()
        .map(|(name, tiling)| Expert::test_expert(name, tiling, FUNCTION_NAME))
        .collect()
}

/// Element type combinations: one, all `f32`
pub fn problem_types() -> Vec<Vec<ElemType>> {
    vec![vec![ElemType::F32; 3]]
}

pub fn problem_sizes() -> Result<Vec<ProblemSizes>, ProblemError> {
    let lists: Vec<Vec<usize>> = PROBLEM_SIZE_LIST.iter().map(|s| s.to_vec()).collect();
    test_sizes(&KEYS, &lists)
}

/// Problem factory handed to the harness; the problem does not depend on sizes or types
pub fn make_problem(_sizes: &ProblemSizes, _types: &[ElemType]) -> Result<EinsumProblem, ProblemError> {
    EinsumProblem::new("mn,n", "mn", 2)
}

/// Default harness options for the matvec run
pub fn config() -> HarnessConfig {
    HarnessConfig {
        n_iters: N_ITERS,
        function_name: FUNCTION_NAME.to_string(),
        ..HarnessConfig::default()
    }
}

/// Run all experts at all sizes
pub fn run(config: HarnessConfig) -> Result<HarnessReport, HarnessError> {
    let sizes = problem_sizes()?;
    Harness::new(config).run(make_problem, &problem_types(), &sizes, &all_experts())
}

/// The fixed matvec configuration
pub fn main() -> Result<HarnessReport, HarnessError> {
    crate::harness::test_harness(
        make_problem,
        &problem_types(),
        &problem_sizes()?,
        &all_experts(),
        N_ITERS,
        FUNCTION_NAME,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twelve_experts_with_suffix() {
        let experts = all_experts();
        assert_eq!(experts.len(), 12);
        assert!(experts.iter().all(|e| e.ends_with_lowering_suffix(FUNCTION_NAME)));
        assert!(experts[0].tiling_transforms().is_empty());
        assert!(experts[1..].iter().all(|e| !e.tiling_transforms().is_empty()));

        let names: Vec<&str> = experts.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names[9], "tile_3_pad_hoist_peel_scalarize");
        assert_eq!(names[11], "fuse_and_pad");
    }

    #[test]
    fn test_sizes_and_types() {
        let sizes = problem_sizes().unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].get("m"), Some(24));
        assert_eq!(sizes[0].get("n"), Some(32));
        assert_eq!(sizes[1].get("m"), Some(27));
        assert_eq!(sizes[1].get("n"), Some(37));
        assert_eq!(problem_types(), vec![vec![ElemType::F32; 3]]);
    }
}
