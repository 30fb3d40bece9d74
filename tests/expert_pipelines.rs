//! Structural checks of the compiled matvec pipelines
//!
//! Each entry names an expert and the loop-nest shape it must compile to at
//! the 24x32 problem size.

use codegen_experts::compiler::compile;
use codegen_experts::loop_nest::{IrStats, Node, OpKind, Stage};
use codegen_experts::matvec;
use codegen_experts::{EinsumProblem, ElemType, Expert, ProblemSizes};

// ============================================================================
// Expected Shapes
// ============================================================================

struct ShapeEntry {
    expert: &'static str,
    loops: usize,
    peeled_loops: usize,
    pads: usize,
}

const SHAPES: &[ShapeEntry] = &[
    ShapeEntry { expert: "no_tiling", loops: 0, peeled_loops: 0, pads: 0 },
    ShapeEntry { expert: "tile_1", loops: 2, peeled_loops: 0, pads: 0 },
    ShapeEntry { expert: "tile_and_interchange_1", loops: 2, peeled_loops: 0, pads: 0 },
    ShapeEntry { expert: "tile_1_and_generalize_interchange", loops: 2, peeled_loops: 0, pads: 0 },
    ShapeEntry { expert: "tile_1_peel_scalarize", loops: 1, peeled_loops: 1, pads: 0 },
    ShapeEntry { expert: "tile_1_pad", loops: 2, peeled_loops: 0, pads: 1 },
    ShapeEntry { expert: "tile_1_pad_hoist", loops: 2, peeled_loops: 0, pads: 1 },
    ShapeEntry { expert: "tile_2_pad_hoist", loops: 4, peeled_loops: 0, pads: 1 },
    ShapeEntry { expert: "tile_3_pad_hoist_peel", loops: 6, peeled_loops: 2, pads: 1 },
    ShapeEntry { expert: "tile_3_pad_hoist_peel_scalarize", loops: 6, peeled_loops: 2, pads: 1 },
    ShapeEntry { expert: "fuse_2_tile_1", loops: 6, peeled_loops: 0, pads: 0 },
    ShapeEntry { expert: "fuse_and_pad", loops: 5, peeled_loops: 0, pads: 1 },
];

fn problem() -> EinsumProblem {
    EinsumProblem::new("mn,n", "mn", 2).expect("matvec problem")
}

fn small_sizes() -> ProblemSizes {
    matvec::problem_sizes().expect("sizes")[0].clone()
}

fn expert(name: &str) -> Expert {
    matvec::all_experts()
        .into_iter()
        .find(|e| e.name == name)
        .expect("known expert")
}

fn stats_for(name: &str) -> IrStats {
    let compiled = compile(
        &problem(),
        &small_sizes(),
        &[ElemType::F32; 3],
        matvec::FUNCTION_NAME,
        &expert(name).transforms,
    )
    .unwrap_or_else(|e| panic!("{} failed to compile: {}", name, e));
    assert_eq!(compiled.kernel.stage, Stage::Lowered);
    compiled.kernel.stats()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_every_expert_has_a_shape_entry() {
    let names: Vec<String> = matvec::all_experts().into_iter().map(|e| e.name).collect();
    let listed: Vec<&str> = SHAPES.iter().map(|s| s.expert).collect();
    assert_eq!(names, listed);
}

#[test]
fn test_compiled_shapes() {
    for entry in SHAPES {
        let stats = stats_for(entry.expert);
        assert_eq!(stats.loops, entry.loops, "{}: loops", entry.expert);
        assert_eq!(stats.peeled_loops, entry.peeled_loops, "{}: peeled loops", entry.expert);
        assert_eq!(stats.pads, entry.pads, "{}: pads", entry.expert);
        if entry.pads > 0 {
            assert_eq!(stats.packed_operands, 3, "{}: packed operands", entry.expert);
        }
    }
}

#[test]
fn test_fuse_places_fill_in_outer_tile_loop() {
    let compiled = compile(
        &problem(),
        &small_sizes(),
        &[ElemType::F32; 3],
        matvec::FUNCTION_NAME,
        &expert("fuse_2_tile_1").transforms,
    )
    .expect("compiles");

    assert_eq!(compiled.kernel.body.len(), 1, "fill no longer at top level");
    let Node::Loop(outer) = &compiled.kernel.body[0] else {
        panic!("expected the m tile loop at top level");
    };
    assert!(outer.parallel);
    assert_eq!(outer.step, 8);
    match &outer.body[0] {
        Node::Op(op) => {
            assert_eq!(op.kind, OpKind::Fill);
            assert!(op.vectorized);
        }
        other => panic!("expected the fused fill first, got {:?}", other),
    }
}

#[test]
fn test_steps_record_matches() {
    let compiled = compile(
        &problem(),
        &small_sizes(),
        &[ElemType::F32; 3],
        matvec::FUNCTION_NAME,
        &expert("tile_1").transforms,
    )
    .expect("compiles");

    // Tile, Vectorize, Bufferize, 7 vector stages, LowerToLLVM
    assert_eq!(compiled.steps.len(), 11);
    assert!(compiled.steps.iter().all(|s| s.matched == 1));
    assert!(compiled.steps[0].transform.starts_with("Tile(matvec, linalg.generic"));
}

#[test]
fn test_experts_survive_json() {
    let experts = matvec::all_experts();
    let json = serde_json::to_string(&experts).expect("serialize");
    let back: Vec<Expert> = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, experts);
}
