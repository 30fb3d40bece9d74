//! Kernel compilation: applying a transformation pipeline to the loop-nest IR
//!
//! Compilation starts from the untransformed kernel (`linalg.fill` followed by
//! `linalg.generic`) and applies each transform in order. Tensor-level
//! transforms rewrite every op leaf their anchor matches; the remaining steps
//! move the kernel through its stages:
//!
//! ```text
//! Tensor --Bufferize--> Bufferized --LowerVectors(0..=6), LowerToLLVM--> Lowered
//! ```
//!
//! A pipeline that does not end in the `Lowered` stage does not compile.
//!
//! # Legality
//! - Tile/Fuse/Generalize interchanges must be permutations of the op rank.
//! - Peel indices must name generated tile loops.
//! - A fill is only fused when no reduction loop encloses it, so it still
//!   initialises every output element exactly once.
//! - Vectorization silently keeps ops with dynamic extents scalar.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::experts::VECTOR_LOWERING_STAGES;
use crate::loop_nest::{Extent, Kernel, LoopNode, Node, OpKind, OpNode, OperandPad, PadNode, Stage};
use crate::problem::{EinsumProblem, ElemType, ProblemError, ProblemSizes};
use crate::transforms::{Anchor, Fuse, Generalize, Tile, Transform, TransformationList};

/// Errors that make a pipeline fail to compile
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Problem(#[from] ProblemError),

    #[error("{transform}: {perm:?} is not a permutation of {rank} iterators")]
    InvalidInterchange {
        transform: &'static str,
        perm: Vec<usize>,
        rank: usize,
    },

    #[error("Tile: peel index {index} out of range ({loops} tiled loops)")]
    PeelOutOfRange { index: usize, loops: usize },

    #[error("{0} cannot be applied after bufferization")]
    TensorTransformAfterBufferize(&'static str),

    #[error("kernel is already bufferized")]
    AlreadyBufferized,

    #[error("LowerVectors(stage={0}) requires a bufferized kernel")]
    LoweringBeforeBufferization(u8),

    #[error("invalid vector lowering stage {0}")]
    InvalidVectorStage(u8),

    #[error("vector ops remain: missing LowerVectors stages {0:?}")]
    UnloweredVectorOps(Vec<u8>),

    #[error("kernel '{0}' was never bufferized")]
    NotBufferized(String),

    #[error("kernel '{0}' was not lowered to LLVM")]
    NotLowered(String),

    #[error("{0} applied after LowerToLLVM")]
    AfterLowering(String),
}

/// One pipeline step and the number of ops it rewrote
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTransform {
    pub transform: String,
    pub matched: usize,
}

/// A compiled kernel together with the per-step log
#[derive(Clone, Debug)]
pub struct Compilation {
    pub kernel: Kernel,
    pub steps: Vec<AppliedTransform>,
}

/// Compile `problem` at `sizes` through `transforms`
pub fn compile(
    problem: &EinsumProblem,
    sizes: &ProblemSizes,
    types: &[ElemType],
    function_name: &str,
    transforms: &TransformationList,
) -> Result<Compilation, CompileError> {
    problem.check_types(types)?;
    let domain = problem.domain_sizes(sizes)?;
    let mut kernel = Kernel::new(function_name, problem.clone(), domain, types.to_vec());

    let mut steps = Vec::with_capacity(transforms.len());
    for transform in transforms {
        let matched = apply(&mut kernel, transform)?;
        debug!("[Compiler] {} matched {} op(s)", transform, matched);
        steps.push(AppliedTransform {
            transform: transform.to_string(),
            matched,
        });
    }

    match kernel.stage {
        Stage::Tensor => Err(CompileError::NotBufferized(kernel.function_name)),
        Stage::Bufferized => Err(CompileError::NotLowered(kernel.function_name)),
        Stage::Lowered => Ok(Compilation { kernel, steps }),
    }
}

/// Apply a single transform; returns how many ops it matched
pub fn apply(kernel: &mut Kernel, transform: &Transform) -> Result<usize, CompileError> {
    if kernel.stage == Stage::Lowered {
        return Err(CompileError::AfterLowering(transform.to_string()));
    }
    if transform.is_tensor_transform() && kernel.stage != Stage::Tensor {
        return Err(CompileError::TensorTransformAfterBufferize(transform.name()));
    }

    match transform {
        Transform::Tile(t) => match target(kernel, &t.anchor) {
            Some(kind) => rewrite_kernel(kernel, kind, |op, _, _, problem, site| {
                tile_op(op, t, problem, site)
            }),
            None => Ok(0),
        },
        Transform::Fuse(f) => match target(kernel, &f.anchor) {
            Some(kind) => rewrite_kernel(kernel, kind, |op, siblings, in_reduction, problem, _| {
                fuse_op(op, f, siblings, in_reduction, problem)
            }),
            None => Ok(0),
        },
        Transform::Generalize(g) => match target(kernel, &g.anchor) {
            Some(kind) => {
                rewrite_kernel(kernel, kind, |op, _, _, _, _| generalize_op(op, g))
            }
            None => Ok(0),
        },
        Transform::Vectorize(v) => match target(kernel, &v.anchor) {
            Some(kind) => rewrite_kernel(kernel, kind, |mut op, _, _, _, _| {
                if op.is_static() {
                    op.vectorized = true;
                } else {
                    warn!(
                        "Vectorize: {} has dynamic extents, keeping it scalar",
                        op.kind.op_name()
                    );
                }
                Ok(vec![Node::Op(op)])
            }),
            None => Ok(0),
        },
        Transform::Bufferize => {
            if kernel.stage != Stage::Tensor {
                return Err(CompileError::AlreadyBufferized);
            }
            kernel.stage = Stage::Bufferized;
            Ok(1)
        }
        Transform::LowerVectors { fn_name, stage } => {
            if *stage >= VECTOR_LOWERING_STAGES {
                return Err(CompileError::InvalidVectorStage(*stage));
            }
            if kernel.stage == Stage::Tensor {
                return Err(CompileError::LoweringBeforeBufferization(*stage));
            }
            if *fn_name != kernel.function_name {
                warn!(
                    "LowerVectors: no function '{}' (kernel is '{}')",
                    fn_name, kernel.function_name
                );
                return Ok(0);
            }
            kernel.vector_stages.insert(*stage);
            Ok(1)
        }
        Transform::LowerToLlvm => {
            if kernel.stage == Stage::Tensor {
                return Err(CompileError::NotBufferized(kernel.function_name.clone()));
            }
            if kernel.has_vector_ops() {
                let missing: Vec<u8> = (0..VECTOR_LOWERING_STAGES)
                    .filter(|s| !kernel.vector_stages.contains(s))
                    .collect();
                if !missing.is_empty() {
                    return Err(CompileError::UnloweredVectorOps(missing));
                }
            }
            kernel.stage = Stage::Lowered;
            Ok(1)
        }
    }
}

/// The op kind an anchor selects in this kernel, if any
fn target(kernel: &Kernel, anchor: &Anchor) -> Option<OpKind> {
    if anchor.fn_name != kernel.function_name {
        warn!(
            "No function '{}' to transform (kernel is '{}')",
            anchor.fn_name, kernel.function_name
        );
        return None;
    }
    let kind = OpKind::from_op_name(&anchor.op_name);
    if kind.is_none() {
        warn!("No op '{}' in '{}'", anchor.op_name, kernel.function_name);
    }
    kind
}

// ============================================================================
// Tree Rewriting
// ============================================================================

/// Leaf rewrite: (op, already-emitted siblings, enclosed by a reduction loop,
/// problem, next pad site) -> replacement nodes
type LeafRewrite<'a> = dyn FnMut(
        OpNode,
        &mut Vec<Node>,
        bool,
        &EinsumProblem,
        &mut usize,
    ) -> Result<Vec<Node>, CompileError>
    + 'a;

fn rewrite_kernel<F>(kernel: &mut Kernel, kind: OpKind, mut f: F) -> Result<usize, CompileError>
where
    F: FnMut(OpNode, &mut Vec<Node>, bool, &EinsumProblem, &mut usize) -> Result<Vec<Node>, CompileError>,
{
    let body = std::mem::take(&mut kernel.body);
    let mut matched = 0;
    let mut site = kernel.next_pad_site;
    let problem = &kernel.problem;
    let mut counted = |op: OpNode,
                       siblings: &mut Vec<Node>,
                       in_reduction: bool,
                       problem: &EinsumProblem,
                       site: &mut usize| {
        matched += 1;
        f(op, siblings, in_reduction, problem, site)
    };
    let rewritten = rewrite_nodes(body, kind, false, problem, &mut site, &mut counted)?;
    kernel.body = rewritten;
    kernel.next_pad_site = site;
    Ok(matched)
}

fn rewrite_nodes(
    nodes: Vec<Node>,
    kind: OpKind,
    in_reduction: bool,
    problem: &EinsumProblem,
    site: &mut usize,
    f: &mut LeafRewrite<'_>,
) -> Result<Vec<Node>, CompileError> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Op(op) if op.kind == kind => {
                let replacement = f(op, &mut out, in_reduction, problem, site)?;
                out.extend(replacement);
            }
            Node::Loop(mut l) => {
                let nested = in_reduction || !l.parallel;
                l.body = rewrite_nodes(std::mem::take(&mut l.body), kind, nested, problem, site, f)?;
                l.remainder =
                    rewrite_nodes(std::mem::take(&mut l.remainder), kind, nested, problem, site, f)?;
                out.push(Node::Loop(l));
            }
            Node::Pad(mut p) => {
                p.body = rewrite_nodes(std::mem::take(&mut p.body), kind, in_reduction, problem, site, f)?;
                out.push(Node::Pad(p));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

// ============================================================================
// Loop Nest Construction
// ============================================================================

/// Tile loops to wrap around a leaf, outermost first
struct NestPlan<'a> {
    problem: &'a EinsumProblem,
    /// `(dimension, step)` per generated loop
    loops: Vec<(usize, usize)>,
    /// Positions in `loops` to peel
    peel: BTreeSet<usize>,
    /// Loop depth at which a fused producer is placed
    fuse_at: usize,
}

impl<'a> NestPlan<'a> {
    fn build(
        &self,
        level: usize,
        op: OpNode,
        producer: Option<OpNode>,
        finish: &mut dyn FnMut(OpNode) -> Vec<Node>,
    ) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut producer = producer;
        let peeled = self.peel.contains(&level);
        if level >= self.fuse_at || level == self.loops.len() || peeled {
            if let Some(p) = producer.take() {
                nodes.push(Node::Op(p));
            }
        }
        if level == self.loops.len() {
            nodes.extend(finish(op));
            return nodes;
        }

        let (dim, step) = self.loops[level];
        let parallel = !self.problem.is_reduction(dim);
        let extent = op.extents[dim].clone();

        let node = if peeled {
            let mut main = op.clone();
            main.extents[dim] = extent.full_tiles(step);
            let mut rest = op;
            rest.extents[dim] = extent.remainders(step);

            let body = if main.extents[dim].is_empty() {
                Vec::new()
            } else {
                self.build(level + 1, main, None, finish)
            };
            let remainder = if rest.extents[dim].is_empty() {
                Vec::new()
            } else {
                self.build(level + 1, rest, None, finish)
            };
            LoopNode {
                dim,
                step,
                parallel,
                peeled: true,
                body,
                remainder,
            }
        } else {
            let mut inner = op;
            inner.extents[dim] = extent.chunks(step);
            let producer = producer.map(|mut p| {
                if p.iterators.contains(&dim) {
                    p.extents[dim] = p.extents[dim].chunks(step);
                }
                p
            });
            LoopNode {
                dim,
                step,
                parallel,
                peeled: false,
                body: self.build(level + 1, inner, producer, finish),
                remainder: Vec::new(),
            }
        };

        nodes.push(Node::Loop(node));
        nodes
    }
}

fn check_permutation(
    perm: &[usize],
    rank: usize,
    transform: &'static str,
) -> Result<(), CompileError> {
    let invalid = || CompileError::InvalidInterchange {
        transform,
        perm: perm.to_vec(),
        rank,
    };
    if perm.len() != rank {
        return Err(invalid());
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || seen[p] {
            return Err(invalid());
        }
        seen[p] = true;
    }
    Ok(())
}

/// `(dimension, step)` of the tile loops for `op`, in nesting order
///
/// Sizes index the op iterators; extra sizes are ignored and missing ones leave
/// the iterator untiled.
fn tile_loops(
    op: &OpNode,
    sizes: &[usize],
    interchange: &[usize],
    transform: &'static str,
) -> Result<Vec<(usize, usize)>, CompileError> {
    let rank = op.iterators.len();
    let order: Vec<usize> = if interchange.is_empty() {
        (0..rank).collect()
    } else {
        check_permutation(interchange, rank, transform)?;
        interchange.to_vec()
    };
    Ok(order
        .into_iter()
        .filter_map(|i| match sizes.get(i) {
            Some(&size) if size > 0 => Some((op.iterators[i], size)),
            _ => None,
        })
        .collect())
}

// ============================================================================
// Transform Implementations
// ============================================================================

fn tile_op(
    op: OpNode,
    t: &Tile,
    problem: &EinsumProblem,
    site: &mut usize,
) -> Result<Vec<Node>, CompileError> {
    let loops = tile_loops(&op, &t.tile_sizes, &t.tile_interchange, "Tile")?;
    if let Some(&index) = t.peel.iter().find(|p| **p >= loops.len()) {
        return Err(CompileError::PeelOutOfRange {
            index,
            loops: loops.len(),
        });
    }
    debug!(
        "Tile {}: loops {:?}, peel {:?}, pad {}",
        op.kind.op_name(),
        loops,
        t.peel,
        t.pad
    );

    let plan = NestPlan {
        problem,
        loops,
        peel: t.peel.iter().copied().collect(),
        fuse_at: usize::MAX,
    };
    let mut finish = |leaf: OpNode| -> Vec<Node> {
        if t.pad {
            vec![pad_op(leaf, &t.pack_paddings, &t.hoist_paddings, problem, site)]
        } else if t.scalarize_dyn_dims {
            scalarize(leaf, problem)
        } else {
            vec![Node::Op(leaf)]
        }
    };
    Ok(plan.build(0, op, None, &mut finish))
}

/// Wrap a leaf so every iterator sees its static upper bound
fn pad_op(
    mut leaf: OpNode,
    pack: &[usize],
    hoist: &[usize],
    problem: &EinsumProblem,
    site: &mut usize,
) -> Node {
    let padded: Vec<(usize, usize)> = leaf
        .iterators
        .iter()
        .map(|d| (*d, leaf.extents[*d].upper_bound()))
        .collect();
    for (d, size) in &padded {
        leaf.extents[*d] = Extent::fixed(*size);
    }

    let tensors: Vec<usize> = match leaf.kind {
        OpKind::Generic => (0..problem.num_tensors()).collect(),
        OpKind::Fill => vec![problem.arity()],
    };
    // flags are indexed by tensor position for every op kind
    let operands = tensors
        .into_iter()
        .map(|tensor| OperandPad {
            tensor,
            pack: pack.get(tensor).copied().unwrap_or(0) != 0,
            hoist: hoist.get(tensor).copied().unwrap_or(0),
        })
        .collect();

    let pad = PadNode {
        site: *site,
        padded,
        operands,
        body: vec![Node::Op(leaf)],
    };
    *site += 1;
    Node::Pad(pad)
}

/// Tile every dynamic iterator by 1
fn scalarize(op: OpNode, problem: &EinsumProblem) -> Vec<Node> {
    let loops: Vec<(usize, usize)> = op
        .iterators
        .iter()
        .filter(|d| !op.extents[**d].is_static())
        .map(|d| (*d, 1))
        .collect();
    let plan = NestPlan {
        problem,
        loops,
        peel: BTreeSet::new(),
        fuse_at: usize::MAX,
    };
    plan.build(0, op, None, &mut |leaf| vec![Node::Op(leaf)])
}

fn fuse_op(
    op: OpNode,
    f: &Fuse,
    siblings: &mut Vec<Node>,
    in_reduction: bool,
    problem: &EinsumProblem,
) -> Result<Vec<Node>, CompileError> {
    let loops = tile_loops(&op, &f.tile_sizes, &f.tile_interchange, "Fuse")?;
    let parallel_prefix = loops
        .iter()
        .take_while(|(d, _)| !problem.is_reduction(*d))
        .count();

    let producer = if op.kind == OpKind::Generic && !in_reduction && parallel_prefix > 0 {
        take_fill(siblings)
    } else {
        None
    };
    match &producer {
        Some(_) => debug!(
            "Fuse: linalg.fill placed inside {} parallel tile loop(s)",
            parallel_prefix
        ),
        None => debug!("Fuse: no fusable producer, tiling only"),
    }

    let plan = NestPlan {
        problem,
        loops,
        peel: BTreeSet::new(),
        fuse_at: parallel_prefix,
    };
    Ok(plan.build(0, op, producer, &mut |leaf| vec![Node::Op(leaf)]))
}

/// Detach the closest preceding untransformed fill
fn take_fill(siblings: &mut Vec<Node>) -> Option<OpNode> {
    let pos = siblings
        .iter()
        .rposition(|n| matches!(n, Node::Op(op) if op.kind == OpKind::Fill))?;
    match siblings.remove(pos) {
        Node::Op(op) => Some(op),
        _ => None,
    }
}

fn generalize_op(mut op: OpNode, g: &Generalize) -> Result<Vec<Node>, CompileError> {
    if !g.iterator_interchange.is_empty() {
        check_permutation(&g.iterator_interchange, op.iterators.len(), "Generalize")?;
        op.iterators = g
            .iterator_interchange
            .iter()
            .map(|i| op.iterators[*i])
            .collect();
    }
    Ok(vec![Node::Op(op)])
}
