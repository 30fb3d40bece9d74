//! Loop-nest IR for a single einsum kernel
//!
//! A kernel body is a tree of three node kinds:
//!
//! ```text
//! Loop  - steps one domain dimension through the current range (optionally peeled)
//! Pad   - re-bases the current tile into packed, statically shaped operand views
//! Op    - a leaf computing `linalg.fill` or `linalg.generic` over the current ranges
//! ```
//!
//! Ranges are never stored in the tree; the executor derives them while walking
//! it. What the tree does record is, for every op leaf, the set of extents each
//! dimension can take at run time ([`Extent`]). A single-valued set is a static
//! shape, which is what vectorization needs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::problem::{EinsumProblem, ElemType};

// ============================================================================
// Extents
// ============================================================================

/// The sizes a dimension can take inside an op leaf
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Extent(BTreeSet<usize>);

impl Extent {
    pub fn fixed(size: usize) -> Self {
        Extent(std::iter::once(size).collect())
    }

    pub fn is_static(&self) -> bool {
        self.0.len() <= 1
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn upper_bound(&self) -> usize {
        self.0.iter().next_back().copied().unwrap_or(0)
    }

    pub fn values(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Extents after stepping by `tile` with a partial last tile
    pub fn chunks(&self, tile: usize) -> Extent {
        let mut out = BTreeSet::new();
        for v in self.values() {
            if v >= tile {
                out.insert(tile);
            }
            if v % tile != 0 {
                out.insert(v % tile);
            }
        }
        Extent(out)
    }

    /// Extents of the main body of a peeled loop
    pub fn full_tiles(&self, tile: usize) -> Extent {
        if self.values().any(|v| v >= tile) {
            Extent::fixed(tile)
        } else {
            Extent::default()
        }
    }

    /// Extents of the remainder of a peeled loop
    pub fn remainders(&self, tile: usize) -> Extent {
        Extent(self.values().map(|v| v % tile).filter(|r| *r != 0).collect())
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_static() {
            write!(f, "{}", self.upper_bound())
        } else {
            write!(f, "?<={}", self.upper_bound())
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Fill,
    Generic,
}

impl OpKind {
    pub fn op_name(&self) -> &'static str {
        match self {
            OpKind::Fill => "linalg.fill",
            OpKind::Generic => "linalg.generic",
        }
    }

    pub fn from_op_name(name: &str) -> Option<OpKind> {
        match name {
            "linalg.fill" => Some(OpKind::Fill),
            "linalg.generic" => Some(OpKind::Generic),
            _ => None,
        }
    }
}

/// Op leaf
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpNode {
    pub kind: OpKind,
    /// Domain dimensions in iteration order
    pub iterators: Vec<usize>,
    /// Possible extents, indexed by domain dimension
    pub extents: Vec<Extent>,
    pub vectorized: bool,
}

impl OpNode {
    pub fn is_static(&self) -> bool {
        self.iterators.iter().all(|d| self.extents[*d].is_static())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopNode {
    pub dim: usize,
    pub step: usize,
    /// Dimension indexes the result
    pub parallel: bool,
    pub peeled: bool,
    pub body: Vec<Node>,
    /// Body of the partial last iteration when peeled
    pub remainder: Vec<Node>,
}

/// Packing of one tensor inside a pad
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandPad {
    /// Tensor index: inputs first, result last
    pub tensor: usize,
    pub pack: bool,
    pub hoist: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PadNode {
    /// Unique per kernel; keys the hoisted-pack cache
    pub site: usize,
    /// `(dimension, padded size)` pairs
    pub padded: Vec<(usize, usize)>,
    pub operands: Vec<OperandPad>,
    pub body: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Loop(LoopNode),
    Pad(PadNode),
    Op(OpNode),
}

// ============================================================================
// Kernel
// ============================================================================

/// Compilation stage of a kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Tensor,
    Bufferized,
    Lowered,
}

/// A kernel function: fill the result, then contract into it
#[derive(Clone, Debug)]
pub struct Kernel {
    pub function_name: String,
    pub problem: EinsumProblem,
    /// Size of every domain dimension
    pub sizes: Vec<usize>,
    pub types: Vec<ElemType>,
    pub body: Vec<Node>,
    pub stage: Stage,
    /// Vector lowering stages applied so far
    pub vector_stages: BTreeSet<u8>,
    pub(crate) next_pad_site: usize,
}

impl Kernel {
    pub fn new(
        function_name: &str,
        problem: EinsumProblem,
        sizes: Vec<usize>,
        types: Vec<ElemType>,
    ) -> Self {
        let extents: Vec<Extent> = sizes.iter().map(|s| Extent::fixed(*s)).collect();
        let fill = OpNode {
            kind: OpKind::Fill,
            iterators: problem.tensor_dims(problem.arity()),
            extents: extents.clone(),
            vectorized: false,
        };
        let generic = OpNode {
            kind: OpKind::Generic,
            iterators: (0..problem.rank()).collect(),
            extents,
            vectorized: false,
        };

        Kernel {
            function_name: function_name.to_string(),
            problem,
            sizes,
            types,
            body: vec![Node::Op(fill), Node::Op(generic)],
            stage: Stage::Tensor,
            vector_stages: BTreeSet::new(),
            next_pad_site: 0,
        }
    }

    pub fn result_type(&self) -> ElemType {
        self.types[self.problem.arity()]
    }

    /// Visit every op leaf, in program order
    pub fn for_each_op(&self, f: &mut dyn FnMut(&OpNode)) {
        visit_ops(&self.body, f);
    }

    pub fn has_vector_ops(&self) -> bool {
        let mut found = false;
        self.for_each_op(&mut |op| found |= op.vectorized);
        found
    }

    pub fn stats(&self) -> IrStats {
        let mut stats = IrStats::default();
        collect_stats(&self.body, &mut stats);
        stats
    }
}

fn visit_ops(nodes: &[Node], f: &mut dyn FnMut(&OpNode)) {
    for node in nodes {
        match node {
            Node::Op(op) => f(op),
            Node::Loop(l) => {
                visit_ops(&l.body, f);
                visit_ops(&l.remainder, f);
            }
            Node::Pad(p) => visit_ops(&p.body, f),
        }
    }
}

/// Structural counts of a kernel body
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrStats {
    pub loops: usize,
    pub peeled_loops: usize,
    pub pads: usize,
    pub packed_operands: usize,
    pub vector_ops: usize,
    pub scalar_ops: usize,
}

fn collect_stats(nodes: &[Node], stats: &mut IrStats) {
    for node in nodes {
        match node {
            Node::Op(op) if op.vectorized => stats.vector_ops += 1,
            Node::Op(_) => stats.scalar_ops += 1,
            Node::Loop(l) => {
                stats.loops += 1;
                if l.peeled {
                    stats.peeled_loops += 1;
                }
                collect_stats(&l.body, stats);
                collect_stats(&l.remainder, stats);
            }
            Node::Pad(p) => {
                stats.pads += 1;
                stats.packed_operands += p.operands.iter().filter(|o| o.pack).count();
                collect_stats(&p.body, stats);
            }
        }
    }
}

// ============================================================================
// Iteration Helper
// ============================================================================

/// Row-major walk over a box of half-open ranges
///
/// An empty list of ranges has exactly one point; any empty range has none.
pub(crate) struct Odometer {
    lo: Vec<usize>,
    hi: Vec<usize>,
    cur: Vec<usize>,
    started: bool,
    done: bool,
}

impl Odometer {
    pub(crate) fn new(ranges: &[(usize, usize)]) -> Self {
        let lo: Vec<usize> = ranges.iter().map(|r| r.0).collect();
        let hi: Vec<usize> = ranges.iter().map(|r| r.1).collect();
        let done = ranges.iter().any(|(l, h)| l >= h);
        Odometer {
            cur: lo.clone(),
            lo,
            hi,
            started: false,
            done,
        }
    }

    /// Move to the next point; false once the box is exhausted
    pub(crate) fn advance(&mut self) -> bool {
        if self.done {
            return false;
        }
        if !self.started {
            self.started = true;
            return true;
        }
        for i in (0..self.cur.len()).rev() {
            self.cur[i] += 1;
            if self.cur[i] < self.hi[i] {
                return true;
            }
            self.cur[i] = self.lo[i];
        }
        self.done = true;
        false
    }

    pub(crate) fn current(&self) -> &[usize] {
        &self.cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_chunks() {
        let full = Extent::fixed(32);
        assert_eq!(full.chunks(8), Extent::fixed(8));
        let ragged = full.chunks(24);
        assert!(!ragged.is_static());
        assert_eq!(ragged.values().collect::<Vec<_>>(), vec![8, 24]);
        assert_eq!(ragged.upper_bound(), 24);
    }

    #[test]
    fn test_extent_peeling() {
        let e = Extent::fixed(27);
        assert_eq!(e.full_tiles(8), Extent::fixed(8));
        assert_eq!(e.remainders(8), Extent::fixed(3));
        assert!(Extent::fixed(24).remainders(8).is_empty());
        assert!(Extent::fixed(4).full_tiles(8).is_empty());
    }

    #[test]
    fn test_odometer_order() {
        let mut odo = Odometer::new(&[(0, 2), (1, 3)]);
        let mut points = Vec::new();
        while odo.advance() {
            points.push(odo.current().to_vec());
        }
        assert_eq!(points, vec![vec![0, 1], vec![0, 2], vec![1, 1], vec![1, 2]]);

        let mut scalar = Odometer::new(&[]);
        assert!(scalar.advance());
        assert!(!scalar.advance());

        let mut empty = Odometer::new(&[(0, 0)]);
        assert!(!empty.advance());
    }

    #[test]
    fn test_new_kernel_is_fill_then_generic() {
        let problem = EinsumProblem::new("mn,n", "mn", 2).unwrap();
        let kernel = Kernel::new("matvec", problem, vec![24, 32], vec![ElemType::F32; 3]);
        let mut kinds = Vec::new();
        kernel.for_each_op(&mut |op| kinds.push((op.kind, op.iterators.clone())));
        assert_eq!(
            kinds,
            vec![(OpKind::Fill, vec![0]), (OpKind::Generic, vec![0, 1])]
        );
        assert_eq!(kernel.stats().scalar_ops, 2);
    }
}
