//! Text rendering of kernels
//!
//! The format loosely follows MLIR's scf dialect so a dumped kernel reads like
//! the loop nest a real lowering would produce:
//!
//! ```text
//! func @matvec(%arg0: memref<24x32xf32>, %arg1: memref<32xf32>, %arg2: memref<24xf32>)  // lowered
//!   linalg.fill(%arg2) [m=24]
//!   scf.parallel %m step 8 {
//!     vector linalg.generic(%arg0, %arg1 -> %arg2) [m=8, n=32] iterators(m, n)
//!   }
//! ```

use std::fmt::Write;

use crate::loop_nest::{Kernel, Node, OpKind, OpNode, Stage};

const INDENT: &str = "  ";

pub fn render(kernel: &Kernel) -> String {
    let mut out = String::new();
    let problem = &kernel.problem;
    let kind = if kernel.stage == Stage::Tensor {
        "tensor"
    } else {
        "memref"
    };

    let args: Vec<String> = (0..problem.num_tensors())
        .map(|k| {
            let mut shape: Vec<String> = problem
                .tensor_dims(k)
                .iter()
                .map(|d| kernel.sizes[*d].to_string())
                .collect();
            shape.push(short_type(kernel, k));
            format!("%arg{}: {}<{}>", k, kind, shape.join("x"))
        })
        .collect();
    let stage = match kernel.stage {
        Stage::Tensor => "tensor",
        Stage::Bufferized => "bufferized",
        Stage::Lowered => "lowered",
    };
    let _ = writeln!(
        out,
        "func @{}({})  // {}",
        kernel.function_name,
        args.join(", "),
        stage
    );
    render_nodes(kernel, &kernel.body, 1, &mut out);
    if !kernel.vector_stages.is_empty() {
        let stages: Vec<String> = kernel.vector_stages.iter().map(|s| s.to_string()).collect();
        let _ = writeln!(out, "// vector lowering stages: {}", stages.join(", "));
    }
    out
}

fn short_type(kernel: &Kernel, k: usize) -> String {
    match kernel.types.get(k) {
        Some(t) => format!("f{}", t.size_in_bytes() * 8),
        None => "?".to_string(),
    }
}

fn dim_name(kernel: &Kernel, d: usize) -> char {
    kernel.problem.dims()[d]
}

fn render_nodes(kernel: &Kernel, nodes: &[Node], depth: usize, out: &mut String) {
    let pad = INDENT.repeat(depth);
    for node in nodes {
        match node {
            Node::Op(op) => {
                let _ = writeln!(out, "{}{}", pad, render_op(kernel, op));
            }
            Node::Loop(l) => {
                let keyword = if l.parallel { "scf.parallel" } else { "scf.for" };
                let name = dim_name(kernel, l.dim);
                if l.peeled {
                    let _ = writeln!(out, "{}{} %{} step {} peeled {{", pad, keyword, name, l.step);
                    render_nodes(kernel, &l.body, depth + 1, out);
                    let _ = writeln!(out, "{}}} remainder {{", pad);
                    render_nodes(kernel, &l.remainder, depth + 1, out);
                    let _ = writeln!(out, "{}}}", pad);
                } else {
                    let _ = writeln!(out, "{}{} %{} step {} {{", pad, keyword, name, l.step);
                    render_nodes(kernel, &l.body, depth + 1, out);
                    let _ = writeln!(out, "{}}}", pad);
                }
            }
            Node::Pad(p) => {
                let padded: Vec<String> = p
                    .padded
                    .iter()
                    .map(|(d, size)| format!("{}->{}", dim_name(kernel, *d), size))
                    .collect();
                let operands: Vec<String> = p
                    .operands
                    .iter()
                    .map(|o| {
                        let mut s = format!("%arg{}", o.tensor);
                        if o.pack {
                            s.push_str(" packed");
                        }
                        if o.hoist > 0 {
                            let _ = write!(s, " hoist={}", o.hoist);
                        }
                        s
                    })
                    .collect();
                let _ = writeln!(
                    out,
                    "{}pad #{} [{}] ({}) {{",
                    pad,
                    p.site,
                    padded.join(", "),
                    operands.join(", ")
                );
                render_nodes(kernel, &p.body, depth + 1, out);
                let _ = writeln!(out, "{}}}", pad);
            }
        }
    }
}

fn render_op(kernel: &Kernel, op: &OpNode) -> String {
    let arity = kernel.problem.arity();
    let operands = match op.kind {
        OpKind::Fill => format!("%arg{}", arity),
        OpKind::Generic => {
            let ins: Vec<String> = (0..arity).map(|k| format!("%arg{}", k)).collect();
            format!("{} -> %arg{}", ins.join(", "), arity)
        }
    };
    let extents: Vec<String> = op
        .iterators
        .iter()
        .map(|d| format!("{}={}", dim_name(kernel, *d), op.extents[*d]))
        .collect();

    let mut line = String::new();
    if op.vectorized {
        line.push_str("vector ");
    }
    let _ = write!(line, "{}({}) [{}]", op.kind.op_name(), operands, extents.join(", "));
    if op.kind == OpKind::Generic {
        let names: Vec<String> = op
            .iterators
            .iter()
            .map(|d| dim_name(kernel, *d).to_string())
            .collect();
        let _ = write!(line, " iterators({})", names.join(", "));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::experts::bufferize_and_lower;
    use crate::problem::{EinsumProblem, ElemType, ProblemSizes};
    use crate::transforms::{Tile, TransformationList};

    #[test]
    fn test_render_peeled_tile() {
        let problem = EinsumProblem::new("mn,n", "mn", 2).unwrap();
        let sizes = ProblemSizes::parse("m=27,n=37").unwrap();
        let pipeline = TransformationList::new(vec![Tile::new("matvec", "linalg.generic")
            .tile_sizes([8])
            .peel([0])
            .into()])
            + bufferize_and_lower("matvec");
        let compiled = compile(&problem, &sizes, &[ElemType::F32; 3], "matvec", &pipeline).unwrap();
        let text = render(&compiled.kernel);

        assert!(text.starts_with("func @matvec(%arg0: memref<27x37xf32>"));
        assert!(text.contains("scf.parallel %m step 8 peeled {"));
        assert!(text.contains("} remainder {"));
        assert!(text.contains("linalg.generic(%arg0, %arg1 -> %arg2) [m=3, n=37] iterators(m, n)"));
        assert!(text.contains("// vector lowering stages: 0, 1, 2, 3, 4, 5, 6"));
    }
}
