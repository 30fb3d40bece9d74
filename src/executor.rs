//! Interpreter for lowered kernels
//!
//! The executor walks the loop-nest tree with a [`Frame`]: the current range of
//! every domain dimension plus one strided view per tensor. Loops narrow a
//! range; pads re-base the frame so the tile starts at the origin and, where
//! needed, copy operands into zero-padded packed buffers.
//!
//! # Buffers
//! Caller buffers and packed buffers live in one arena. Arena ids are never
//! reused, so a stale id can only ever miss, never alias a newer buffer.
//!
//! # Hoisted packs
//! A packed input hoisted by `h` loops is cached per pad site and tensor. The
//! cache is valid while the enclosing loop iterations outside the innermost `h`
//! loops are unchanged; within that scope, a tile whose region was already
//! packed is reused rather than copied again. Results are never hoisted.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::loop_nest::{Kernel, LoopNode, Node, OpKind, OpNode, Odometer, PadNode, Stage};
use crate::problem::{row_major_strides, ElemType};

/// Lanes per vector operation
pub const VECTOR_WIDTH: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("kernel '{0}' is not lowered")]
    NotLowered(String),

    #[error("expected {expected} buffers, got {found}")]
    BufferCount { expected: usize, found: usize },

    #[error("buffer {tensor} has {found} elements, expected {expected}")]
    BufferLength {
        tensor: usize,
        expected: usize,
        found: usize,
    },

    #[error("buffer {0} used after release")]
    Released(usize),
}

/// Dynamic counts gathered while running a kernel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Packed or padded copies made
    pub packs: usize,
    /// Hoisted packs served from the cache
    pub pack_reuses: usize,
    /// Packed results copied back
    pub unpacks: usize,
    pub vector_ops: usize,
    pub scalar_points: usize,
    pub loop_iterations: usize,
}

// ============================================================================
// Runtime State
// ============================================================================

struct Arena {
    slots: Vec<Option<Vec<f64>>>,
}

impl Arena {
    fn alloc(&mut self, data: Vec<f64>) -> usize {
        self.slots.push(Some(data));
        self.slots.len() - 1
    }

    fn get(&self, id: usize) -> Result<&[f64], ExecError> {
        self.slots
            .get(id)
            .and_then(|s| s.as_deref())
            .ok_or(ExecError::Released(id))
    }

    fn get_mut(&mut self, id: usize) -> Result<&mut Vec<f64>, ExecError> {
        self.slots
            .get_mut(id)
            .and_then(|s| s.as_mut())
            .ok_or(ExecError::Released(id))
    }

    fn take(&mut self, id: usize) -> Result<Vec<f64>, ExecError> {
        self.slots
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(ExecError::Released(id))
    }

    fn put(&mut self, id: usize, data: Vec<f64>) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = Some(data);
        }
    }

    fn release(&mut self, id: usize) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = None;
        }
    }
}

/// Strided window onto an arena buffer; one stride per tensor axis
#[derive(Clone, Debug)]
struct View {
    buf: usize,
    offset: usize,
    strides: Vec<usize>,
}

impl View {
    fn index(&self, axes: &[usize], point: &[usize]) -> usize {
        self.offset
            + axes
                .iter()
                .zip(&self.strides)
                .map(|(d, s)| point[*d] * s)
                .sum::<usize>()
    }

    /// Index of a position given per axis rather than per dimension
    fn index_local(&self, local: &[usize]) -> usize {
        self.offset + local.iter().zip(&self.strides).map(|(q, s)| q * s).sum::<usize>()
    }
}

#[derive(Clone, Debug)]
struct Frame {
    ranges: Vec<(usize, usize)>,
    views: Vec<View>,
}

struct HoistedPacks {
    scope: Vec<(usize, usize)>,
    tiles: HashMap<Vec<usize>, usize>,
}

struct Executor<'k> {
    kernel: &'k Kernel,
    axes: Vec<Vec<usize>>,
    result_type: ElemType,
    arena: Arena,
    /// `(dimension, tile start)` of every enclosing loop iteration
    loop_stack: Vec<(usize, usize)>,
    hoisted: HashMap<(usize, usize), HoistedPacks>,
    stats: ExecutionStats,
}

/// Run `kernel` over `buffers` (inputs first, result last), in place
pub fn execute(kernel: &Kernel, buffers: &mut [Vec<f64>]) -> Result<ExecutionStats, ExecError> {
    if kernel.stage != Stage::Lowered {
        return Err(ExecError::NotLowered(kernel.function_name.clone()));
    }
    let problem = &kernel.problem;
    if buffers.len() != problem.num_tensors() {
        return Err(ExecError::BufferCount {
            expected: problem.num_tensors(),
            found: buffers.len(),
        });
    }

    let axes: Vec<Vec<usize>> = (0..problem.num_tensors())
        .map(|k| problem.tensor_dims(k))
        .collect();
    let mut views = Vec::with_capacity(axes.len());
    for (k, tensor_axes) in axes.iter().enumerate() {
        let shape: Vec<usize> = tensor_axes.iter().map(|d| kernel.sizes[*d]).collect();
        let expected: usize = shape.iter().product();
        if buffers[k].len() != expected {
            return Err(ExecError::BufferLength {
                tensor: k,
                expected,
                found: buffers[k].len(),
            });
        }
        views.push(View {
            buf: k,
            offset: 0,
            strides: row_major_strides(&shape),
        });
    }

    let mut exec = Executor {
        kernel,
        axes,
        result_type: kernel.result_type(),
        arena: Arena {
            slots: buffers.iter_mut().map(|b| Some(std::mem::take(b))).collect(),
        },
        loop_stack: Vec::new(),
        hoisted: HashMap::new(),
        stats: ExecutionStats::default(),
    };
    let frame = Frame {
        ranges: kernel.sizes.iter().map(|s| (0, *s)).collect(),
        views,
    };

    let outcome = exec.run_nodes(&kernel.body, &frame);
    for (k, buffer) in buffers.iter_mut().enumerate() {
        if let Some(data) = exec.arena.slots.get_mut(k).and_then(Option::take) {
            *buffer = data;
        }
    }
    outcome?;

    debug!(
        "[Executor] {}: {} loop iterations, {} packs ({} reused), {} vector ops, {} scalar points",
        kernel.function_name,
        exec.stats.loop_iterations,
        exec.stats.packs,
        exec.stats.pack_reuses,
        exec.stats.vector_ops,
        exec.stats.scalar_points
    );
    Ok(exec.stats)
}

impl<'k> Executor<'k> {
    fn run_nodes(&mut self, nodes: &[Node], frame: &Frame) -> Result<(), ExecError> {
        for node in nodes {
            match node {
                Node::Loop(l) => self.run_loop(l, frame)?,
                Node::Pad(p) => self.run_pad(p, frame)?,
                Node::Op(op) => self.run_op(op, frame)?,
            }
        }
        Ok(())
    }

    fn run_loop(&mut self, l: &LoopNode, frame: &Frame) -> Result<(), ExecError> {
        let (lo, hi) = frame.ranges[l.dim];
        let mut start = lo;
        if l.peeled {
            while start + l.step <= hi {
                self.run_iteration(&l.body, frame, l.dim, start, start + l.step)?;
                start += l.step;
            }
            if start < hi {
                self.run_iteration(&l.remainder, frame, l.dim, start, hi)?;
            }
        } else {
            while start < hi {
                let end = (start + l.step).min(hi);
                self.run_iteration(&l.body, frame, l.dim, start, end)?;
                start = end;
            }
        }
        Ok(())
    }

    fn run_iteration(
        &mut self,
        body: &[Node],
        frame: &Frame,
        dim: usize,
        start: usize,
        end: usize,
    ) -> Result<(), ExecError> {
        let mut inner = frame.clone();
        inner.ranges[dim] = (start, end);
        self.stats.loop_iterations += 1;
        self.loop_stack.push((dim, start));
        let outcome = self.run_nodes(body, &inner);
        self.loop_stack.pop();
        outcome
    }

    fn run_pad(&mut self, pad: &PadNode, frame: &Frame) -> Result<(), ExecError> {
        let mut inner = frame.clone();
        let mut origin = vec![0; frame.ranges.len()];
        let mut valid: Vec<Option<usize>> = vec![None; frame.ranges.len()];
        let mut padded_size = vec![0; frame.ranges.len()];
        for &(d, size) in &pad.padded {
            let (lo, hi) = frame.ranges[d];
            origin[d] = lo;
            valid[d] = Some(hi - lo);
            padded_size[d] = size;
            inner.ranges[d] = (0, size);
        }
        for (k, view) in inner.views.iter_mut().enumerate() {
            for (a, d) in self.axes[k].iter().enumerate() {
                view.offset += origin[*d] * view.strides[a];
            }
        }

        let out = self.kernel.problem.arity();
        let mut temps = Vec::new();
        let mut unpack = None;
        for operand in &pad.operands {
            let k = operand.tensor;
            let lens: Option<Vec<usize>> = self.axes[k].iter().map(|d| valid[*d]).collect();
            let Some(lens) = lens else {
                continue;
            };
            let shape: Vec<usize> = self.axes[k].iter().map(|d| padded_size[*d]).collect();
            let needs_padding = lens.iter().zip(&shape).any(|(l, s)| l < s);
            if !(operand.pack || needs_padding) {
                continue;
            }

            let source = inner.views[k].clone();
            let id = if k < out && operand.pack && operand.hoist > 0 {
                self.hoisted_pack(pad.site, k, operand.hoist, &source, &lens, &shape)?
            } else {
                let id = self.pack(&source, &lens, &shape)?;
                temps.push(id);
                if k == out {
                    unpack = Some((id, source, lens.clone(), shape.clone()));
                }
                id
            };
            inner.views[k] = View {
                buf: id,
                offset: 0,
                strides: row_major_strides(&shape),
            };
        }

        self.run_nodes(&pad.body, &inner)?;

        if let Some((id, dst, lens, shape)) = unpack {
            self.unpack(id, &dst, &lens, &shape)?;
        }
        for id in temps {
            self.arena.release(id);
        }
        Ok(())
    }

    fn hoisted_pack(
        &mut self,
        site: usize,
        tensor: usize,
        hoist: usize,
        source: &View,
        lens: &[usize],
        shape: &[usize],
    ) -> Result<usize, ExecError> {
        let depth = hoist.min(self.loop_stack.len());
        let scope = self.loop_stack[..self.loop_stack.len() - depth].to_vec();
        let mut region = vec![source.buf, source.offset];
        region.extend_from_slice(lens);

        let entry = self
            .hoisted
            .entry((site, tensor))
            .or_insert_with(|| HoistedPacks {
                scope: scope.clone(),
                tiles: HashMap::new(),
            });
        if entry.scope != scope {
            for (_, id) in entry.tiles.drain() {
                self.arena.release(id);
            }
            entry.scope = scope;
        }
        if let Some(&id) = entry.tiles.get(&region) {
            self.stats.pack_reuses += 1;
            return Ok(id);
        }

        let id = self.pack(source, lens, shape)?;
        if let Some(entry) = self.hoisted.get_mut(&(site, tensor)) {
            entry.tiles.insert(region, id);
        }
        Ok(id)
    }

    /// Copy the valid `lens` window of `source` into a zeroed buffer of `shape`
    fn pack(&mut self, source: &View, lens: &[usize], shape: &[usize]) -> Result<usize, ExecError> {
        let packed_view = View {
            buf: 0,
            offset: 0,
            strides: row_major_strides(shape),
        };
        let mut data = vec![0.0; shape.iter().product()];
        let src = self.arena.get(source.buf)?;
        let ranges: Vec<(usize, usize)> = lens.iter().map(|l| (0, *l)).collect();
        let mut odometer = Odometer::new(&ranges);
        while odometer.advance() {
            let q = odometer.current();
            data[packed_view.index_local(q)] = src[source.index_local(q)];
        }
        self.stats.packs += 1;
        Ok(self.arena.alloc(data))
    }

    /// Copy the valid window of a packed result back and release it
    fn unpack(
        &mut self,
        id: usize,
        dst: &View,
        lens: &[usize],
        shape: &[usize],
    ) -> Result<(), ExecError> {
        let packed = self.arena.take(id)?;
        let packed_view = View {
            buf: id,
            offset: 0,
            strides: row_major_strides(shape),
        };
        let out = self.arena.get_mut(dst.buf)?;
        let ranges: Vec<(usize, usize)> = lens.iter().map(|l| (0, *l)).collect();
        let mut odometer = Odometer::new(&ranges);
        while odometer.advance() {
            let q = odometer.current();
            out[dst.index_local(q)] = packed[packed_view.index_local(q)];
        }
        self.stats.unpacks += 1;
        Ok(())
    }

    fn run_op(&mut self, op: &OpNode, frame: &Frame) -> Result<(), ExecError> {
        let ranges: Vec<(usize, usize)> = op.iterators.iter().map(|d| frame.ranges[*d]).collect();
        let mut point = vec![0; frame.ranges.len()];
        let mut odometer = Odometer::new(&ranges);
        let out = self.kernel.problem.arity();
        let out_view = &frame.views[out];
        let mut count: usize = 0;

        match op.kind {
            OpKind::Fill => {
                let data = self.arena.get_mut(out_view.buf)?;
                while odometer.advance() {
                    for (i, d) in op.iterators.iter().enumerate() {
                        point[*d] = odometer.current()[i];
                    }
                    data[out_view.index(&self.axes[out], &point)] = 0.0;
                    count += 1;
                }
            }
            OpKind::Generic => {
                for view in &frame.views[..out] {
                    self.arena.get(view.buf)?;
                }
                let mut result = self.arena.take(out_view.buf)?;
                let inputs: Vec<&[f64]> = frame.views[..out]
                    .iter()
                    .filter_map(|v| self.arena.get(v.buf).ok())
                    .collect();
                let rt = self.result_type;
                while odometer.advance() {
                    for (i, d) in op.iterators.iter().enumerate() {
                        point[*d] = odometer.current()[i];
                    }
                    let mut product = 1.0;
                    for (k, input) in inputs.iter().enumerate() {
                        product *= input[frame.views[k].index(&self.axes[k], &point)];
                    }
                    let idx = out_view.index(&self.axes[out], &point);
                    result[idx] = rt.round(result[idx] + rt.round(product));
                    count += 1;
                }
                self.arena.put(out_view.buf, result);
            }
        }

        if op.vectorized {
            self.stats.vector_ops += count.div_ceil(VECTOR_WIDTH);
        } else {
            self.stats.scalar_points += count;
        }
        Ok(())
    }
}
