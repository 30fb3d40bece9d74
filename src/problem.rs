//! Einsum problem descriptors and problem-size instantiation
//!
//! A problem is described the way the harness consumes it: an einsum index
//! expression (`"mn,n"`), the iteration domain that fixes the loop order of the
//! contraction (`"mn"`), and the number of input operands. Concrete sizes are
//! bound later through [`ProblemSizes`], one instantiation per harness case.
//!
//! # Implicit output
//! Without an explicit `->`, the result indices are the letters that occur
//! exactly once across all operand terms, in alphabetical order:
//! ```text
//! "mn,n"  -> result "m"   (n is contracted)
//! "mk,kn" -> result "mn"  (k is contracted)
//! ```

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::loop_nest::Odometer;

lazy_static! {
    static ref EINSUM_RE: Regex = Regex::new(r"^([a-z]+(?:,[a-z]+)*)(?:->([a-z]*))?$").unwrap();
    static ref SIZE_ENTRY_RE: Regex = Regex::new(r"^\s*([a-z])\s*=\s*(\d+)\s*$").unwrap();
}

/// Errors raised while describing or instantiating a problem
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProblemError {
    /// The index expression does not parse
    #[error("Invalid einsum specification '{0}'")]
    InvalidSpec(String),

    /// The iteration domain is not a permutation of the indices used by the expression
    #[error("Iteration domain '{dims}' does not match the indices of '{spec}'")]
    DomainMismatch { spec: String, dims: String },

    /// The declared operand count disagrees with the expression
    #[error("Einsum '{spec}' has {found} operands, expected {expected}")]
    ArityMismatch {
        spec: String,
        expected: usize,
        found: usize,
    },

    /// A size list does not provide exactly one value per key
    #[error("Size list {sizes:?} does not match keys {keys:?}")]
    SizeCount { keys: Vec<String>, sizes: Vec<usize> },

    /// A domain dimension has no bound size
    #[error("No size given for dimension '{0}'")]
    MissingSize(char),

    /// Element types must cover every operand plus the result
    #[error("Expected {expected} element types (operands + result), got {found}")]
    TypeCount { expected: usize, found: usize },

    #[error("Unknown element type '{0}'")]
    UnknownType(String),

    #[error("Invalid size entry '{0}' (expected e.g. m=24)")]
    InvalidSizeEntry(String),
}

// ============================================================================
// Element Types
// ============================================================================

/// Storage type of an operand or result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    F32,
    F64,
}

impl ElemType {
    /// Conventional array-library name (`float32`, `float64`)
    pub fn name(&self) -> &'static str {
        match self {
            ElemType::F32 => "float32",
            ElemType::F64 => "float64",
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElemType::F32 => 4,
            ElemType::F64 => 8,
        }
    }

    /// Round a value to what this type can store
    pub fn round(&self, value: f64) -> f64 {
        match self {
            ElemType::F32 => value as f32 as f64,
            ElemType::F64 => value,
        }
    }

    /// Default `(rtol, atol)` used when checking results of this type
    pub fn default_tolerance(&self) -> (f64, f64) {
        match self {
            ElemType::F32 => (1e-5, 1e-5),
            ElemType::F64 => (1e-12, 1e-12),
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElemType {
    type Err = ProblemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "f32" | "float32" => Ok(ElemType::F32),
            "f64" | "float64" => Ok(ElemType::F64),
            other => Err(ProblemError::UnknownType(other.to_string())),
        }
    }
}

/// Parse a comma-separated type list such as `f32,f32,f32`
pub fn parse_types(s: &str) -> Result<Vec<ElemType>, ProblemError> {
    s.split(',').map(ElemType::from_str).collect()
}

// ============================================================================
// Problem Sizes
// ============================================================================

/// Concrete sizes for named dimensions, in declaration order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProblemSizes {
    entries: Vec<(String, usize)>,
}

impl ProblemSizes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `size`, replacing an earlier binding
    pub fn insert(&mut self, key: impl Into<String>, size: usize) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = size,
            None => self.entries.push((key, size)),
        }
    }

    pub fn get(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, size)| *size)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Parse `m=24,n=32`
    pub fn parse(s: &str) -> Result<Self, ProblemError> {
        let mut sizes = ProblemSizes::new();
        for entry in s.split(',').filter(|e| !e.trim().is_empty()) {
            let caps = SIZE_ENTRY_RE
                .captures(entry)
                .ok_or_else(|| ProblemError::InvalidSizeEntry(entry.to_string()))?;
            let size = caps[2]
                .parse::<usize>()
                .map_err(|_| ProblemError::InvalidSizeEntry(entry.to_string()))?;
            sizes.insert(&caps[1], size);
        }
        Ok(sizes)
    }
}

impl fmt::Display for ProblemSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Expand size lists into one [`ProblemSizes`] per list
///
/// Each list must carry exactly one value per key.
pub fn test_sizes(keys: &[&str], size_lists: &[Vec<usize>]) -> Result<Vec<ProblemSizes>, ProblemError> {
    size_lists
        .iter()
        .map(|sizes| {
            if sizes.len() != keys.len() {
                return Err(ProblemError::SizeCount {
                    keys: keys.iter().map(|k| k.to_string()).collect(),
                    sizes: sizes.clone(),
                });
            }
            let mut instance = ProblemSizes::new();
            for (key, size) in keys.iter().zip(sizes) {
                instance.insert(*key, *size);
            }
            Ok(instance)
        })
        .collect()
}

// ============================================================================
// Einsum Problem
// ============================================================================

/// An einsum contraction with a fixed iteration domain
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EinsumProblem {
    spec: String,
    dims: Vec<char>,
    operands: Vec<Vec<char>>,
    output: Vec<char>,
}

impl EinsumProblem {
    /// Describe a contraction
    ///
    /// # Arguments
    /// * `spec` - index expression, e.g. `"mn,n"` or `"mk,kn->mn"`
    /// * `dims` - iteration domain, a permutation of every index in `spec`
    /// * `arity` - number of input operands
    pub fn new(spec: &str, dims: &str, arity: usize) -> Result<Self, ProblemError> {
        let compact: String = spec.chars().filter(|c| !c.is_whitespace()).collect();
        let caps = EINSUM_RE
            .captures(&compact)
            .ok_or_else(|| ProblemError::InvalidSpec(spec.to_string()))?;

        let operands: Vec<Vec<char>> = caps[1].split(',').map(|t| t.chars().collect()).collect();
        if operands.len() != arity {
            return Err(ProblemError::ArityMismatch {
                spec: spec.to_string(),
                expected: arity,
                found: operands.len(),
            });
        }

        let mut counts: BTreeMap<char, usize> = BTreeMap::new();
        for c in operands.iter().flatten() {
            *counts.entry(*c).or_insert(0) += 1;
        }

        let output: Vec<char> = match caps.get(2) {
            Some(explicit) => {
                let out: Vec<char> = explicit.as_str().chars().collect();
                let mut seen = Vec::new();
                for c in &out {
                    if !counts.contains_key(c) || seen.contains(c) {
                        return Err(ProblemError::InvalidSpec(spec.to_string()));
                    }
                    seen.push(*c);
                }
                out
            }
            None => counts
                .iter()
                .filter(|(_, n)| **n == 1)
                .map(|(c, _)| *c)
                .collect(),
        };

        let dims: Vec<char> = dims.chars().filter(|c| !c.is_whitespace()).collect();
        let mut sorted = dims.clone();
        sorted.sort_unstable();
        sorted.dedup();
        let used: Vec<char> = counts.keys().copied().collect();
        if sorted.len() != dims.len() || sorted != used {
            return Err(ProblemError::DomainMismatch {
                spec: spec.to_string(),
                dims: dims.iter().collect(),
            });
        }

        debug!(
            "Einsum '{}' over domain {:?}: result indices {:?}",
            compact, dims, output
        );

        Ok(EinsumProblem {
            spec: compact,
            dims,
            operands,
            output,
        })
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Iteration domain in loop order
    pub fn dims(&self) -> &[char] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of input operands
    pub fn arity(&self) -> usize {
        self.operands.len()
    }

    /// Number of tensors the kernel takes: inputs followed by the result
    pub fn num_tensors(&self) -> usize {
        self.operands.len() + 1
    }

    pub fn output_indices(&self) -> &[char] {
        &self.output
    }

    pub fn dim_position(&self, index: char) -> Option<usize> {
        self.dims.iter().position(|d| *d == index)
    }

    /// Domain positions indexed by tensor `k` (inputs first, result last)
    pub fn tensor_dims(&self, k: usize) -> Vec<usize> {
        let indices = if k < self.operands.len() {
            &self.operands[k]
        } else {
            &self.output
        };
        indices
            .iter()
            .filter_map(|c| self.dim_position(*c))
            .collect()
    }

    pub fn is_reduction(&self, dim: usize) -> bool {
        !self.output.contains(&self.dims[dim])
    }

    pub fn reduction_dims(&self) -> Vec<usize> {
        (0..self.rank()).filter(|d| self.is_reduction(*d)).collect()
    }

    /// Multiplies between inputs plus one accumulate when something is contracted
    pub fn flops_per_iteration(&self) -> usize {
        let muls = self.arity().saturating_sub(1);
        let adds = usize::from(!self.reduction_dims().is_empty());
        (muls + adds).max(1)
    }

    /// Size of every domain dimension, in domain order
    pub fn domain_sizes(&self, sizes: &ProblemSizes) -> Result<Vec<usize>, ProblemError> {
        self.dims
            .iter()
            .map(|d| {
                sizes
                    .get(&d.to_string())
                    .ok_or(ProblemError::MissingSize(*d))
            })
            .collect()
    }

    /// Shapes of the inputs followed by the result
    pub fn shapes(&self, sizes: &ProblemSizes) -> Result<Vec<Vec<usize>>, ProblemError> {
        let domain = self.domain_sizes(sizes)?;
        Ok((0..self.num_tensors())
            .map(|k| self.tensor_dims(k).iter().map(|d| domain[*d]).collect())
            .collect())
    }

    pub fn flop_count(&self, sizes: &ProblemSizes) -> Result<usize, ProblemError> {
        let domain = self.domain_sizes(sizes)?;
        Ok(domain.iter().product::<usize>() * self.flops_per_iteration())
    }

    /// Types must name every input and the result
    pub fn check_types(&self, types: &[ElemType]) -> Result<(), ProblemError> {
        if types.len() != self.num_tensors() {
            return Err(ProblemError::TypeCount {
                expected: self.num_tensors(),
                found: types.len(),
            });
        }
        Ok(())
    }

    /// Evaluate the contraction directly in f64, rounded to `result_type`
    pub fn reference(
        &self,
        sizes: &ProblemSizes,
        inputs: &[&[f64]],
        result_type: ElemType,
    ) -> Result<Vec<f64>, ProblemError> {
        let domain = self.domain_sizes(sizes)?;
        let shapes = self.shapes(sizes)?;
        let strides: Vec<Vec<usize>> = shapes.iter().map(|s| row_major_strides(s)).collect();
        let axes: Vec<Vec<usize>> = (0..self.num_tensors()).map(|k| self.tensor_dims(k)).collect();
        let out = self.arity();

        let mut result = vec![0.0; shapes[out].iter().product()];
        let ranges: Vec<(usize, usize)> = domain.iter().map(|n| (0, *n)).collect();
        let mut odometer = Odometer::new(&ranges);
        while odometer.advance() {
            let point = odometer.current();
            let mut product = 1.0;
            for (k, input) in inputs.iter().enumerate().take(out) {
                product *= input[linear_index(&axes[k], &strides[k], point)];
            }
            result[linear_index(&axes[out], &strides[out], point)] += product;
        }

        Ok(result.into_iter().map(|v| result_type.round(v)).collect())
    }
}

impl fmt::Display for EinsumProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let output: String = self.output.iter().collect();
        let dims: String = self.dims.iter().collect();
        write!(f, "{}->{} over [{}]", self.spec.split("->").next().unwrap_or(""), output, dims)
    }
}

pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn linear_index(axes: &[usize], strides: &[usize], point: &[usize]) -> usize {
    axes.iter().zip(strides).map(|(d, s)| point[*d] * s).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matvec_implicit_output() {
        let problem = EinsumProblem::new("mn,n", "mn", 2).unwrap();
        assert_eq!(problem.output_indices(), &['m']);
        assert_eq!(problem.tensor_dims(0), vec![0, 1]);
        assert_eq!(problem.tensor_dims(1), vec![1]);
        assert_eq!(problem.tensor_dims(2), vec![0]);
        assert_eq!(problem.reduction_dims(), vec![1]);
        assert_eq!(problem.flops_per_iteration(), 2);
    }

    #[test]
    fn test_explicit_output_and_domain_order() {
        let problem = EinsumProblem::new("mk,kn->mn", "mnk", 2).unwrap();
        assert_eq!(problem.output_indices(), &['m', 'n']);
        assert_eq!(problem.tensor_dims(0), vec![0, 2]);
        assert_eq!(problem.tensor_dims(1), vec![2, 1]);
        assert!(problem.is_reduction(2));
    }

    #[test]
    fn test_rejects_bad_descriptions() {
        assert!(matches!(
            EinsumProblem::new("mn;n", "mn", 2),
            Err(ProblemError::InvalidSpec(_))
        ));
        assert!(matches!(
            EinsumProblem::new("mn,n", "m", 2),
            Err(ProblemError::DomainMismatch { .. })
        ));
        assert!(matches!(
            EinsumProblem::new("mn,n", "mn", 3),
            Err(ProblemError::ArityMismatch { found: 2, .. })
        ));
    }

    #[test]
    fn test_sizes_one_entry_per_key() {
        let sizes = test_sizes(&["m", "n"], &[vec![24, 32], vec![27, 37]]).unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[1].get("m"), Some(27));
        assert_eq!(sizes[1].get("n"), Some(37));
        assert_eq!(sizes[0].len(), 2);

        let err = test_sizes(&["m", "n"], &[vec![24]]).unwrap_err();
        assert!(matches!(err, ProblemError::SizeCount { .. }));
    }

    #[test]
    fn test_reference_matvec() {
        let problem = EinsumProblem::new("mn,n", "mn", 2).unwrap();
        let sizes = ProblemSizes::parse("m=2,n=3").unwrap();
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0, 0.0, -1.0];
        let y = problem.reference(&sizes, &[&a, &x], ElemType::F32).unwrap();
        assert_eq!(y, vec![-2.0, -2.0]);
    }

    #[test]
    fn test_parse_types_and_sizes() {
        assert_eq!(
            parse_types("f32,float32,f64").unwrap(),
            vec![ElemType::F32, ElemType::F32, ElemType::F64]
        );
        assert!(parse_types("i8").is_err());
        assert!(ProblemSizes::parse("m=x").is_err());
        assert_eq!(ProblemSizes::parse("m=4, n=5").unwrap().to_string(), "{m: 4, n: 5}");
    }
}
