//! codegen-experts: transformation-pipeline experts for einsum kernels
//!
//! A kernel is described as an einsum contraction, compiled through a named
//! pipeline of transforms (an *expert*), then run and checked against a
//! reference evaluation:
//!
//! ```text
//! EinsumProblem + ProblemSizes -> Kernel -> Tile/Fuse/Pad/Vectorize -> Bufferize -> Lower
//!                                                                                      |
//!                        reference contraction  <-- compare -->  executor::execute  <--+
//! ```
//!
//! # Module Organization
//!
//! ## Descriptors
//! - [`problem`]: einsum problems, element types, size instantiation
//! - [`transforms`]: transform descriptors and `TransformationList`
//! - [`experts`]: named pipelines and the shared lowering suffix
//!
//! ## Compilation
//! - [`loop_nest`]: loop-nest IR (loops, pads, op leaves)
//! - [`compiler`]: applies pipelines to kernels
//! - [`printer`]: scf-like text rendering of kernels
//!
//! ## Execution
//! - [`executor`]: interprets lowered kernels
//! - [`harness`]: compiles, runs, and checks every case
//!
//! ## Drivers
//! - [`matvec`]: the matrix-vector product with its twelve experts
//!
//! # Example
//! ```no_run
//! use codegen_experts::matvec;
//!
//! let report = matvec::run(matvec::config())?;
//! assert!(report.passed());
//! # Ok::<(), codegen_experts::HarnessError>(())
//! ```

// ============================================================================
// Descriptors
// ============================================================================

pub mod experts;
pub mod problem;
pub mod transforms;

// ============================================================================
// Compilation
// ============================================================================

pub mod compiler;
pub mod loop_nest;
pub mod printer;

// ============================================================================
// Execution
// ============================================================================

pub mod executor;
pub mod harness;

// ============================================================================
// Drivers
// ============================================================================

pub mod matvec;

// ============================================================================
// Re-exports
// ============================================================================

pub use compiler::{compile, CompileError, Compilation};
pub use executor::{execute, ExecError, ExecutionStats};
pub use experts::{bufferize_and_lower, lowering_only_expert, Expert};
pub use harness::{test_harness, Harness, HarnessConfig, HarnessError, HarnessReport};
pub use problem::{test_sizes, EinsumProblem, ElemType, ProblemError, ProblemSizes};
pub use transforms::{Fuse, Generalize, Tile, Transform, TransformationList, Vectorize};
