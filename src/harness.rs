//! Compile, run, and check every (types, sizes, expert) case
//!
//! The harness is the one effectful boundary: it builds a problem for each type
//! combination and size instantiation, compiles it through each expert, runs
//! the kernel on seeded inputs, and compares against the reference contraction.
//!
//! # Output
//! Progress goes to stdout. A failing case prints a line starting with
//! `FAILURE:`; passing runs never print that marker, so callers can grep the
//! combined stream for it.
//!
//! # Inputs
//! Inputs are integer valued in `[-4, 4]` so every partial sum is exact in
//! `f32`. The result buffer starts out as garbage; kernels must fill it.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::compiler::compile;
use crate::executor::{execute, ExecutionStats};
use crate::experts::Expert;
use crate::loop_nest::IrStats;
use crate::printer::render;
use crate::problem::{EinsumProblem, ElemType, ProblemError, ProblemSizes};

/// Marker printed for every failing case
pub const FAILURE_MARKER: &str = "FAILURE";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that abort a harness run
///
/// Per-case compile, execution, and mismatch errors are not errors here; they
/// are recorded as failed cases in the report.
#[derive(Debug)]
pub enum HarnessError {
    /// The problem factory rejected a size/type instantiation
    Problem(ProblemError),

    /// Dump or report files could not be written
    Io(String),

    /// The report could not be serialized
    Report(String),

    /// At least one case failed
    CasesFailed { failed: usize, total: usize },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Problem(e) => write!(f, "Invalid problem: {}", e),
            HarnessError::Io(msg) => write!(f, "I/O error: {}", msg),
            HarnessError::Report(msg) => write!(f, "Report serialization failed: {}", msg),
            HarnessError::CasesFailed { failed, total } => {
                write!(f, "{} of {} cases failed", failed, total)
            }
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<ProblemError> for HarnessError {
    fn from(err: ProblemError) -> Self {
        HarnessError::Problem(err)
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Report(err.to_string())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Harness options
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Timed runs per case (at least one run always happens)
    pub n_iters: usize,

    /// Name the kernel function is emitted under
    pub function_name: String,

    /// Run cases on the rayon thread pool
    pub parallel: bool,

    /// Print the compiled IR of every case
    pub verbose: bool,

    /// Base seed for input generation
    pub seed: u64,

    /// Relative tolerance; defaults per result type
    pub rtol: Option<f64>,

    /// Absolute tolerance; defaults per result type
    pub atol: Option<f64>,

    /// Write each compiled kernel's IR here
    pub dump_ir_dir: Option<PathBuf>,

    /// Write a JSON report here
    pub report_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            n_iters: 1,
            function_name: "kernel".to_string(),
            parallel: false,
            verbose: false,
            seed: 0,
            rtol: None,
            atol: None,
            dump_ir_dir: None,
            report_path: None,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    CompileFailed { error: String },
    ExecutionFailed { error: String },
    Mismatch {
        index: usize,
        expected: f64,
        actual: f64,
        max_abs_error: f64,
    },
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseStatus::Passed => write!(f, "passed"),
            CaseStatus::CompileFailed { error } => write!(f, "compilation failed: {}", error),
            CaseStatus::ExecutionFailed { error } => write!(f, "execution failed: {}", error),
            CaseStatus::Mismatch {
                index,
                expected,
                actual,
                max_abs_error,
            } => write!(
                f,
                "result mismatch at element {}: expected {}, got {} (max abs error {})",
                index, expected, actual, max_abs_error
            ),
        }
    }
}

/// Outcome of one (types, sizes, expert) case
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseResult {
    pub expert: String,
    pub sizes: ProblemSizes,
    pub types: Vec<ElemType>,
    #[serde(flatten)]
    pub status: CaseStatus,
    /// Wall time of each run
    pub timings_ms: Vec<f64>,
    /// Based on the fastest run
    pub gflops: f64,
    pub ir_stats: Option<IrStats>,
    pub exec_stats: Option<ExecutionStats>,
    #[serde(skip)]
    pub ir: Option<String>,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessReport {
    pub function_name: String,
    pub n_iters: usize,
    pub cases: Vec<CaseResult>,
}

impl HarnessReport {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(CaseResult::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed())
    }

    /// `Err` when any case failed; drives the process exit status
    pub fn check(&self) -> Result<(), HarnessError> {
        let failed = self.failures().count();
        if failed > 0 {
            return Err(HarnessError::CasesFailed {
                failed,
                total: self.cases.len(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    config: HarnessConfig,
}

struct Instance {
    types: Vec<ElemType>,
    sizes: ProblemSizes,
    problem: EinsumProblem,
    seed: u64,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Harness { config }
    }

    /// Run every case, printing progress, and return the report
    pub fn run<F>(
        &self,
        factory: F,
        types: &[Vec<ElemType>],
        sizes: &[ProblemSizes],
        experts: &[Expert],
    ) -> Result<HarnessReport, HarnessError>
    where
        F: Fn(&ProblemSizes, &[ElemType]) -> Result<EinsumProblem, ProblemError>,
    {
        let mut instances = Vec::with_capacity(types.len() * sizes.len());
        for type_combo in types {
            for size in sizes {
                let problem = factory(size, type_combo)?;
                problem.check_types(type_combo)?;
                let seed = self.config.seed.wrapping_add(instances.len() as u64);
                instances.push(Instance {
                    types: type_combo.clone(),
                    sizes: size.clone(),
                    problem,
                    seed,
                });
            }
        }

        let cases: Vec<(usize, &Expert)> = (0..instances.len())
            .flat_map(|i| experts.iter().map(move |e| (i, e)))
            .collect();
        info!(
            "Running {} cases ({} instances x {} experts)",
            cases.len(),
            instances.len(),
            experts.len()
        );

        let results: Vec<CaseResult> = if self.config.parallel {
            cases
                .par_iter()
                .map(|(i, expert)| self.run_case(&instances[*i], expert))
                .collect()
        } else {
            cases
                .iter()
                .map(|(i, expert)| self.run_case(&instances[*i], expert))
                .collect()
        };

        if let Some(dir) = &self.config.dump_ir_dir {
            fs::create_dir_all(dir)?;
        }

        let mut current: Option<usize> = None;
        for ((i, _), result) in cases.iter().zip(&results) {
            if current != Some(*i) {
                current = Some(*i);
                let instance = &instances[*i];
                println!("###############################################################");
                println!(
                    "Problem size {}, types [{}]",
                    instance.sizes,
                    type_names(&instance.types)
                );
            }
            self.print_case(result);
            if let (Some(dir), Some(ir)) = (&self.config.dump_ir_dir, &result.ir) {
                write_ir(dir, &self.config.function_name, result, ir)?;
            }
        }

        let report = HarnessReport {
            function_name: self.config.function_name.clone(),
            n_iters: self.config.n_iters,
            cases: results,
        };
        let failed = report.failures().count();
        println!(
            "{} of {} cases passed",
            report.cases.len() - failed,
            report.cases.len()
        );

        if let Some(path) = &self.config.report_path {
            let json = serde_json::to_string_pretty(&report)?;
            fs::write(path, json)?;
            debug!("Report written to {}", path.display());
        }
        Ok(report)
    }

    fn print_case(&self, result: &CaseResult) {
        println!("Compilation expert {}", result.expert);
        if self.config.verbose {
            if let Some(ir) = &result.ir {
                print!("{}", ir);
            }
        }
        println!("{}", case_line(result));
    }

    fn run_case(&self, instance: &Instance, expert: &Expert) -> CaseResult {
        let mut result = CaseResult {
            expert: expert.name.clone(),
            sizes: instance.sizes.clone(),
            types: instance.types.clone(),
            status: CaseStatus::Passed,
            timings_ms: Vec::new(),
            gflops: 0.0,
            ir_stats: None,
            exec_stats: None,
            ir: None,
        };

        let compiled = match compile(
            &instance.problem,
            &instance.sizes,
            &instance.types,
            &self.config.function_name,
            &expert.transforms,
        ) {
            Ok(c) => c,
            Err(e) => {
                result.status = CaseStatus::CompileFailed {
                    error: e.to_string(),
                };
                return result;
            }
        };
        result.ir_stats = Some(compiled.kernel.stats());
        if self.config.verbose || self.config.dump_ir_dir.is_some() {
            result.ir = Some(render(&compiled.kernel));
        }

        let problem = &instance.problem;
        let shapes = match problem.shapes(&instance.sizes) {
            Ok(s) => s,
            Err(e) => {
                result.status = CaseStatus::ExecutionFailed {
                    error: e.to_string(),
                };
                return result;
            }
        };
        let mut rng = StdRng::seed_from_u64(instance.seed);
        let mut buffers: Vec<Vec<f64>> = shapes
            .iter()
            .take(problem.arity())
            .map(|shape| {
                let len: usize = shape.iter().product();
                (0..len)
                    .map(|_| rng.gen_range(-4i32..=4) as f64)
                    .collect()
            })
            .collect();
        let expected = {
            let inputs: Vec<&[f64]> = buffers.iter().map(Vec::as_slice).collect();
            problem.reference(&instance.sizes, &inputs, instance.types[problem.arity()])
        };
        let expected = match expected {
            Ok(v) => v,
            Err(e) => {
                result.status = CaseStatus::ExecutionFailed {
                    error: e.to_string(),
                };
                return result;
            }
        };
        let garbage: Vec<f64> = (0..expected.len())
            .map(|_| rng.gen_range(100.0..1000.0))
            .collect();
        buffers.push(garbage);

        for _ in 0..self.config.n_iters.max(1) {
            let start = Instant::now();
            match execute(&compiled.kernel, &mut buffers) {
                Ok(stats) => result.exec_stats = Some(stats),
                Err(e) => {
                    result.status = CaseStatus::ExecutionFailed {
                        error: e.to_string(),
                    };
                    return result;
                }
            }
            result.timings_ms.push(start.elapsed().as_secs_f64() * 1e3);
        }

        let best_s = result.timings_ms.iter().copied().fold(f64::INFINITY, f64::min) / 1e3;
        if let Ok(flops) = problem.flop_count(&instance.sizes) {
            if best_s > 0.0 {
                result.gflops = flops as f64 / best_s / 1e9;
            }
        }

        let (default_rtol, default_atol) = instance.types[problem.arity()].default_tolerance();
        let rtol = self.config.rtol.unwrap_or(default_rtol);
        let atol = self.config.atol.unwrap_or(default_atol);
        if let Some(status) = check_result(&buffers[problem.arity()], &expected, rtol, atol) {
            result.status = status;
        }
        result
    }
}

/// Timing line for a passed case, `FAILURE:` line otherwise
fn case_line(result: &CaseResult) -> String {
    if result.passed() {
        let best = result.timings_ms.iter().copied().fold(f64::INFINITY, f64::min);
        format!(
            "  {:>10.3} ms  {:>8.3} GFlop/s  (best of {})",
            best,
            result.gflops,
            result.timings_ms.len()
        )
    } else {
        format!(
            "{}: {} with sizes {}: {}",
            FAILURE_MARKER, result.expert, result.sizes, result.status
        )
    }
}

/// First element violating `|actual - expected| <= atol + rtol * |expected|`
fn check_result(actual: &[f64], expected: &[f64], rtol: f64, atol: f64) -> Option<CaseStatus> {
    if actual.len() != expected.len() {
        return Some(CaseStatus::ExecutionFailed {
            error: format!(
                "result has {} elements, expected {}",
                actual.len(),
                expected.len()
            ),
        });
    }
    let mut first = None;
    let mut max_abs_error = 0.0f64;
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let err = (a - e).abs();
        let ok = err <= atol + rtol * e.abs();
        if !ok {
            // NaN is sticky
            if err.is_nan() || max_abs_error.is_nan() {
                max_abs_error = f64::NAN;
            } else {
                max_abs_error = max_abs_error.max(err);
            }
            if first.is_none() {
                first = Some((i, *e, *a));
            }
        }
    }
    first.map(|(index, expected, actual)| CaseStatus::Mismatch {
        index,
        expected,
        actual,
        max_abs_error,
    })
}

fn type_names(types: &[ElemType]) -> String {
    types.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
}

fn write_ir(dir: &Path, function_name: &str, result: &CaseResult, ir: &str) -> Result<(), HarnessError> {
    let sizes: Vec<String> = result.sizes.iter().map(|(k, v)| format!("{}{}", k, v)).collect();
    let path = dir.join(format!(
        "{}_{}_{}.mlir",
        function_name,
        result.expert,
        sizes.join("_")
    ));
    fs::write(&path, ir)?;
    debug!("IR written to {}", path.display());
    Ok(())
}

/// Run the harness with default options apart from `n_iters` and `function_name`
pub fn test_harness<F>(
    factory: F,
    types: &[Vec<ElemType>],
    sizes: &[ProblemSizes],
    experts: &[Expert],
    n_iters: usize,
    function_name: &str,
) -> Result<HarnessReport, HarnessError>
where
    F: Fn(&ProblemSizes, &[ElemType]) -> Result<EinsumProblem, ProblemError>,
{
    let config = HarnessConfig {
        n_iters,
        function_name: function_name.to_string(),
        ..HarnessConfig::default()
    };
    Harness::new(config).run(factory, types, sizes, experts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result() {
        assert_eq!(check_result(&[1.0, 2.0], &[1.0, 2.0], 1e-5, 1e-5), None);
        match check_result(&[1.0, 2.5], &[1.0, 2.0], 1e-5, 1e-5) {
            Some(CaseStatus::Mismatch { index, max_abs_error, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(max_abs_error, 0.5);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert!(matches!(
            check_result(&[f64::NAN], &[0.0], 1e-5, 1e-5),
            Some(CaseStatus::Mismatch { .. })
        ));
    }

    #[test]
    fn test_nan_error_is_sticky() {
        match check_result(&[f64::NAN, 5.0], &[0.0, 1.0], 1e-5, 1e-5) {
            Some(CaseStatus::Mismatch { index, max_abs_error, .. }) => {
                assert_eq!(index, 0);
                assert!(max_abs_error.is_nan());
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    fn case(status: CaseStatus) -> CaseResult {
        CaseResult {
            expert: "tile_1".to_string(),
            sizes: ProblemSizes::parse("m=24,n=32").unwrap(),
            types: vec![ElemType::F32; 3],
            status,
            timings_ms: vec![0.5],
            gflops: 1.0,
            ir_stats: None,
            exec_stats: None,
            ir: None,
        }
    }

    #[test]
    fn test_failure_line_only_for_failures() {
        let passed = case_line(&case(CaseStatus::Passed));
        assert!(!passed.contains(FAILURE_MARKER));
        assert!(passed.contains("GFlop/s"));

        let failed = case_line(&case(CaseStatus::CompileFailed {
            error: "x".to_string(),
        }));
        assert!(failed.starts_with("FAILURE: tile_1 with sizes "));
        assert!(failed.ends_with("compilation failed: x"));
    }

    #[test]
    fn test_report_check() {
        let mut report = HarnessReport {
            function_name: "matvec".to_string(),
            n_iters: 1,
            cases: vec![case(CaseStatus::Passed), case(CaseStatus::Passed)],
        };
        assert!(report.check().is_ok());

        report.cases[1].status = CaseStatus::ExecutionFailed {
            error: "x".to_string(),
        };
        match report.check() {
            Err(HarnessError::CasesFailed { failed, total }) => {
                assert_eq!((failed, total), (1, 2));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_factory_errors_abort() {
        let sizes = vec![ProblemSizes::parse("m=2,n=3").unwrap()];
        let err = test_harness(
            |_, _| EinsumProblem::new("mn,n", "mk", 2),
            &[vec![ElemType::F32; 3]],
            &sizes,
            &[],
            1,
            "matvec",
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Problem(ProblemError::DomainMismatch { .. })));
    }
}
