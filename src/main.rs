//! codegen-experts CLI
//!
//! # Usage
//!
//! ## The matvec experts
//! ```bash
//! cargo run --bin codegen-experts -- matvec --parallel --report matvec.json
//! ```
//!
//! ## Listing experts
//! ```bash
//! cargo run --bin codegen-experts -- list-experts --json > experts.json
//! ```
//!
//! ## Arbitrary contractions
//! ```bash
//! cargo run --bin codegen-experts -- run \
//!   --spec mk,kn --dims mnk \
//!   --sizes "m=16,n=24,k=8;m=17,n=23,k=9" \
//!   --experts matmul_experts.json \
//!   --function-name matmul
//! ```
//!
//! The process exits with an error if any case fails.

use clap::{Parser, Subcommand};
use codegen_experts::harness::{Harness, HarnessConfig, HarnessReport};
use codegen_experts::matvec;
use codegen_experts::problem::{parse_types, EinsumProblem, ProblemSizes};
use codegen_experts::Expert;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[clap(name = "codegen-experts")]
#[clap(about = "Compile, run, and check einsum kernels through transformation experts")]
#[clap(version = "0.1")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

/// Options shared by every harness run
#[derive(clap::Args)]
struct RunOptions {
    /// Timed runs per case
    #[clap(long = "n-iters", default_value = "1")]
    n_iters: usize,

    /// Run cases in parallel
    #[clap(long = "parallel")]
    parallel: bool,

    /// Base seed for input generation
    #[clap(long = "seed", default_value = "0")]
    seed: u64,

    /// Relative tolerance (defaults per result type)
    #[clap(long = "rtol")]
    rtol: Option<f64>,

    /// Absolute tolerance (defaults per result type)
    #[clap(long = "atol")]
    atol: Option<f64>,

    /// Write the compiled IR of every case to this directory
    #[clap(long = "dump-ir", value_name = "DIR")]
    dump_ir: Option<PathBuf>,

    /// Write a JSON report
    #[clap(long = "report", value_name = "FILE")]
    report: Option<PathBuf>,

    /// Print the compiled IR of every case
    #[clap(long = "verbose", short = 'v')]
    verbose: bool,
}

impl RunOptions {
    /// No option differs from the fixed matvec configuration
    fn is_default(&self) -> bool {
        self.n_iters == matvec::N_ITERS
            && !self.parallel
            && self.seed == 0
            && self.rtol.is_none()
            && self.atol.is_none()
            && self.dump_ir.is_none()
            && self.report.is_none()
            && !self.verbose
    }

    fn into_config(self, function_name: &str) -> HarnessConfig {
        HarnessConfig {
            n_iters: self.n_iters,
            function_name: function_name.to_string(),
            parallel: self.parallel,
            verbose: self.verbose,
            seed: self.seed,
            rtol: self.rtol,
            atol: self.atol,
            dump_ir_dir: self.dump_ir,
            report_path: self.report,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the twelve matvec experts at both problem sizes
    Matvec {
        #[clap(flatten)]
        options: RunOptions,
    },

    /// Print the built-in matvec experts
    ListExperts {
        /// Emit JSON accepted by `run --experts`
        #[clap(long = "json")]
        json: bool,
    },

    /// Run experts from a JSON file on an arbitrary einsum problem
    Run {
        /// Einsum index expression, e.g. mk,kn
        #[clap(long = "spec")]
        spec: String,

        /// Iteration domain (loop order), e.g. mnk
        #[clap(long = "dims")]
        dims: String,

        /// Size instantiations separated by ';', e.g. "m=8,n=8,k=4;m=9,n=7,k=5"
        #[clap(long = "sizes")]
        sizes: String,

        /// JSON array of experts
        #[clap(long = "experts", value_name = "FILE")]
        experts: PathBuf,

        /// Element types of the operands and the result
        #[clap(long = "types")]
        types: Option<String>,

        /// Name of the kernel function the experts target
        #[clap(long = "function-name", default_value = "kernel")]
        function_name: String,

        #[clap(flatten)]
        options: RunOptions,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Matvec { options } => {
            let report = if options.is_default() {
                matvec::main()?
            } else {
                matvec::run(options.into_config(matvec::FUNCTION_NAME))?
            };
            report.check()?;
        }

        Commands::ListExperts { json } => {
            let experts = matvec::all_experts();
            if json {
                println!("{}", serde_json::to_string_pretty(&experts)?);
            } else {
                for expert in &experts {
                    println!("{}", expert.name);
                    for transform in expert.tiling_transforms() {
                        println!("  {}", transform);
                    }
                }
            }
        }

        Commands::Run {
            spec,
            dims,
            sizes,
            experts,
            types,
            function_name,
            options,
        } => {
            let report = run_command(&spec, &dims, &sizes, &experts, types, &function_name, options)?;
            report.check()?;
        }
    }

    Ok(())
}

fn run_command(
    spec: &str,
    dims: &str,
    sizes: &str,
    experts_file: &Path,
    types: Option<String>,
    function_name: &str,
    options: RunOptions,
) -> Result<HarnessReport, Box<dyn std::error::Error>> {
    let arity = spec.split("->").next().unwrap_or("").split(',').count();
    // validate the problem once up front
    let problem = EinsumProblem::new(spec, dims, arity)?;
    let types = match types {
        Some(t) => parse_types(&t)?,
        None => vec![codegen_experts::ElemType::F32; problem.num_tensors()],
    };
    let size_list: Vec<ProblemSizes> = sizes
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .map(ProblemSizes::parse)
        .collect::<Result<_, _>>()?;
    let experts: Vec<Expert> = serde_json::from_str(&fs::read_to_string(experts_file)?)?;
    info!(
        "Loaded {} experts from {}",
        experts.len(),
        experts_file.display()
    );

    let harness = Harness::new(options.into_config(function_name));
    let report = harness.run(
        |_, _| EinsumProblem::new(spec, dims, arity),
        &[types],
        &size_list,
        &experts,
    )?;
    Ok(report)
}
