use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use awq_dequant::{
    awq_dequantize,
    reference::{all_close, max_abs_diff, AwqProblem},
};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
struct Case {
    n: usize,
    m: usize,
    group_size: usize,
}

impl Display for Case {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} g{}", self.n, self.m, self.group_size)
    }
}

fn parse_case(s: &str) -> Result<Case, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("`{s}`: {e}"))?;
    match parts.as_slice() {
        [n, m, group_size] => Ok(Case {
            n: *n,
            m: *m,
            group_size: *group_size,
        }),
        _ => Err(format!("`{s}`: expected `n,m,group_size`")),
    }
}

fn parse_dtype(s: &str) -> Result<DType, String> {
    match s {
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        "f32" => Ok(DType::F32),
        other => Err(format!("unsupported dtype `{other}`, expected f16, bf16 or f32")),
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Problem sizes to run, as `n,m,group_size` separated by `;`.
    #[arg(
        long,
        value_parser = parse_case,
        value_delimiter = ';',
        default_value = "64,64,64;16,2048,4;128,4096,128;256,8192,256"
    )]
    cases: Vec<Case>,

    /// Scale dtypes to run.
    #[arg(long, value_parser = parse_dtype, value_delimiter = ',', default_value = "f16,f32")]
    scale_dtypes: Vec<DType>,

    /// Output dtypes to run.
    #[arg(long, value_parser = parse_dtype, value_delimiter = ',', default_value = "f16,f32")]
    out_dtypes: Vec<DType>,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Time the operator and the reference after checking correctness.
    #[arg(long)]
    profile: bool,

    /// Untimed runs before each measurement.
    #[arg(long, default_value_t = 10)]
    num_prerun: usize,

    /// Timed runs per measurement.
    #[arg(long, short = 'i', default_value_t = 1000)]
    num_iterations: usize,
}

fn initialize_logging() {
    let is_debug = std::env::var("AWQ_DEQUANT_DEBUG")
        .unwrap_or_default()
        .contains('1');
    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Mean wall time of `f` over `iterations` runs, after `prerun` untimed runs.
fn time_op<F>(prerun: usize, iterations: usize, mut f: F) -> anyhow::Result<Duration>
where
    F: FnMut() -> candle_core::Result<Tensor>,
{
    for _ in 0..prerun {
        f()?;
    }
    let start = Instant::now();
    for _ in 0..iterations {
        f()?;
    }
    Ok(mean_duration(start.elapsed(), iterations))
}

fn mean_duration(total: Duration, iterations: usize) -> Duration {
    total.div_f64(iterations.max(1) as f64)
}

struct BenchResult {
    case: Case,
    scale_dtype: DType,
    out_dtype: DType,
    outcome: Outcome,
}

enum Outcome {
    Rejected(String),
    Checked {
        passed: bool,
        max_diff: f64,
        timings: Option<(Duration, Duration)>,
    },
}

fn run_case(
    args: &Args,
    case: Case,
    scale_dtype: DType,
    out_dtype: DType,
) -> anyhow::Result<Outcome> {
    let dev = Device::Cpu;
    if case.group_size == 0 || case.n % case.group_size != 0 {
        // No consistent random problem exists; report the operator's own error.
        let zeros_n = if case.group_size == 0 {
            0
        } else {
            case.n / case.group_size
        };
        let qweight = Tensor::zeros((case.n, case.m / 8), DType::U32, &dev)?;
        let qzeros = Tensor::zeros((zeros_n, case.m / 8), DType::U32, &dev)?;
        let scales = Tensor::zeros((zeros_n, case.m), scale_dtype, &dev)?;
        return Ok(
            match awq_dequantize(&qweight, &qzeros, &scales, case.group_size, out_dtype) {
                Ok(_) => Outcome::Rejected("unexpectedly accepted".to_string()),
                Err(e) => Outcome::Rejected(e.to_string()),
            },
        );
    }

    let p = AwqProblem::random(case.n, case.m, case.group_size, scale_dtype, args.seed, &dev)?;
    let out = match awq_dequantize(&p.qweight, &p.qzeros, &p.scales, p.group_size, out_dtype) {
        Ok(out) => out,
        Err(e) => return Ok(Outcome::Rejected(e.to_string())),
    };
    let expected = p.reference(out_dtype)?;
    let passed = all_close(&out, &expected)?;
    let max_diff = max_abs_diff(&out, &expected)?;
    if !passed {
        warn!("{case} ({scale_dtype:?} -> {out_dtype:?}) exceeds tolerance, max diff {max_diff}");
    }

    let timings = if args.profile {
        let lib = time_op(args.num_prerun, args.num_iterations, || {
            awq_dequantize(&p.qweight, &p.qzeros, &p.scales, p.group_size, out_dtype)
        })?;
        let reference = time_op(args.num_prerun, args.num_iterations, || {
            p.reference(out_dtype)
        })?;
        Some((lib, reference))
    } else {
        None
    };

    Ok(Outcome::Checked {
        passed,
        max_diff,
        timings,
    })
}

fn ms(d: Duration) -> String {
    format!("{:.4}", d.as_secs_f64() * 1e3)
}

fn print_results(results: &[BenchResult]) {
    let rows: Vec<Vec<CellStruct>> = results
        .iter()
        .map(|r| {
            let (status, max_diff, lib, reference) = match &r.outcome {
                Outcome::Rejected(e) => (
                    format!("rejected: {e}"),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                ),
                Outcome::Checked {
                    passed,
                    max_diff,
                    timings,
                } => (
                    if *passed { "ok" } else { "FAIL" }.to_string(),
                    format!("{max_diff:.3e}"),
                    timings.map_or("-".to_string(), |(l, _)| ms(l)),
                    timings.map_or("-".to_string(), |(_, r)| ms(r)),
                ),
            };
            vec![
                r.case.to_string().cell(),
                format!("{:?}", r.scale_dtype).cell(),
                format!("{:?}", r.out_dtype).cell(),
                status.cell(),
                max_diff.cell().justify(Justify::Right),
                lib.cell().justify(Justify::Right),
                reference.cell().justify(Justify::Right),
            ]
        })
        .collect();

    let table = rows
        .table()
        .title(vec![
            "case".cell().bold(true),
            "scales".cell().bold(true),
            "output".cell().bold(true),
            "status".cell().bold(true),
            "max diff".cell().bold(true),
            "lib ms".cell().bold(true),
            "reference ms".cell().bold(true),
        ])
        .bold(true);
    if let Err(e) = print_stdout(table) {
        warn!("Failed to print results table: {e}");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    info!(
        "Running {} case(s), seed {}, profile = {}",
        args.cases.len(),
        args.seed,
        args.profile
    );

    let mut results = Vec::new();
    for case in &args.cases {
        for scale_dtype in &args.scale_dtypes {
            for out_dtype in &args.out_dtypes {
                info!("Testing {case} with {scale_dtype:?} scales, {out_dtype:?} output");
                let outcome = run_case(&args, *case, *scale_dtype, *out_dtype)?;
                results.push(BenchResult {
                    case: *case,
                    scale_dtype: *scale_dtype,
                    out_dtype: *out_dtype,
                    outcome,
                });
            }
        }
    }
    print_results(&results);

    let failed = results
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Checked { passed: false, .. }))
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} configuration(s) exceeded tolerance");
    }
    Ok(())
}
