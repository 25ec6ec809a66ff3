use std::{path::PathBuf, process, time::Duration};

use argh::FromArgs;
use log::LevelFilter;
use mm::{Config, FitPolicy};
use snafu::{ResultExt as _, ensure_whatever};

use self::{
    error::{GenericError, Report},
    eval::{EvalOptions, TraceResult, count_f64},
    style::{Color, WithFg},
    trace::{BUILTIN_TRACES, Trace},
};

mod error;
mod eval;
mod logger;
mod style;
mod trace;

/// Replay allocation traces against the heap allocator and report
/// correctness, space utilization and throughput.
#[derive(Debug, FromArgs)]
struct Args {
    /// trace files to replay (the built-in traces if none are given)
    #[argh(positional)]
    traces: Vec<PathBuf>,
    /// fit policy: `first-fit` or `best-fit`
    #[argh(option, default = "FitPolicy::FirstFit")]
    fit: FitPolicy,
    /// minimum number of bytes to grow the heap by
    #[argh(option, default = "Config::DEFAULT_CHUNK_SIZE")]
    chunk_size: usize,
    /// capacity of the simulated heap region in bytes
    #[argh(option, default = "memlib::DEFAULT_CAPACITY")]
    heap_limit: usize,
    /// verify heap invariants after every operation
    #[argh(switch)]
    check: bool,
    /// enable debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// enable per-operation trace logging
    #[argh(switch)]
    trace_log: bool,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    let level = if args.trace_log {
        LevelFilter::Trace
    } else if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    logger::init(level).whatever_context("failed to install logger")?;
    ensure_whatever!(args.heap_limit > 0, "heap limit must not be zero");

    let options = EvalOptions {
        config: Config::new()
            .with_chunk_size(args.chunk_size)
            .with_fit(args.fit),
        heap_limit: args.heap_limit,
        check_heap: args.check,
    };
    let traces = load_traces(args)?;
    log::debug!("evaluating {} traces with {options:?}", traces.len());

    println!(
        "{:<16} {:>5} {:>7} {:>8} {:>10} {:>10}",
        "trace", "valid", "util", "ops", "secs", "Kops/s"
    );
    let mut results = Vec::new();
    let mut failed = 0;
    for trace in &traces {
        match eval::eval_trace(trace, &options) {
            Ok(result) => {
                print_row(&result);
                results.push(result);
            }
            Err(err) => {
                failed += 1;
                println!("{:<16} {:>5}", trace.name, WithFg::new(Color::Red, "no"));
                eprintln!("{}", Report::new(err));
            }
        }
    }
    print_totals(&results);

    ensure_whatever!(
        failed == 0,
        "{failed} of {} traces failed",
        traces.len()
    );
    Ok(())
}

fn load_traces(args: &Args) -> Result<Vec<Trace>, GenericError> {
    if args.traces.is_empty() {
        return BUILTIN_TRACES
            .iter()
            .map(|(name, text)| {
                Trace::parse(*name, text)
                    .with_whatever_context(|_| format!("failed to parse built-in trace, name={name}"))
            })
            .collect();
    }
    args.traces
        .iter()
        .map(|path| {
            Trace::read(path).with_whatever_context(|_| {
                format!("failed to load trace, path={}", path.display())
            })
        })
        .collect()
}

fn print_row(result: &TraceResult) {
    println!(
        "{:<16} {:>5} {:>6.1}% {:>8} {:>10.6} {:>10.0}",
        result.name,
        "yes",
        result.utilization * 100.0,
        result.ops,
        result.elapsed.as_secs_f64(),
        result.throughput() / 1000.0
    );
}

fn print_totals(results: &[TraceResult]) {
    let weight = results.iter().map(|r| r.weight).sum::<usize>();
    if weight == 0 {
        return;
    }
    let utilization = results
        .iter()
        .map(|r| r.utilization * count_f64(r.weight))
        .sum::<f64>()
        / count_f64(weight);
    let ops = results.iter().map(|r| r.ops).sum::<usize>();
    let elapsed = results.iter().map(|r| r.elapsed).sum::<Duration>();
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 { count_f64(ops) / secs } else { 0.0 };
    println!(
        "{:<16} {:>5} {:>6.1}% {:>8} {:>10.6} {:>10.0}",
        "total",
        "",
        utilization * 100.0,
        ops,
        secs,
        throughput / 1000.0
    );
}
