use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use turbofiber::{
    CompletionSignal, Context, PinningStrategy, Scheduler, SchedulerConfig, SchedulerError,
    WorkerMask,
};

#[derive(Parser, Debug)]
#[command(name = "turbofiber")]
#[command(version)]
#[command(about = "Runs the dependency-graph demo scenarios on the fiber scheduler")]
struct Args {
    /// Scenario to run
    #[arg(long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Worker threads (clamped to 8..=64). Default: one per logical CPU
    #[arg(long)]
    workers: Option<usize>,

    /// Fiber stack size in KiB
    #[arg(long, default_value = "256")]
    stack_kb: usize,

    /// Worker pinning strategy
    #[arg(long, value_enum, default_value = "none")]
    pinning: Pinning,

    /// Repeat every scenario this many times
    #[arg(long, default_value = "1")]
    rounds: usize,

    /// JSON scheduler configuration; overrides the flags above
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a Chrome trace of executed jobs to this file
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Two jobs behind a shared gate, joined
    Gate,
    /// Job followed by a successor
    Successor,
    /// Job followed by three completors
    Completors,
    /// Two forked chains merged, forked again and merged
    Diamond,
    All,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Pinning {
    None,
    Linear,
    AvoidSmt,
}

impl From<Pinning> for PinningStrategy {
    fn from(p: Pinning) -> Self {
        match p {
            Pinning::None => PinningStrategy::None,
            Pinning::Linear => PinningStrategy::Linear,
            Pinning::AvoidSmt => PinningStrategy::AvoidSMT,
        }
    }
}

type Counter = Arc<AtomicI64>;

fn add(counter: &Counter, times: i64, delta: i64) {
    for _ in 0..times {
        counter.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Two jobs add 1000 each once a gate opens; waits on their join.
fn gate(ctx: &Context<'_>, counter: &Counter) -> turbofiber::Result<i64> {
    let gate = CompletionSignal::with_pending(1);
    let join = ctx.fetch_signal();
    for _ in 0..2 {
        let c = counter.clone();
        let job = ctx.post_fn_after(move |_: &Context<'_>| add(&c, 1000, 1), &gate, WorkerMask::ANY_EXCEPT_MAIN)?;
        ctx.add_pre_condition(&join, job.signal());
    }
    gate.trigger(0, ctx);
    ctx.yield_for(&join);
    Ok(2000)
}

/// One job adds 1000, its successor takes it away again.
fn successor(ctx: &Context<'_>, counter: &Counter) -> turbofiber::Result<i64> {
    let c = counter.clone();
    let first = ctx.post_fn(move |_: &Context<'_>| add(&c, 1000, 1), WorkerMask::ANY_EXCEPT_MAIN)?;
    let c = counter.clone();
    let second = first.post_successor_fn(move |_: &Context<'_>| add(&c, 1000, -1), WorkerMask::ANY_EXCEPT_MAIN)?;
    ctx.yield_for(second.signal());
    Ok(0)
}

/// One job adds 1000; three completors subtract 1000, add 1000, add 1000.
fn completors(ctx: &Context<'_>, counter: &Counter) -> turbofiber::Result<i64> {
    let c = counter.clone();
    let first = ctx.post_fn(move |_: &Context<'_>| add(&c, 1000, 1), WorkerMask::ANY_EXCEPT_MAIN)?;
    let join = ctx.fetch_signal();
    for delta in [-1, 1, 1] {
        let c = counter.clone();
        let completor = first.post_completor_fn(ctx, move |_: &Context<'_>, _pre: i32| add(&c, 1000, delta))?;
        ctx.add_pre_condition(&join, completor.signal());
    }
    ctx.yield_for(&join);
    Ok(2000)
}

/// Two chains forking into 2 and 3 successors, joined into a merge job that
/// forks into 3 more, joined into a final job.
fn diamond(ctx: &Context<'_>, counter: &Counter) -> turbofiber::Result<i64> {
    let mask = WorkerMask::ANY_EXCEPT_MAIN;
    let step = |delta: i64| {
        let c = counter.clone();
        move |_: &Context<'_>| add(&c, 1, delta)
    };

    let left = ctx.post_fn(step(1), mask)?;
    let right = ctx.post_fn(step(2), mask)?;
    let first_join = ctx.fetch_signal();
    for _ in 0..2 {
        let fork = left.post_successor_fn(step(10), mask)?;
        ctx.add_pre_condition(&first_join, fork.signal());
    }
    for _ in 0..3 {
        let fork = right.post_successor_fn(step(-1), mask)?;
        ctx.add_pre_condition(&first_join, fork.signal());
    }

    let merge = ctx.post_fn_after(step(100), &first_join, mask)?;
    let second_join = ctx.fetch_signal();
    for _ in 0..3 {
        let fork = merge.post_successor_fn(step(5), mask)?;
        ctx.add_pre_condition(&second_join, fork.signal());
    }
    let last = ctx.post_fn_after(step(1000), &second_join, mask)?;
    ctx.yield_for(last.signal());
    Ok(1 + 2 * 10 + 2 - 3 + 100 + 3 * 5 + 1000)
}

type ScenarioFn = fn(&Context<'_>, &Counter) -> turbofiber::Result<i64>;

fn run_scenario(scheduler: &Scheduler, name: &'static str, body: ScenarioFn) -> Result<bool, SchedulerError> {
    let counter: Counter = Arc::new(AtomicI64::new(0));
    let expected = Arc::new(AtomicI64::new(i64::MIN));
    let start = Instant::now();

    let (c, e) = (counter.clone(), expected.clone());
    let driver = scheduler.post_fn(
        move |ctx: &Context<'_>| match body(ctx, &c) {
            Ok(value) => {
                e.store(value, Ordering::SeqCst);
                0
            }
            Err(err) => {
                tracing::error!(scenario = name, error = %err, "scenario failed to post");
                1
            }
        },
        WorkerMask::ANY_EXCEPT_MAIN,
    )?;
    scheduler.block_on(driver.signal())?;

    let got = counter.load(Ordering::SeqCst);
    let want = expected.load(Ordering::SeqCst);
    let ok = got == want;
    println!(
        "  {:<11} counter = {:>5} (expected {:>5}) in {:?} {}",
        name,
        got,
        want,
        start.elapsed(),
        if ok { "ok" } else { "MISMATCH" }
    );
    Ok(ok)
}

fn load_config(args: &Args) -> Result<SchedulerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SchedulerConfig {
            worker_count: args.workers.unwrap_or_else(num_cpus::get),
            stack_size: args.stack_kb * 1024,
            pinning: args.pinning.into(),
            ..SchedulerConfig::default()
        },
    };
    if args.trace.is_some() {
        config.trace_jobs = true;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let scheduler = Scheduler::start(config)?;
    tracing::info!(workers = scheduler.worker_count(), "scheduler started");

    let scenarios: [(Scenario, &'static str, ScenarioFn); 4] = [
        (Scenario::Gate, "gate", gate),
        (Scenario::Successor, "successor", successor),
        (Scenario::Completors, "completors", completors),
        (Scenario::Diamond, "diamond", diamond),
    ];

    let mut failures = 0;
    for round in 0..args.rounds {
        println!("Round {}", round + 1);
        for (kind, name, body) in scenarios {
            if args.scenario == Scenario::All || args.scenario == kind {
                if !run_scenario(&scheduler, name, body)? {
                    failures += 1;
                }
            }
        }
    }

    let metrics = scheduler.metrics();
    scheduler.shut_down()?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    if let Some(path) = &args.trace {
        scheduler.export_trace(path)?;
        tracing::info!(path = %path.display(), "trace written");
    }

    if failures > 0 {
        return Err(format!("{} scenario run(s) produced a wrong total", failures).into());
    }
    Ok(())
}
