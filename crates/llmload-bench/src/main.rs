use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use llmload_core::collector::{ResultCollector, RunSummary, ScenarioRun};
use llmload_core::config::{Config, Scenario};
use llmload_core::executor::RequestExecutor;
use llmload_core::generator::{RequestTemplate, TrafficGenerator};
use llmload_core::report::{render_summary, write_run, write_summary_json};
use llmload_core::scheduler::{build_scheduler, plan_arrivals, seeded_rng};
use llmload_core::sweep::{itl_sweep, ttft_sweep};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// idle keep-alive connections kept per host between requests
const POOL_IDLE_PER_HOST: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// debug-level logs (one line per request)
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open-loop scenario run(s)
    Run(RunArgs),
    /// Fixed-concurrency TTFT / ITL sweep against one model
    Sweep(SweepArgs),
}

#[derive(Args, Debug)]
struct Common {
    #[arg(long)]
    url: Option<String>,

    /// 逗号分隔的模型列表，如：Chatbot-A-large,Chatbot-B
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    out_dir: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// round-robin | zipfian | bursty | all
    #[arg(long, default_value = "all")]
    scenario: String,

    /// requests per second
    #[arg(long)]
    rate: Option<f64>,

    /// seconds per scenario
    #[arg(long)]
    duration: Option<u64>,

    /// 场景之间休息 N 秒（让服务端队列排空）
    #[arg(long)]
    pause_secs: Option<u64>,

    /// print the arrival plan in virtual time and exit without sending anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[command(flatten)]
    common: Common,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// model under test (default: first configured model)
    #[arg(long)]
    model: Option<String>,

    #[arg(long, value_delimiter = ',')]
    input_lengths: Vec<u32>,

    #[arg(long)]
    samples: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long, value_delimiter = ',')]
    batch_sizes: Vec<usize>,

    #[arg(long, default_value_t = false)]
    skip_ttft: bool,

    #[arg(long, default_value_t = false)]
    skip_itl: bool,

    #[command(flatten)]
    common: Common,
}

impl Common {
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.url {
            cfg.url = v;
        }
        if !self.models.is_empty() {
            cfg.models = self.models;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.request_timeout_ms = v;
        }
        if let Some(v) = self.max_tokens {
            cfg.max_tokens = v;
        }
        if let Some(v) = self.out_dir {
            cfg.out_dir = v;
        }
    }
}

fn parse_scenarios(s: &str) -> anyhow::Result<Vec<Scenario>> {
    if s == "all" {
        return Ok(Scenario::ALL.to_vec());
    }
    s.split(',').map(|p| p.trim().parse()).collect()
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::from_file(p),
        None => Ok(Config::default()),
    }
}

fn finish(out_dir: &Path, runs: &[ScenarioRun], summaries: &mut Vec<RunSummary>) -> anyhow::Result<()> {
    for run in runs {
        write_run(out_dir, run)?;
        let s = run.summary();
        println!("{}", render_summary(&s));
        summaries.push(s);
    }
    Ok(())
}

fn print_plan(cfg: &Config, scenario: Scenario) -> anyhow::Result<()> {
    let mut sched = build_scheduler(scenario, cfg, seeded_rng(cfg.seed, scenario))?;
    let plan = plan_arrivals(sched.as_mut(), cfg.duration());

    println!("=== Arrival plan ({scenario}, {}s) ===", cfg.duration_secs);
    for a in &plan {
        println!("{:>10.3}s  {:<10} {}", a.offset.as_secs_f64(), format!("{:?}", a.kind), a.model);
    }
    let mut per_model: BTreeMap<&str, usize> = BTreeMap::new();
    for a in &plan {
        *per_model.entry(a.model.as_str()).or_default() += 1;
    }
    println!("total={} per_model={per_model:?}", plan.len());
    Ok(())
}

async fn run(mut cfg: Config, args: RunArgs) -> anyhow::Result<()> {
    let scenarios = parse_scenarios(&args.scenario)?;
    if let Some(v) = args.rate {
        cfg.target_rps = v;
    }
    if let Some(v) = args.duration {
        cfg.duration_secs = v;
    }
    if let Some(v) = args.pause_secs {
        cfg.scenario_pause_secs = v;
    }
    args.common.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    if args.dry_run {
        for s in scenarios {
            print_plan(&cfg, s)?;
        }
        return Ok(());
    }

    tracing::info!(
        url = %cfg.url,
        models = ?cfg.models,
        rate = cfg.target_rps,
        duration_s = cfg.duration_secs,
        seed = cfg.seed,
        "starting load test"
    );

    let exec = Arc::new(RequestExecutor::new(&cfg.url, cfg.request_timeout(), POOL_IDLE_PER_HOST)?);
    let gen = TrafficGenerator::new(exec, RequestTemplate::from_config(&cfg));
    let out_dir = PathBuf::from(&cfg.out_dir);
    let pause = Duration::from_secs(cfg.scenario_pause_secs);

    let mut summaries = Vec::with_capacity(scenarios.len());
    for (i, &scenario) in scenarios.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tracing::info!(pause_s = cfg.scenario_pause_secs, next = %scenario, "cooling down between scenarios");
            tokio::time::sleep(pause).await;
        }
        let mut sched = build_scheduler(scenario, &cfg, seeded_rng(cfg.seed, scenario))?;
        let inflight = gen.run_for(sched.as_mut(), cfg.duration()).await;
        let run = ResultCollector::collect(inflight).await;
        finish(&out_dir, std::slice::from_ref(&run), &mut summaries)?;
    }

    let path = out_dir.join("summary.json");
    write_summary_json(&path, &summaries)?;
    tracing::info!(path = %path.display(), "summary saved");
    Ok(())
}

async fn sweep(mut cfg: Config, args: SweepArgs) -> anyhow::Result<()> {
    if let Some(v) = args.model {
        cfg.sweep.model = Some(v);
    }
    if !args.input_lengths.is_empty() {
        cfg.sweep.input_lengths = args.input_lengths;
    }
    if let Some(v) = args.samples {
        cfg.sweep.samples = v;
    }
    if let Some(v) = args.concurrency {
        cfg.sweep.concurrency = v;
    }
    if !args.batch_sizes.is_empty() {
        cfg.sweep.batch_sizes = args.batch_sizes;
    }
    args.common.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    let model = cfg.sweep_model().to_string();
    let pool = cfg
        .sweep
        .batch_sizes
        .iter()
        .copied()
        .chain(std::iter::once(cfg.sweep.concurrency))
        .max()
        .unwrap_or(1);
    let exec = Arc::new(RequestExecutor::new(&cfg.url, cfg.request_timeout(), pool)?);
    let gen = TrafficGenerator::new(exec, RequestTemplate::from_config(&cfg));
    let out_dir = PathBuf::from(&cfg.out_dir);
    tracing::info!(url = %cfg.url, model = %model, "starting sweep");

    let mut summaries = Vec::new();
    if !args.skip_ttft {
        let runs = ttft_sweep(&gen, &cfg.sweep, &model).await;
        finish(&out_dir, &runs, &mut summaries)?;
    }
    if !args.skip_itl {
        let runs = itl_sweep(&gen, &cfg.sweep, &model).await;
        finish(&out_dir, &runs, &mut summaries)?;
    }

    let path = out_dir.join("summary.json");
    write_summary_json(&path, &summaries)?;
    tracing::info!(path = %path.display(), "summary saved");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = load_config(cli.config.as_deref())?;
    match cli.cmd {
        Command::Run(args) => run(cfg, args).await,
        Command::Sweep(args) => sweep(cfg, args).await,
    }
}
