use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use android_kernel_builder::analyzer;
use android_kernel_builder::make_args::filter_make_args;
use android_kernel_builder::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Format of diagnostic logs on stderr (filter with RUST_LOG)
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Load config, compute the plan, and run it task by task
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends/env)
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Scan a build log for known compiler and linker errors
    Analyze {
        log: PathBuf,
        /// Write the error count here when errors are found
        #[arg(long)]
        sentinel: Option<PathBuf>,
        /// Write the report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show which make arguments would be passed through
    FilterArgs {
        #[arg(allow_hyphen_values = true, num_args = 0..)]
        args: Vec<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "android_kernel_builder=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    let res = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = res {
        eprintln!("tracing init failed: {e}");
    }
}

fn main() -> Result<()> {
    // CI inputs may come from a .env file next to the build definition.
    let env_file = dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_format);
    if let Some(p) = env_file {
        tracing::debug!(path = %p.display(), "loaded .env");
    }

    match args.cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Run { build, dry_run } => cmd_run(&build, dry_run),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Analyze {
            log,
            sentinel,
            report,
        } => cmd_analyze(&log, sentinel.as_deref(), report.as_deref()),
        Command::FilterArgs { args } => cmd_filter_args(&args),
    }
}

fn load(path: &Path) -> Result<android_kernel_builder::config::ConfigDoc> {
    let doc = android_kernel_builder::config::load_with_env(path)?;
    tracing::info!(build = %path.display(), "loaded build definition");
    Ok(doc)
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = load(path)?;
    let plan = android_kernel_builder::modules::build_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}{}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label,
            if task.best_effort { " (best effort)" } else { "" }
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::config(format!("failed to render resolved config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_run(path: &Path, dry_run: bool) -> Result<()> {
    let doc = load(path)?;
    let plan = android_kernel_builder::modules::build_plan(&doc)?;
    let reg = android_kernel_builder::executor::builtin_registry()?;
    let sink = Arc::new(android_kernel_builder::executor::StdoutSink::from_env());
    let mut ctx = android_kernel_builder::executor::ExecCtx::new(dry_run, sink);
    android_kernel_builder::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}

fn cmd_analyze(log: &Path, sentinel: Option<&Path>, report: Option<&Path>) -> Result<()> {
    let analysis = analyzer::analyze_file(log)?;
    let text = analysis.render();
    match report {
        Some(p) => std::fs::write(p, &text)?,
        None => print!("{text}"),
    }
    if let Some(s) = sentinel
        && analysis.has_errors()
    {
        std::fs::write(s, format!("{}\n", analysis.count()))?;
    }
    tracing::info!(
        errors = analysis.count(),
        lines = analysis.lines_scanned,
        "analysis finished"
    );
    Ok(())
}

fn cmd_filter_args(args: &[String]) -> Result<()> {
    let filtered = filter_make_args(args);
    for a in &filtered.accepted {
        println!("{a}");
    }
    for r in &filtered.rejected {
        eprintln!("rejected: {r}");
    }
    Ok(())
}
