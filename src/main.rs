//! runlane CLI - parallel test runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use runlane::config::{self, Config};
use runlane::orchestrator::{EXIT_CANCELLED, Orchestrator};
use runlane::report::{ConsoleReporter, GithubReporter, JUnitReporter, MultiReporter, NullReporter};
use runlane::vcs::{GitCli, RunContext};

#[derive(Parser)]
#[command(name = "runlane")]
#[command(about = "Parallel test runner with lanes, retries and vendor suites", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "runlane.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Override the number of lanes
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Stop at the first failing test
        #[arg(long)]
        bail: bool,

        /// Attempts per test, including the first
        #[arg(long)]
        max_attempts: Option<u32>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Print test output as it arrives
        #[arg(long)]
        stream: bool,

        /// Keep lane logs after a passing run
        #[arg(long)]
        keep_logs: bool,
    },

    /// Discover and filter tests without running them
    List {
        #[command(flatten)]
        overrides: Overrides,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Write a starter configuration file
    Init,
}

/// Flags shared by `run` and `list`.
#[derive(Args, Default)]
struct Overrides {
    /// Working directory tests are spawned from
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Executable substituted for {exec}
    #[arg(long)]
    exec_path: Option<String>,

    /// Test command template, e.g. "bun test {test}"
    #[arg(long)]
    test_command: Option<String>,

    /// This invocation's shard
    #[arg(long)]
    shard_id: Option<usize>,

    /// Total number of shards
    #[arg(long)]
    max_shards: Option<usize>,

    /// Keep only paths containing one of these (comma separated)
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Drop paths containing one of these (comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Ad-hoc filters; disables sharding and smoke sampling
    #[arg(value_name = "FILTER")]
    only: Vec<String>,

    /// Run a random sample of the tests (fraction, default 0.01)
    #[arg(long, num_args = 0..=1, default_missing_value = "0.01")]
    smoke: Option<f64>,

    /// Also run vendor suites
    #[arg(long)]
    vendor: bool,
}

impl Overrides {
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(cwd) = &self.cwd {
            config.runner.cwd = cwd.clone();
        }
        if let Some(exec_path) = &self.exec_path {
            config.runner.exec_path = exec_path.clone();
        }
        if let Some(command) = &self.test_command {
            config.runner.test_command = shell_words::split(command)
                .with_context(|| format!("Invalid test command: {}", command))?;
        }
        if let Some(id) = self.shard_id {
            config.shard.id = id;
        }
        if let Some(count) = self.max_shards {
            config.shard.count = count;
        }
        if !self.include.is_empty() {
            config.filters.include = self.include.clone();
        }
        if !self.exclude.is_empty() {
            config.filters.exclude = self.exclude.clone();
        }
        if !self.only.is_empty() {
            config.filters.only = self.only.clone();
        }
        if self.smoke.is_some() {
            config.filters.smoke = self.smoke;
        }
        if self.vendor {
            config.vendor.enabled = true;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            overrides,
            parallel,
            bail,
            max_attempts,
            junit,
            stream,
            keep_logs,
        } => {
            let mut config = load(&cli.config, &overrides)?;
            if parallel.is_some() {
                config.runner.parallelism = parallel;
            }
            if bail {
                config.runner.bail = true;
            }
            if let Some(max_attempts) = max_attempts {
                config.runner.max_attempts = max_attempts;
            }
            if junit.is_some() {
                config.report.junit = junit;
            }
            if keep_logs {
                config.report.keep_logs = true;
            }
            config.validate()?;
            run_tests(config, stream, cli.verbose).await
        }
        Commands::List { overrides, format } => {
            let config = load(&cli.config, &overrides)?;
            config.validate()?;
            list_tests(config, &format).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

fn load(path: &Path, overrides: &Overrides) -> Result<Config> {
    let mut config = config::load_config_or_default(path)?;
    overrides.apply(&mut config)?;
    Ok(config)
}

async fn run_tests(config: Config, stream: bool, verbose: bool) -> Result<()> {
    spawn_signal_handler();

    let git = GitCli::new(config.runner.spawn_timeout());
    let context = RunContext::detect(&config.runner.cwd, &git).await;
    if let Some(meta) = &context.git {
        info!(
            "Testing {} on {}",
            meta.short_sha(),
            meta.branch.as_deref().unwrap_or("detached HEAD")
        );
    }

    let reporter = create_reporter(&config, context, verbose);
    let orchestrator = Orchestrator::new(config, reporter, git).stream_output(stream);
    info!("Run {}", orchestrator.run_id());

    let outcome = orchestrator.run().await?;
    std::process::exit(outcome.exit_code());
}

async fn list_tests(config: Config, format: &str) -> Result<()> {
    let git = GitCli::new(config.runner.spawn_timeout());
    let orchestrator = Orchestrator::new(config, NullReporter, git);
    let tests = orchestrator.discover().await?.display_paths();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&tests)?),
        _ => {
            println!("Discovered {} tests:", tests.len());
            for test in &tests {
                println!("  {}", test);
            }
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Tests root:   {}", config.runner.tests_root.display());
    println!("  Test command: {}", shell_words::join(&config.runner.test_command));
    println!("  Lanes:        {}", config.parallelism());
    println!("  Test timeout: {}s", config.runner.test_timeout_secs);
    println!("  Max attempts: {}", config.runner.max_attempts);
    println!("  Shard:        {}/{}", config.shard.id, config.shard.count);
    println!(
        "  Vendor:       {}",
        if config.vendor.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    let config = r#"# runlane configuration file

[runner]
tests_root = "test"
exec_path = "bun"
test_command = ["{exec}", "test", "{test}"]
test_timeout_secs = 300
max_attempts = 3

[install]
command = ["{exec}", "install"]
roots = ["."]

[filters]
include = []
exclude = []

[vendor]
enabled = false
manifest = "test/vendor.json"
checkout_dir = "vendor"

[report]
# junit = "test-results/junit.xml"
"#;

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  runlane run");
    Ok(())
}

fn create_reporter(config: &Config, context: RunContext, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));

    if config.report.github.unwrap_or_else(GithubReporter::detect) {
        multi = multi.with_reporter(GithubReporter::new(context));
    }

    if let Some(path) = &config.report.junit {
        multi = multi.with_reporter(JUnitReporter::new(config.runner.cwd.join(path)));
    }

    multi
}

/// Exits with the cancelled status on interrupt, terminate or hangup.
///
/// Children still running are not waited for.
fn spawn_signal_handler() {
    tokio::spawn(async {
        wait_for_signal().await;
        warn!("Cancelled by signal");
        std::process::exit(EXIT_CANCELLED);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut terminate), Ok(mut hangup)) =
        (signal(SignalKind::terminate()), signal(SignalKind::hangup()))
    else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
