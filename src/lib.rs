//! runlane: a parallel test-execution engine.
//!
//! Test files are discovered, filtered and sharded, split into contiguous
//! lanes, and run as external processes, one live process per lane. Each
//! process outcome is classified (pass, timeout, crash, signal, exit code),
//! failing tests are retried, and per-lane results are folded into a
//! single summary once every lane has finished.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Spawn**: run one command with a deadline and classify the outcome
//! - **Discovery**: walk and filter local tests, resolve vendor suites
//! - **Orchestrator**: partition into lanes, retry, persist, aggregate
//! - **Report**: console, GitHub annotations, JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use runlane::config::load_config;
//! use runlane::orchestrator::Orchestrator;
//! use runlane::report::ConsoleReporter;
//! use runlane::vcs::GitCli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("runlane.toml"))?;
//!     let git = GitCli::new(Duration::from_secs(600));
//!     let orchestrator = Orchestrator::new(config, ConsoleReporter::new(false), git);
//!
//!     let outcome = orchestrator.run().await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod orchestrator;
pub mod report;
pub mod result;
pub mod spawn;
pub mod vcs;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use discovery::{DiscoveryError, FilterOptions, Selection, filter_tests, list_all_tests};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use report::Reporter;
pub use result::{RunSummary, TestResult, TestStatus};
pub use spawn::{SpawnRequest, SpawnResult, Spawner};
pub use vcs::{RunContext, SourceControl};
