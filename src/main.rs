use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use cadre::config::Config;
use cadre::core::ExecutionId;
use cadre::input::load_tasks;
use cadre::orchestration::{
    CommandInvoker, GateRegistry, JsonFileStore, Orchestrator, Quota, RunStatus, ScopeRegistry,
    TaskRunner,
};
use cadre::{clog, clog_warn, Error, Result};

/// cadre - dependency-aware agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "cadre")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CADRE_DEBUG=1   Enable debug logging (alternative to --debug)\n    CADRE_LOG=PATH  Write the log somewhere other than ~/.cadre/cadre.log"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadre/cadre.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.cadre/cadre.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a task file without running anything
    Validate {
        /// Task file (.json or .toml)
        file: PathBuf,
    },

    /// Print the batch plan as JSON
    Plan {
        /// Task file (.json or .toml)
        file: PathBuf,
    },

    /// Run every task and print the run report as JSON
    Run {
        /// Task file (.json or .toml)
        file: PathBuf,

        /// Requests per hour for the shared agent gate (-1 = unlimited)
        #[arg(long, allow_negative_numbers = true)]
        rate_limit: Option<i64>,

        /// Directory for run state (overrides config)
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Print a stored run report
    Report {
        /// Execution id printed by `run`
        execution_id: String,

        /// Directory for run state (overrides config)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cadre::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Validate { file } => run_validate(&file),
        Command::Plan { file } => run_plan(&file),
        Command::Run {
            file,
            rate_limit,
            store,
        } => run_tasks(&file, config, rate_limit, store),
        Command::Report {
            execution_id,
            store,
        } => run_report(&execution_id, &config, store),
    }
}

fn run_validate(file: &Path) -> Result<()> {
    let tasks = load_tasks(file)?;
    let dag = cadre::core::TaskDAG::from_definitions(&tasks)?;
    let batches = dag.batches()?;
    let order: Vec<String> = dag
        .topological_order()?
        .iter()
        .map(|t| t.id.to_string())
        .collect();
    println!(
        "{}: {} task(s) in {} batch(es)",
        file.display(),
        tasks.len(),
        batches.len()
    );
    println!("serial order: {}", order.join(", "));
    Ok(())
}

fn run_plan(file: &Path) -> Result<()> {
    let tasks = load_tasks(file)?;
    let batches = cadre::plan_batches(&tasks)?;
    let plan: Vec<_> = batches
        .iter()
        .map(|b| {
            serde_json::json!({
                "index": b.index,
                "layer": b.layer,
                "parallel_group": b.parallel_group,
                "tasks": b.task_ids(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn run_tasks(
    file: &Path,
    config: Config,
    rate_limit: Option<i64>,
    store: Option<PathBuf>,
) -> Result<()> {
    let tasks = load_tasks(file)?;
    let quota = match rate_limit {
        Some(limit) => Quota::from_limit(limit)?,
        None => config.quota()?,
    };
    let store_dir = match store {
        Some(dir) => dir,
        None => config.store_dir()?,
    };

    let mut invoker = CommandInvoker::new(&config.agent.command, config.agent.args.clone())?;
    if let Some(dir) = config.agent_working_dir() {
        invoker = invoker.with_working_dir(dir);
    }

    let gates = GateRegistry::new();
    let gate = gates.get_or_create(&config.gate.resource, quota);
    let store = Arc::new(JsonFileStore::new(&store_dir));

    let runner = TaskRunner::new(Arc::new(invoker), gate, store)
        .with_breaker_config(config.breaker.clone())
        .with_qc_output_limit(config.engine.qc_output_limit);
    let scopes = Arc::new(ScopeRegistry::new());
    let orchestrator = Orchestrator::new(runner).with_scopes(Arc::clone(&scopes));

    let execution_id = ExecutionId::new();
    clog!(
        "Run command: file={} execution={} gate={} store={}",
        file.display(),
        execution_id,
        quota,
        store_dir.display()
    );
    eprintln!("execution {} ({} task(s))", execution_id, tasks.len());

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let scope = scopes.create(execution_id);

        let signal_scopes = Arc::clone(&scopes);
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                clog_warn!("Interrupt received, cancelling run");
                signal_scopes.cancel(&execution_id, "interrupted");
            }
        });

        let outcome = orchestrator.run_in_scope(&tasks, &scope).await;
        signal.abort();
        outcome
    });

    let report = match outcome {
        Ok(report) => report,
        Err(e @ Error::Cancelled { .. }) => {
            eprintln!(
                "run cancelled; partial report at {}",
                store_dir
                    .join(execution_id.to_string())
                    .join("report.json")
                    .display()
            );
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn run_report(execution_id: &str, config: &Config, store: Option<PathBuf>) -> Result<()> {
    let execution_id: ExecutionId = execution_id
        .parse()
        .map_err(|_| Error::Store(format!("invalid execution id: {}", execution_id)))?;
    let store_dir = match store {
        Some(dir) => dir,
        None => config.store_dir()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(JsonFileStore::new(store_dir).load_report(&execution_id))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_flags() {
        let cli = Cli::try_parse_from([
            "cadre",
            "run",
            "tasks.json",
            "--rate-limit",
            "-1",
            "--store",
            "/tmp/runs",
        ])
        .unwrap();
        assert!(!cli.debug);
        match cli.command {
            Command::Run {
                file,
                rate_limit,
                store,
            } => {
                assert_eq!(file, PathBuf::from("tasks.json"));
                assert_eq!(rate_limit, Some(-1));
                assert_eq!(store, Some(PathBuf::from("/tmp/runs")));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_global_debug_flag() {
        let cli = Cli::try_parse_from(["cadre", "plan", "tasks.toml", "--debug"]).unwrap();
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Command::Plan {
                file: PathBuf::from("tasks.toml")
            }
        );
    }

    #[test]
    fn test_validate_requires_file() {
        assert!(Cli::try_parse_from(["cadre", "validate"]).is_err());
    }

    #[test]
    fn test_report_command() {
        let cli = Cli::try_parse_from(["cadre", "report", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Report { ref execution_id, store: None } if execution_id == "abc"
        ));
    }
}
