//! wm-decider CLI: drive the decision engine from a JSON event script.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use wm_decider::engine::{Engine, EngineConfig};
use wm_decider::observer::DecisionPrinter;
use wm_decider::run::{RunLength, StopHandle};
use wm_decider::script::{Script, ScriptRunner};
use wm_decider::symbol::Value;

#[derive(Parser)]
#[command(
    name = "wm-decider",
    version,
    about = "Working-memory consistency and decision engine"
)]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script through the decision cycle, printing each decision.
    Run {
        /// Path to the JSON event script.
        #[arg(long)]
        script: PathBuf,

        /// Stop after this many decision cycles.
        #[arg(long)]
        decisions: Option<u64>,

        /// Print engine statistics when the run ends.
        #[arg(long)]
        stats: bool,
    },

    /// Run a script to completion and print the top goal's decision.
    Resolve {
        /// Path to the JSON event script.
        #[arg(long)]
        script: PathBuf,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => Ok(EngineConfig::load(p)?),
        None => Ok(EngineConfig::default()),
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            script,
            decisions,
            stats,
        } => {
            let script = Script::load(&script)?;
            let mut engine = Engine::new(config)?;
            engine.add_decision_observer(Arc::new(DecisionPrinter));
            let mut runner = ScriptRunner::new(script);
            let length = decisions.map_or(RunLength::Forever, RunLength::Decisions);
            let report = engine.run(&mut runner, length, &StopHandle::new())?;
            println!(
                "stopped after {} decisions ({} elaborations): {:?}",
                report.decisions, report.elaborations, report.reason
            );
            if stats {
                print!("{}", engine.statistics());
            }
        }

        Commands::Resolve { script } => {
            let script = Script::load(&script)?;
            let operator = Value::sym(config.operator_attribute.as_str());
            let mut engine = Engine::new(config)?;
            let mut runner = ScriptRunner::new(script);
            engine.run(&mut runner, RunLength::Forever, &StopHandle::new())?;
            let top = engine.top_goal();
            match engine.slot_value(top, &operator) {
                Some(value) => println!("{}", engine.render(&value)),
                None => match engine.current_impasse(top) {
                    Some((subgoal, info)) => println!(
                        "impasse: {} {} ({})",
                        engine.object_name(subgoal),
                        info.kind.as_str(),
                        info.attribute.as_str()
                    ),
                    None => println!("no decision"),
                },
            }
        }

        Commands::Config => {
            let text = toml::to_string_pretty(&config).into_diagnostic()?;
            print!("{text}");
        }
    }

    Ok(())
}
