//! flowrt CLI - flow project runner

use std::fs;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use flowrt::{
    EngineError, EventKind, FixSuggestion, FlowRole, HandlerRegistry, ProjectDef, Runtime,
};

#[derive(Parser)]
#[command(name = "flowrt")]
#[command(about = "flowrt - runtime for node-based flow projects")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a project file until its flows go idle
    Run {
        /// Path to the project .yaml file
        file: String,

        /// Trigger this action after the pages start
        #[arg(short, long)]
        action: Option<String>,

        /// Maximum number of pump passes before giving up
        #[arg(long, default_value_t = 4096)]
        max_passes: usize,

        /// Shutdown timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Print the event log as JSON after the run
        #[arg(long)]
        events: bool,
    },

    /// Validate a project file (compile only)
    Validate {
        /// Path to the project .yaml file
        file: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            action,
            max_passes,
            timeout_ms,
            events,
        } => run_project(&file, action, max_passes, timeout_ms, events),
        Commands::Validate { file } => validate_project(&file),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load(file: &str) -> Result<ProjectDef, EngineError> {
    let yaml = fs::read_to_string(file)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

fn run_project(
    file: &str,
    action: Option<String>,
    max_passes: usize,
    timeout_ms: u64,
    events: bool,
) -> Result<(), EngineError> {
    let project = load(file)?;
    let mut runtime = Runtime::new(project, &HandlerRegistry::builtin())?;

    runtime.start();
    if let Some(name) = action {
        runtime.trigger_action(&name)?;
    }
    let passes = runtime.run_until_idle(max_passes);
    runtime.stop(Duration::from_millis(timeout_ms));

    for event in runtime.events().events() {
        if let EventKind::LogInfo { component, message, .. } = &event.kind {
            println!("{} [{}] {}", "•".cyan(), component, message);
        }
    }
    if events {
        println!("{}", runtime.events().to_json());
    }

    match runtime.error() {
        Some(message) => {
            eprintln!("{} flow error: {}", "✗".red(), message);
            std::process::exit(1);
        }
        None => {
            println!(
                "{} Run finished in {} passes ({:?})",
                "✓".green(),
                passes,
                runtime.run_state()
            );
            Ok(())
        }
    }
}

fn validate_project(file: &str) -> Result<(), EngineError> {
    let project = load(file)?;
    let runtime = Runtime::new(project, &HandlerRegistry::builtin())?;

    let pages = runtime
        .flow_definitions()
        .filter(|f| f.role == FlowRole::Page)
        .count();
    let actions = runtime
        .flow_definitions()
        .filter(|f| f.role == FlowRole::Action)
        .count();

    println!("{} Project '{}' is valid", "✓".green(), file);
    println!("  Pages: {}", pages);
    println!("  Actions: {}", actions);

    Ok(())
}
