use clap::{Parser, Subcommand};
use clap_complete::engine::{ArgValueCompleter, CompletionCandidate};

#[derive(Parser)]
#[command(name = "devtun", about = "Self-healing SSH port forwarding", version)]
pub struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

fn complete_service_names(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let prefix = current.to_str().unwrap_or("");
    let cfg = crate::config::Config::load().unwrap_or_default();
    cfg.services
        .iter()
        .filter(|s| s.name.starts_with(prefix))
        .map(|s| CompletionCandidate::new(&s.name))
        .collect()
}

#[derive(Subcommand)]
pub enum Command {
    /// Start every configured tunnel and show the live dashboard
    #[command(alias = "start")]
    Up,
    /// List configured services
    #[command(alias = "ls")]
    List,
    /// Add a service interactively
    Add,
    /// Edit a service
    Edit {
        /// Service name (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_service_names))]
        name: Option<String>,
    },
    /// Remove a service
    #[command(alias = "rm")]
    Remove {
        /// Service name (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_service_names))]
        name: Option<String>,
    },
    /// Configure the SSH gateway
    Endpoint,
    /// Probe the SSH gateway once
    Check,
    /// Show forwarding logs for a service
    Logs {
        /// Service name (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_service_names))]
        name: Option<String>,
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
    /// Initialize or edit ~/.devtun/config.toml
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for (reads from config if omitted)
        shell: Option<clap_complete::Shell>,
    },
}
