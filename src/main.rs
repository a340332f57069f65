mod cli;
mod config;
mod display;
mod error;
mod health;
mod logging;
mod monitor;
mod netstats;
mod picker;
mod process;
mod registry;
mod shutdown;
mod snapshot;
mod supervisor;
mod tunnel;
mod wizard;

use std::io::Write;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use sysinfo::Networks;

use cli::{Cli, Command};
use config::Config;
use monitor::{Connectivity, Probe, SshProbe};
use netstats::{NetCounters, Throughput};
use process::SystemRunner;
use registry::SupervisorRegistry;
use shutdown::Shutdown;
use supervisor::SupervisorContext;
use tunnel::{EndpointCell, RemoteEndpoint};

fn main() -> Result<()> {
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();

    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if !matches!(cli.command, Command::Up) {
        logging::init_stderr();
    }

    match cli.command {
        Command::Up => cmd_up(&Config::load()?),
        Command::List => cmd_list(&Config::load()?),
        Command::Add => cmd_add(&mut Config::load()?),
        Command::Edit { name } => cmd_edit(name, &mut Config::load()?),
        Command::Remove { name } => cmd_remove(name, &mut Config::load()?),
        Command::Endpoint => cmd_endpoint(&mut Config::load()?),
        Command::Check => cmd_check(&Config::load()?),
        Command::Logs {
            name,
            lines,
            follow,
        } => cmd_logs(name, lines, follow, &Config::load()?),
        Command::Config => cmd_config(),
        Command::Completions { shell } => cmd_completions(shell),
    }
}

/// What wakes the dashboard loop besides its refresh timer.
enum UiEvent {
    Interrupt,
    ConfigChanged,
}

fn cmd_up(cfg: &Config) -> Result<()> {
    cfg.validate()?;
    if cfg.services.is_empty() {
        println!("{}", "No services configured to start.".yellow());
        println!("Run `devtun add` to forward your first port.");
        return Ok(());
    }

    logging::init_file(&config::state_dir()?.join("devtun.log"), cfg.max_log_size)?;

    let ctx = Arc::new(SupervisorContext {
        endpoint: Arc::new(EndpointCell::new(cfg.endpoint.clone())),
        connectivity: Arc::new(Connectivity::new()),
        runner: Arc::new(SystemRunner::new(Some(process::log_dir()?), cfg.max_log_size)),
        shutdown: Arc::new(Shutdown::new()),
        backoff: cfg.timing.backoff(),
    });
    let registry = SupervisorRegistry::new(ctx);
    registry.start_monitor(
        Arc::new(SshProbe),
        cfg.timing.probe_timeout(),
        cfg.timing.poll_interval(),
    );
    registry.start_all(&cfg.services);

    let (events_tx, events) = mpsc::channel();
    let interrupt_tx = events_tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(UiEvent::Interrupt);
    })
    .context("failed to install Ctrl-C handler")?;

    let _watcher = match config::watch(&config::config_path()?, move || {
        let _ = events_tx.send(UiEvent::ConfigChanged);
    }) {
        Ok(w) => Some(w),
        Err(e) => {
            log::warn!("config edits will not be picked up: {:#}", e);
            None
        }
    };

    let mut endpoint = cfg.endpoint.clone();
    let mut networks = Networks::new_with_refreshed_list();
    let mut net = Throughput::default();
    let mut sampled_at = Instant::now();

    loop {
        net.update(NetCounters::sample(&mut networks));
        let interval = sampled_at.elapsed();
        sampled_at = Instant::now();
        display::render_dashboard(&registry.snapshot(), &endpoint, &net, interval);

        match events.recv_timeout(cfg.timing.refresh()) {
            Ok(UiEvent::Interrupt) => {
                println!();
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt("Stop devtun and close all tunnels?")
                    .default(true)
                    .interact()
                    .unwrap_or(true);
                if confirmed {
                    break;
                }
                // Drop repeated Ctrl-C presses but keep config edits.
                let mut reload = false;
                while let Ok(event) = events.try_recv() {
                    reload |= matches!(event, UiEvent::ConfigChanged);
                }
                if reload {
                    apply_reload(&registry, &mut endpoint);
                }
            }
            Ok(UiEvent::ConfigChanged) => apply_reload(&registry, &mut endpoint),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("{}", "Closing tunnels...".dimmed());
    registry.shutdown();
    println!("{}", "Stopped. Goodbye!".green());
    Ok(())
}

/// Re-read the config: swap in a changed gateway and start supervisors for
/// newly added services. Running services keep the spec they started with.
fn apply_reload(registry: &SupervisorRegistry, endpoint: &mut RemoteEndpoint) {
    let cfg = match Config::load().and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("ignoring config change: {:#}", e);
            return;
        }
    };

    if cfg.endpoint != *endpoint {
        registry.reconfigure(cfg.endpoint.clone());
        *endpoint = cfg.endpoint.clone();
    }

    let snap = registry.snapshot();
    for spec in &cfg.services {
        if snap.get(&spec.name).is_some_and(|e| e.spec != *spec) {
            log::info!(
                "{}: edited to {}; restart devtun to apply",
                spec.name,
                spec
            );
        }
    }

    for name in registry.start_all(&cfg.services) {
        if let Some(status) = registry.get(&name) {
            log::info!("{}: added from config ({})", name, status.state);
        }
    }
}

fn cmd_list(cfg: &Config) -> Result<()> {
    display::print_service_list(&cfg.services);
    Ok(())
}

fn cmd_add(cfg: &mut Config) -> Result<()> {
    let taken: Vec<String> = cfg.services.iter().map(|s| s.name.clone()).collect();
    let spec = wizard::prompt_service(None, &taken)?;
    let name = spec.name.clone();
    cfg.add_service(spec)?;
    let path = cfg.save()?;

    println!(
        "{} {} added to {}",
        "✓".green(),
        name.green().bold(),
        path.display()
    );
    Ok(())
}

/// Resolve a service name from the argument or an interactive picker.
fn resolve_name(name: Option<String>, prompt: &str, cfg: &Config) -> Result<String> {
    match name {
        Some(n) => {
            if cfg.service(&n).is_none() {
                anyhow::bail!("service '{}' not found", n);
            }
            Ok(n)
        }
        None => picker::pick_service(prompt, &cfg.services),
    }
}

fn cmd_edit(name: Option<String>, cfg: &mut Config) -> Result<()> {
    let name = resolve_name(name, "Edit service", cfg)?;
    let current = cfg
        .service(&name)
        .cloned()
        .with_context(|| format!("service '{}' not found", name))?;
    let taken: Vec<String> = cfg
        .services
        .iter()
        .filter(|s| s.name != name)
        .map(|s| s.name.clone())
        .collect();

    let updated = wizard::prompt_service(Some(&current), &taken)?;
    let new_name = updated.name.clone();
    cfg.update_service(&name, updated)?;
    cfg.save()?;

    if new_name != name {
        process::cleanup_logs(&name)?;
        println!(
            "{} renamed {} -> {}",
            "✓".green(),
            name.green().bold(),
            new_name.green().bold()
        );
    } else {
        println!("{} {} updated", "✓".green(), name.green().bold());
    }
    println!(
        "  {}",
        "Running dashboards pick this up on their next start.".dimmed()
    );
    Ok(())
}

fn cmd_remove(name: Option<String>, cfg: &mut Config) -> Result<()> {
    if cfg.services.is_empty() {
        println!("{}", "No services configured.".yellow());
        return Ok(());
    }
    let name = resolve_name(name, "Remove service", cfg)?;

    let confirmed = dialoguer::Confirm::new()
        .with_prompt(format!("Remove {}?", name))
        .default(false)
        .interact()
        .context("failed to read confirmation")?;

    if !confirmed {
        println!("Cancelled.");
        return Ok(());
    }

    cfg.remove_service(&name);
    let path = cfg.save()?;
    process::cleanup_logs(&name)?;

    println!(
        "{} {} removed from {}",
        "✓".green(),
        name.green().bold(),
        path.display()
    );
    Ok(())
}

fn cmd_endpoint(cfg: &mut Config) -> Result<()> {
    let endpoint = wizard::prompt_endpoint(&cfg.endpoint)?;

    print!("  checking {} ... ", endpoint);
    let _ = std::io::stdout().flush();
    let reachable = SshProbe.probe(&endpoint, cfg.timing.probe_timeout());
    if reachable {
        println!("{}", "ok".green());
    } else {
        println!("{}", "unreachable".red());
        let save = dialoguer::Confirm::new()
            .with_prompt("Could not connect with these settings. Save anyway?")
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !save {
            println!("Cancelled.");
            return Ok(());
        }
    }

    cfg.endpoint = endpoint;
    let path = cfg.save()?;
    println!("{} SSH endpoint saved to {}", "✓".green(), path.display());
    Ok(())
}

fn cmd_check(cfg: &Config) -> Result<()> {
    cfg.validate_endpoint()?;
    let timeout = cfg.timing.probe_timeout();
    if SshProbe.probe(&cfg.endpoint, timeout) {
        println!(
            "  {} {} {}",
            "●".green(),
            cfg.endpoint.to_string().green().bold(),
            "reachable".green()
        );
        Ok(())
    } else {
        println!(
            "  {} {} {}",
            "○".red(),
            cfg.endpoint.to_string().red().bold(),
            format!("unreachable (timeout {}s)", timeout.as_secs()).red()
        );
        anyhow::bail!("gateway unreachable")
    }
}

fn cmd_logs(name: Option<String>, lines: usize, follow: bool, cfg: &Config) -> Result<()> {
    let name = resolve_name(name, "Show logs for", cfg)?;
    let log_path = process::log_file(&name)?;

    if !log_path.exists() {
        println!("{} No log file for '{}'", "⚠".yellow(), name);
        return Ok(());
    }

    if log_path.metadata().map(|m| m.len()).unwrap_or(0) == 0 && !follow {
        println!("{} Log is empty — no errors from ssh", "✓".green());
        return Ok(());
    }

    let mut args = vec![format!("-n{}", lines)];
    if follow {
        args.push("-f".to_string());
    }
    args.push(log_path.to_string_lossy().to_string());

    let status = std::process::Command::new("tail")
        .args(&args)
        .status()
        .context("failed to run tail")?;

    if !status.success() {
        anyhow::bail!("tail exited with {}", status);
    }

    Ok(())
}

fn cmd_config() -> Result<()> {
    let path = Config::init()?;
    let editor = Config::editor_for(&path);

    let status = std::process::Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("failed to launch editor '{}'", editor))?;

    if !status.success() {
        anyhow::bail!("editor exited with {}", status);
    }

    Ok(())
}

fn cmd_completions(shell: Option<clap_complete::Shell>) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => {
            let cfg = Config::load()?;
            let name = cfg.shell.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "no shell specified — use `devtun completions <shell>` or set `shell` in ~/.devtun/config.toml"
                )
            })?;
            name.parse::<clap_complete::Shell>()
                .map_err(|_| anyhow::anyhow!("unknown shell '{}' in config", name))?
        }
    };

    let shell_name = match shell {
        clap_complete::Shell::Bash => "bash",
        clap_complete::Shell::Zsh => "zsh",
        clap_complete::Shell::Fish => "fish",
        clap_complete::Shell::Elvish => "elvish",
        clap_complete::Shell::PowerShell => "powershell",
        _ => anyhow::bail!("unsupported shell"),
    };
    unsafe { std::env::set_var("COMPLETE", shell_name) };
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    Ok(())
}
