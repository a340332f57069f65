use colored::{ColoredString, Colorize};
use console::{Alignment, Term};
use std::time::Duration;

use crate::health;
use crate::netstats::Throughput;
use crate::process;
use crate::snapshot::StatusSnapshot;
use crate::supervisor::TunnelState;
use crate::tunnel::{RemoteEndpoint, ServiceSpec};

/// Print a formatted list of all configured services.
pub fn print_service_list(services: &[ServiceSpec]) {
    if services.is_empty() {
        println!("{}", "No services configured.".yellow());
        println!("Run `devtun add` to forward your first port.");
        return;
    }

    let w_name = services.iter().map(|s| s.name.len()).max().unwrap_or(0);
    let w_in = services.iter().map(|s| s.inbound().len()).max().unwrap_or(0);

    for (idx, s) in services.iter().enumerate() {
        println!(
            "  {} {}  {}  {} {}",
            format!("{:>2}", idx + 1).cyan(),
            pad(&s.name.blue().bold().to_string(), w_name),
            pad(&s.inbound().green().to_string(), w_in),
            "→".dimmed(),
            s.outbound().magenta()
        );
    }
}

/// Clear the terminal and draw one dashboard frame.
pub fn render_dashboard(
    snap: &StatusSnapshot,
    endpoint: &RemoteEndpoint,
    net: &Throughput,
    interval: Duration,
) {
    let _ = Term::stdout().clear_screen();

    println!("{}", "devtun — SSH port forwarding".cyan().bold());
    println!();

    let checked = snap
        .connectivity
        .last_checked
        .map(|t| format!("checked {} ago", process::format_elapsed(t)))
        .unwrap_or_else(|| "not checked yet".to_string());
    if snap.connectivity.reachable {
        println!(
            "  {} connected to {}  {}",
            "●".green(),
            endpoint.to_string().green().bold(),
            checked.dimmed()
        );
    } else {
        println!(
            "  {} disconnected from {}  {}",
            "○".red(),
            endpoint.to_string().red().bold(),
            checked.dimmed()
        );
    }

    let rate = net.per_second(interval);
    println!();
    println!(
        "  {} {} KB/s   {} {} KB/s   {} {} KB sent, {} KB received",
        "↑".blue(),
        format_kb(rate.bytes_sent),
        "↓".blue(),
        format_kb(rate.bytes_recv),
        "total".dimmed(),
        format_kb(net.total.bytes_sent),
        format_kb(net.total.bytes_recv)
    );

    println!();
    print_tunnel_rows(snap);
    println!();
    println!(
        "  {}/{} running   {}",
        snap.running_count(),
        snap.len(),
        "Ctrl+C to stop".yellow()
    );
}

fn print_tunnel_rows(snap: &StatusSnapshot) {
    if snap.is_empty() {
        println!("  {}", "No tunnels supervised.".yellow());
        return;
    }

    let running_ports: Vec<u16> = snap
        .iter()
        .filter(|t| t.status.state == TunnelState::Running)
        .map(|t| t.spec.local_port)
        .collect();
    let mut port_checks = health::check_ports(&running_ports).into_iter();

    let rows: Vec<Row> = snap
        .iter()
        .map(|t| {
            let running = t.status.state == TunnelState::Running;
            Row {
                name: t.spec.name.clone(),
                inbound: t.spec.inbound(),
                outbound: t.spec.outbound(),
                state: t.status.state,
                since: process::format_elapsed(t.status.since),
                healthy: if running { port_checks.next() } else { None },
                pid: t.status.pid,
                error: t.status.last_error.clone(),
            }
        })
        .collect();

    let w_name = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
    let w_in = rows.iter().map(|r| r.inbound.len()).max().unwrap_or(0);
    let w_out = rows.iter().map(|r| r.outbound.len()).max().unwrap_or(0);
    let w_state = rows
        .iter()
        .map(|r| r.state.to_string().len() + r.since.len() + 1)
        .max()
        .unwrap_or(0);
    let w_health = console::measure_text_width("✓").max(1);

    for row in &rows {
        let bullet = match row.state {
            TunnelState::Running => "●".green(),
            TunnelState::Connecting => "◐".yellow(),
            _ => "○".dimmed(),
        };
        let name = if row.state == TunnelState::Running {
            row.name.green().bold().to_string()
        } else {
            row.name.to_string()
        };
        let state = format!("{} {}", state_colored(row.state), row.since.dimmed());
        let health = match row.healthy {
            Some(true) => pad(&"✓".green().to_string(), w_health),
            Some(false) => pad(&"✗".red().to_string(), w_health),
            None => " ".repeat(w_health),
        };

        let mut suffix = String::new();
        if let Some(p) = row.pid {
            suffix.push_str(&format!("  {}", format!("pid {}", p).dimmed()));
        }
        if row.state != TunnelState::Running {
            if let Some(ref e) = row.error {
                suffix.push_str(&format!("  {}", e.red()));
            }
        }

        println!(
            "  {} {}  {}  {}  {}  {}{}",
            bullet,
            pad(&name, w_name),
            pad(&row.inbound.green().to_string(), w_in),
            pad(&row.outbound.magenta().to_string(), w_out),
            pad(&state, w_state),
            health,
            suffix
        );
    }
}

fn state_colored(state: TunnelState) -> ColoredString {
    let label = state.to_string();
    match state {
        TunnelState::Running => label.green(),
        TunnelState::Connecting => label.yellow(),
        TunnelState::BackoffWaiting => label.red(),
        TunnelState::Idle | TunnelState::Stopped => label.dimmed(),
    }
}

/// Bytes as kilobytes with two decimals.
pub fn format_kb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1024.0)
}

/// Pad an ANSI-colored string to a visible width using console's awareness of escape codes.
fn pad(s: &str, width: usize) -> String {
    console::pad_str(s, width, Alignment::Left, None).to_string()
}

struct Row {
    name: String,
    inbound: String,
    outbound: String,
    state: TunnelState,
    since: String,
    healthy: Option<bool>,
    pid: Option<u32>,
    error: Option<String>,
}
