use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Check if a local port is accepting connections (tunnel is healthy).
pub fn check_port(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(300)).is_ok()
}

/// Check several ports at once, so one render waits for the slowest port
/// rather than the sum of them. Results are in the order of `ports`.
pub fn check_ports(ports: &[u16]) -> Vec<bool> {
    thread::scope(|scope| {
        let checks: Vec<_> = ports
            .iter()
            .map(|&port| scope.spawn(move || check_port(port)))
            .collect();
        checks
            .into_iter()
            .map(|c| c.join().unwrap_or(false))
            .collect()
    })
}

/// Check if a local port is free (not already bound by another process).
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
