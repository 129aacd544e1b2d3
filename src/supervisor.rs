//! Process supervisor: prints the startup banner, runs the control client,
//! and turns the first interrupt signal into a graceful shutdown request.
//! A second interrupt forces an immediate exit.
//!
//! Grounded on `original_source/main.py` (banner text, the
//! `"D" * (terminal_width - 34)` rule lines, the thank-you message) and
//! teacher's `main.rs` signal-handling block (`tokio::signal::unix`,
//! `SignalKind::terminate`/`interrupt`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::control::ControlClient;

fn print_banner() {
    let width = terminal_width();
    let rule = "D".repeat(width.saturating_sub(34).max(10));
    info!("{}", rule);
    info!("Thank you for participating DD@Home,");
    info!("Please read README.md for more information;");
    info!("Edit config.ini to modify your settings.");
    info!("{}", rule);
}

fn terminal_width() -> usize {
    // No terminal-size crate in the dependency set; 80 matches the
    // original's effective width on a typical CI/headless shell.
    80
}

/// Run the worker until shutdown. Installs signal handlers, prints the
/// banner, then drives the control client's reconnect loop to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handlers(shutdown.clone());

    let mut client = ControlClient::new(config, shutdown.clone())?;
    client.run().await;

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handlers(shutdown: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        loop {
            tokio::select! {
                _ = sigterm.recv() => handle_signal("SIGTERM", &shutdown),
                _ = sigint.recv() => handle_signal("SIGINT", &shutdown),
            }
        }
    });
}

#[cfg(windows)]
fn spawn_signal_handlers(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle_signal("Ctrl+C", &shutdown);
            }
        }
    });
}

fn handle_signal(name: &str, shutdown: &Arc<AtomicBool>) {
    if shutdown.swap(true, Ordering::SeqCst) {
        info!("received second {} signal, forcing immediate exit", name);
        std::process::exit(0);
    }
    info!("received {} signal, shutting down gracefully", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_signal_is_detected_via_swap() {
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(!shutdown.swap(true, Ordering::SeqCst));
        assert!(shutdown.swap(true, Ordering::SeqCst));
    }

    #[test]
    fn banner_rule_has_minimum_length() {
        let width: usize = 10;
        let rule = "D".repeat(width.saturating_sub(34).max(10));
        assert_eq!(rule.len(), 10);
    }
}
