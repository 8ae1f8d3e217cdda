//! Restart-on-crash wrapper for the link daemon.
//!
//! `sbdlink supervise` runs `sbdlink serve` as a child process and brings it
//! back up whenever it dies abnormally, pacing crash loops with exponential
//! backoff (a child that stays up past the stable threshold resets the
//! pace). A clean exit stops the supervisor. One signal-relay task runs for
//! the whole session and forwards SIGINT/SIGTERM to whichever child is
//! current.
//!
//! The restart path never respawns immediately: the daemon holds the serial
//! device exclusively, and the next instance cannot open it until the dying
//! one has released the fd. The backoff pause doubles as that settle time.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{error, info, warn};

use sbdlink::config::SupervisorConfig;

/// Run the supervisor loop. Returns only through `std::process::exit`.
pub async fn run_supervisor(config_path: Option<&str>, sup: &SupervisorConfig) -> ! {
    let exe = std::env::current_exe().expect("resolve own executable path");
    let stable_after = Duration::from_secs(sup.stable_threshold);

    let current_pid = Arc::new(AtomicI32::new(0));
    spawn_signal_relay(Arc::clone(&current_pid));

    let mut delay = 1u64;
    let mut restarts = 0u32;

    loop {
        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(path) = config_path {
            cmd.args(["--config", path]);
        }
        let mut child = cmd.spawn().expect("failed to spawn link daemon");

        #[allow(clippy::cast_possible_wrap)]
        current_pid.store(child.id().unwrap_or(0) as i32, Ordering::Relaxed);
        info!(
            "Supervisor: daemon up (pid {:?}, restart #{restarts})",
            child.id()
        );

        let started = Instant::now();
        let status = child.wait().await;
        current_pid.store(0, Ordering::Relaxed);
        let uptime = started.elapsed();

        match status {
            Ok(code) if code.success() => {
                info!("Daemon exited cleanly, supervisor stopping");
                std::process::exit(0);
            }
            Ok(code) => warn!(
                "Daemon died ({code}) after {:.1}s, next start in {delay}s",
                uptime.as_secs_f64()
            ),
            Err(e) => error!(
                "Daemon wait failed ({e}) after {:.1}s, next start in {delay}s",
                uptime.as_secs_f64()
            ),
        }

        restarts += 1;
        // Also the serial-port settle time before the respawn reopens it.
        tokio::time::sleep(Duration::from_secs(delay)).await;
        delay = if uptime >= stable_after {
            1
        } else {
            (delay * 2).min(sup.max_backoff)
        };
    }
}

/// Forward SIGINT/SIGTERM to the current child, so the operator's ^C lands
/// on the daemon and not just on the wrapper. A pid of 0 means no child is
/// alive at the moment; the signal is dropped rather than sent to a process
/// group.
fn spawn_signal_relay(current_pid: Arc<AtomicI32>) {
    tokio::spawn(async move {
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("register SIGINT");
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("register SIGTERM");
        loop {
            let signum = tokio::select! {
                _ = sigint.recv() => libc::SIGINT,
                _ = sigterm.recv() => libc::SIGTERM,
            };
            let pid = current_pid.load(Ordering::Relaxed);
            if pid > 0 {
                info!("Supervisor: relaying signal {signum} to pid {pid}");
                // SAFETY: plain kill(2) on a pid this process spawned.
                unsafe {
                    libc::kill(pid, signum);
                }
            }
        }
    });
}
