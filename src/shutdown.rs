// Graceful shutdown: signal trapping and the end-of-process report

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared shutdown flag polled by the server loop
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            log::info!("Shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// What was still running when the process stopped
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Sessions whose runner was cut off; startup recovery picks them up
    pub interrupted_sessions: Vec<String>,
}

impl ShutdownReport {
    pub fn new(interrupted_sessions: Vec<String>) -> Self {
        Self {
            interrupted_sessions,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.interrupted_sessions.is_empty()
    }

    /// Log the report once the server loop has exited
    pub fn log(&self) {
        if self.is_clean() {
            log::info!("Shutdown complete: no runners in flight");
            return;
        }
        log::warn!(
            "Shutdown complete: {} runner(s) interrupted, they resume on next start",
            self.interrupted_sessions.len()
        );
        for session_id in &self.interrupted_sessions {
            log::warn!("Interrupted session: {}", session_id);
        }
    }
}

/// Register signal handlers for SIGINT (Ctrl+C), SIGTERM and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            let name = match signal {
                SIGINT => "SIGINT (Ctrl+C)",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => continue,
            };
            log::info!("Received {}", name);
            state.request_shutdown();
        }
    });

    log::info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}
