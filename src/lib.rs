#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::unnecessary_map_or)] // map_or can be clearer than alternatives

// Module declarations
pub mod commands;
pub mod config;
pub mod file_storage;
pub mod github;
pub mod implementation;
pub mod llm;
pub mod models;
pub mod session;
pub mod shutdown;
pub mod utils;

// Server module (HTTP API)
pub mod server;

pub use models::*;

use commands::ImplementationManagerState;

/// Reconcile sessions left live by a previous process.
///
/// RUNNING sessions become STUCK; INITIALIZING and WAITING_FEEDBACK sessions
/// get a fresh runner. Failures are logged and never stop startup.
pub fn perform_auto_recovery(state: &ImplementationManagerState) {
    match state.recover_sessions() {
        Ok(results) if results.is_empty() => {
            log::debug!("Auto-recovery complete: no interrupted sessions found");
        }
        Ok(results) => {
            log::info!(
                "Auto-recovery complete: {} sessions recovered",
                results.len()
            );
        }
        Err(e) => {
            log::warn!("Auto-recovery failed: {}", e);
        }
    }
}
