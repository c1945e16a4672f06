//! Command routing modules
//!
//! Commands are grouped by domain. Only implementation sessions exist today:
//! - implementation_routes: session lifecycle, history and row registration

pub mod implementation_routes;

use serde_json::Value;

use super::ServerAppState;

// =============================================================================
// Argument helpers
// =============================================================================

/// Extract a required argument from JSON args
pub fn get_arg<T: serde::de::DeserializeOwned>(args: &Value, name: &str) -> Result<T, String> {
    serde_json::from_value(
        args.get(name)
            .ok_or_else(|| format!("Missing argument: {}", name))?
            .clone(),
    )
    .map_err(|e| format!("Invalid argument {}: {}", name, e))
}

/// Extract an optional argument from JSON args
pub fn get_opt_arg<T: serde::de::DeserializeOwned>(
    args: &Value,
    name: &str,
) -> Result<Option<T>, String> {
    match args.get(name) {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| format!("Invalid argument {}: {}", name, e)),
        _ => Ok(None),
    }
}

// =============================================================================
// Command Routing Macros
// =============================================================================

/// Routes an async command: awaits the handler and serializes the result
#[macro_export]
macro_rules! route_async {
    ($cmd:expr, $handler:expr) => {{
        let result = $handler.await?;
        serde_json::to_value(result).map_err(|e| format!("{}: {}", $cmd, e))
    }};
}

/// Routes a sync command
#[macro_export]
macro_rules! route_sync {
    ($handler:expr) => {{
        let result = $handler?;
        serde_json::to_value(result).map_err(|e| e.to_string())
    }};
}

pub use route_async;
pub use route_sync;

// =============================================================================
// Main Command Dispatcher
// =============================================================================

/// Route a command to the sub-router that owns it
pub async fn route_command(
    cmd: &str,
    args: Value,
    state: &ServerAppState,
) -> Result<Value, String> {
    if implementation_routes::is_implementation_command(cmd) {
        return implementation_routes::route_implementation_command(cmd, args, state).await;
    }

    Err(format!("Unknown command: {}", cmd))
}
