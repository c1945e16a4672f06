//! Server application state shared across handlers

use crate::commands::implementation::ImplementationManagerState;
use crate::shutdown::ShutdownState;
use std::sync::Arc;

#[derive(Clone)]
pub struct ServerAppState {
    /// Bearer token required on `/api/` routes
    pub auth_token: String,

    pub shutdown_state: ShutdownState,

    /// Implementation sessions and their runners
    pub implementation_state: Arc<ImplementationManagerState>,
}

impl ServerAppState {
    pub fn new(
        auth_token: String,
        shutdown_state: ShutdownState,
        implementation_state: Arc<ImplementationManagerState>,
    ) -> Self {
        Self {
            auth_token,
            shutdown_state,
            implementation_state,
        }
    }
}
