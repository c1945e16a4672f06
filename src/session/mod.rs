// Session lifecycle helpers outside the implementation loop

pub mod recovery;

pub use recovery::{RecoveryAction, RecoveryResult, SessionRecovery, INTERRUPTED_REASON};
